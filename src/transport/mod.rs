//! Transport module - TCP rendezvous.
//!
//! Provides:
//! - [`establish`] - listen and accept the one connection the [`PeerMatcher`] selects
//! - [`dial`] - connect from a fixed source port (the peer's half of the rendezvous)

mod dial;
mod handshake;

pub use dial::dial;
pub use handshake::{establish, Accepted, PeerMatcher, PortMatcher};
