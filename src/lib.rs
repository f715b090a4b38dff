//! # peerlink
//!
//! Single-peer TCP session between two cooperating processes that agree on
//! a pair of ports in advance.
//!
//! The listening side binds a local port and accepts only the connection
//! whose *source* port is the agreed peer port. Once connected, both sides
//! exchange typed text frames (`"<type>!<json>"`) until one sends the
//! sentinel (default `"end!"`) or the receive timeout elapses.
//!
//! ## Architecture
//!
//! - **Handshake** ([`transport`]): port-filtered accept, bounded by the
//!   establishment timeout
//! - **Session** ([`Session`]): owns the connection and the lifecycle state
//! - **Read loop**: background task decoding frames and calling the handler,
//!   bounded by the receive timeout
//! - **Writer**: background task serializing outbound frames
//!
//! ## Example
//!
//! ```ignore
//! use peerlink::handler::FrameRouter;
//! use peerlink::{EndpointConfig, Session};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Hello {
//!     x: i32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> peerlink::Result<()> {
//!     let session = Session::builder(EndpointConfig::builder().build()?)
//!         .on_stopped(|| println!("peer finished"))
//!         .build();
//!
//!     let router = FrameRouter::new().route("hello", |h: Hello| {
//!         println!("x = {}", h.x);
//!         Ok(())
//!     });
//!
//!     if session.start_listening(router, false).await? {
//!         session.send("hello", &serde_json::json!({"x": 1})).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod transport;

mod runner;
mod session;
mod writer;

pub use codec::{Frame, FrameCodec, JsonFrameCodec};
pub use config::{EndpointConfig, EndpointConfigBuilder, EndpointSettings};
pub use error::{LinkError, Result};
pub use handler::{DataHandler, FrameRouter};
pub use session::{CloseReason, Session, SessionBuilder, SessionState};
pub use transport::{PeerMatcher, PortMatcher};
