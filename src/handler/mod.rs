//! Handler module - frame dispatch and lifecycle callbacks.
//!
//! Provides:
//! - [`DataHandler`] - receives every decoded frame
//! - [`FrameRouter`] - maps frame types to typed callbacks
//! - [`EventHooks`] - timeout, stop and error callbacks
//!
//! # Example
//!
//! ```
//! use peerlink::handler::FrameRouter;
//! use serde_json::Value;
//!
//! let router = FrameRouter::new()
//!     .route("log", |line: String| {
//!         println!("{line}");
//!         Ok(())
//!     })
//!     .fallback(|frame_type: &str, _payload: Value| {
//!         println!("ignoring {frame_type}");
//!         Ok(())
//!     });
//! # let _ = router;
//! ```

mod events;
mod registry;

pub use events::EventHooks;
pub use registry::{DataHandler, FrameRouter, HandlerResult};
