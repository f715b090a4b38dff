//! Codec module - frame encoding/decoding.
//!
//! A frame is a `(type, payload)` pair. The wire representation is decided by
//! a [`FrameCodec`] strategy injected into the session at construction, so the
//! wire format can change without touching the handshake or the read loop.
//!
//! - [`JsonFrameCodec`] - the default `"<type>!<json>"` text format
//!
//! # Example
//!
//! ```
//! use peerlink::codec::{FrameCodec, JsonFrameCodec};
//! use serde_json::json;
//!
//! let codec = JsonFrameCodec;
//! let wire = codec.encode("hello", &json!({"x": 1})).unwrap();
//! assert_eq!(wire, r#"hello!{"x":1}"#);
//!
//! let frame = codec.decode(&wire).unwrap();
//! assert_eq!(frame.frame_type, "hello");
//! assert_eq!(frame.payload, json!({"x": 1}));
//! ```

mod json;

pub use json::{JsonFrameCodec, TYPE_SEPARATOR};

use serde_json::Value;

use crate::error::Result;

/// A decoded frame.
///
/// Frames are transient: they exist for one encode or decode call and are
/// handed to the handler by value.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Application-defined frame type.
    pub frame_type: String,
    /// Structured payload.
    pub payload: Value,
}

impl Frame {
    /// Create a new frame.
    pub fn new(frame_type: impl Into<String>, payload: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            payload,
        }
    }
}

/// Wire format strategy.
///
/// Implementations must be stateless or internally synchronized: the same
/// codec is shared by the caller (encode) and the read loop (decode).
pub trait FrameCodec: Send + Sync + 'static {
    /// Encode a frame into the text written to the connection.
    fn encode(&self, frame_type: &str, payload: &Value) -> Result<String>;

    /// Decode the text of one read into a frame.
    fn decode(&self, wire: &str) -> Result<Frame>;
}
