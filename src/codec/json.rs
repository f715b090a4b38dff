//! Default `"<type>!<json>"` codec.
//!
//! The type is everything before the first `!`; the rest is JSON text and
//! may itself contain `!`. Types containing `!` are rejected on encode since
//! they could never decode back to the same frame.

use serde_json::Value;

use super::{Frame, FrameCodec};
use crate::error::{LinkError, Result};

/// Separator between frame type and JSON payload.
pub const TYPE_SEPARATOR: char = '!';

/// Text codec producing `type!json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrameCodec;

impl FrameCodec for JsonFrameCodec {
    fn encode(&self, frame_type: &str, payload: &Value) -> Result<String> {
        if frame_type.contains(TYPE_SEPARATOR) {
            return Err(LinkError::Encode(format!(
                "frame type {frame_type:?} contains the '{TYPE_SEPARATOR}' separator"
            )));
        }

        let json = serde_json::to_string(payload).map_err(|e| LinkError::Encode(e.to_string()))?;

        Ok(format!("{frame_type}{TYPE_SEPARATOR}{json}"))
    }

    fn decode(&self, wire: &str) -> Result<Frame> {
        let (frame_type, json) = wire.split_once(TYPE_SEPARATOR).ok_or_else(|| {
            LinkError::Decode(format!("missing '{TYPE_SEPARATOR}' separator in {wire:?}"))
        })?;

        let payload: Value =
            serde_json::from_str(json).map_err(|e| LinkError::Decode(e.to_string()))?;

        Ok(Frame::new(frame_type, payload))
    }
}
