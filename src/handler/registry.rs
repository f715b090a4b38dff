//! Frame handlers and the typed frame router.
//!
//! A [`DataHandler`] receives every decoded frame. Plain closures
//! `Fn(&str, Value) -> HandlerResult` are handlers; [`FrameRouter`] is a
//! handler that dispatches by frame type to callbacks taking a deserialized
//! payload type.
//!
//! # Example
//!
//! ```
//! use peerlink::handler::{DataHandler, FrameRouter};
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Deserialize)]
//! struct Move {
//!     x: i32,
//!     y: i32,
//! }
//!
//! let router = FrameRouter::new().route("move", |m: Move| {
//!     assert_eq!((m.x, m.y), (3, 4));
//!     Ok(())
//! });
//!
//! router.on_data("move", json!({"x": 3, "y": 4})).unwrap();
//! assert!(router.on_data("jump", json!({})).is_err());
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{LinkError, Result};

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Receiver of decoded frames.
///
/// Called synchronously from the session's read loop, in wire order, so a
/// slow handler delays the next read. Errors are reported through the
/// session's error hook and the loop keeps running.
pub trait DataHandler: Send + Sync + 'static {
    /// Handle one frame.
    fn on_data(&self, frame_type: &str, payload: Value) -> HandlerResult;
}

impl<F> DataHandler for F
where
    F: Fn(&str, Value) -> HandlerResult + Send + Sync + 'static,
{
    fn on_data(&self, frame_type: &str, payload: Value) -> HandlerResult {
        self(frame_type, payload)
    }
}

/// Callback taking a payload already converted to its concrete type.
trait Route: Send + Sync {
    fn call(&self, payload: Value) -> HandlerResult;
}

/// Wrapper that deserializes the payload before calling the callback.
struct TypedRoute<F, T>
where
    F: Fn(T) -> HandlerResult + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    callback: F,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T> Route for TypedRoute<F, T>
where
    F: Fn(T) -> HandlerResult + Send + Sync + 'static,
    T: DeserializeOwned + 'static,
{
    fn call(&self, payload: Value) -> HandlerResult {
        let parsed: T = serde_json::from_value(payload)?;
        (self.callback)(parsed)
    }
}

type Fallback = Box<dyn Fn(&str, Value) -> HandlerResult + Send + Sync>;

/// Handler dispatching frames by type name.
///
/// Several callbacks may listen to the same type; they run in registration
/// order and the first error stops the rest for that frame.
#[derive(Default)]
pub struct FrameRouter {
    routes: HashMap<String, Vec<Box<dyn Route>>>,
    fallback: Option<Fallback>,
}

impl FrameRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback for `frame_type`, deserializing payloads into `T`.
    pub fn route<F, T>(mut self, frame_type: &str, callback: F) -> Self
    where
        F: Fn(T) -> HandlerResult + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        self.add_route(frame_type, callback);
        self
    }

    /// Add a callback for `frame_type` on an existing router.
    pub fn add_route<F, T>(&mut self, frame_type: &str, callback: F)
    where
        F: Fn(T) -> HandlerResult + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        self.routes
            .entry(frame_type.to_string())
            .or_default()
            .push(Box::new(TypedRoute {
                callback,
                _phantom: PhantomData,
            }));
    }

    /// Remove every callback for `frame_type`. Returns how many were removed.
    pub fn remove_routes(&mut self, frame_type: &str) -> usize {
        self.routes.remove(frame_type).map_or(0, |r| r.len())
    }

    /// Handle frames no route matches instead of failing them.
    pub fn fallback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(callback));
        self
    }

    /// Check whether any callback listens to `frame_type`.
    pub fn has_route(&self, frame_type: &str) -> bool {
        self.routes.contains_key(frame_type)
    }
}

impl DataHandler for FrameRouter {
    fn on_data(&self, frame_type: &str, payload: Value) -> HandlerResult {
        match self.routes.get(frame_type) {
            Some(routes) => {
                let (last, rest) = match routes.split_last() {
                    Some(split) => split,
                    None => return Ok(()),
                };
                for route in rest {
                    route.call(payload.clone())?;
                }
                last.call(payload)
            }
            None => match &self.fallback {
                Some(fallback) => fallback(frame_type, payload),
                None => Err(LinkError::UnknownFrameType(frame_type.to_string())),
            },
        }
    }
}
