//! Lifecycle hooks.
//!
//! [`EventHooks`] holds the caller's callbacks for lifecycle events:
//!
//! - `on_timeout` - handshake or receive timeout
//! - `on_stopped` - the peer sent the sentinel
//! - `on_error` - malformed frame, handler failure or lost peer
//!
//! Missing hooks are no-ops, except `on_error` which falls back to a
//! `tracing` warning so failures are never silent.

use crate::error::LinkError;

type Hook = Box<dyn Fn() + Send + Sync>;
type ErrorHook = Box<dyn Fn(&LinkError) + Send + Sync>;

/// Caller-supplied lifecycle callbacks.
#[derive(Default)]
pub struct EventHooks {
    on_timeout: Option<Hook>,
    on_stopped: Option<Hook>,
    on_error: Option<ErrorHook>,
}

impl EventHooks {
    /// Create hooks with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout hook.
    pub fn set_on_timeout<F>(&mut self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_timeout = Some(Box::new(hook));
    }

    /// Set the sentinel-stop hook.
    pub fn set_on_stopped<F>(&mut self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_stopped = Some(Box::new(hook));
    }

    /// Set the error hook.
    pub fn set_on_error<F>(&mut self, hook: F)
    where
        F: Fn(&LinkError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(hook));
    }

    pub(crate) fn timeout(&self) {
        if let Some(hook) = &self.on_timeout {
            hook();
        }
    }

    pub(crate) fn stopped(&self) {
        if let Some(hook) = &self.on_stopped {
            hook();
        }
    }

    pub(crate) fn error(&self, error: &LinkError) {
        match &self.on_error {
            Some(hook) => hook(error),
            None => tracing::warn!("Unhandled session error: {}", error),
        }
    }
}

impl std::fmt::Debug for EventHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHooks")
            .field("on_timeout", &self.on_timeout.is_some())
            .field("on_stopped", &self.on_stopped.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
