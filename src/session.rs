//! Session builder and lifecycle.
//!
//! The [`SessionBuilder`] collects the codec, peer matcher and lifecycle
//! hooks. The [`Session`] then cycles through:
//! 1. `Idle` - nothing bound
//! 2. `Listening` - handshake in progress (see [`crate::transport::establish`])
//! 3. `Established` - connection owned, read loop running, `send`/`stop` live
//! 4. `Closed` - connection released; `start_listening` starts a new cycle
//!
//! A handshake timeout returns the session to `Idle`.
//!
//! # Example
//!
//! ```ignore
//! use peerlink::handler::HandlerResult;
//! use peerlink::{EndpointConfig, Session};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> peerlink::Result<()> {
//!     let config = EndpointConfig::builder().local_port(50001).peer_port(50002).build()?;
//!     let session = Session::builder(config)
//!         .on_timeout(|| eprintln!("timeout"))
//!         .on_stopped(|| eprintln!("stopped"))
//!         .build();
//!
//!     let connected = session
//!         .start_listening(|frame_type: &str, payload: Value| -> HandlerResult {
//!             println!("{frame_type}: {payload}");
//!             Ok(())
//!         }, false)
//!         .await?;
//!
//!     if connected {
//!         session.send("test", &json!({"testValue0": 334})).await?;
//!         session.stop().await;
//!     }
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::codec::{FrameCodec, JsonFrameCodec};
use crate::config::EndpointConfig;
use crate::error::{LinkError, Result};
use crate::handler::{DataHandler, EventHooks};
use crate::runner::DuplexRunner;
use crate::transport::{establish, Accepted, PeerMatcher, PortMatcher};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Longest wait for the sentinel write during shutdown.
const SENTINEL_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest wait for queued writes to drain before the write half is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake or connection.
    Idle,
    /// Waiting for the peer to connect.
    Listening,
    /// Connected; frames flow both ways.
    Established,
    /// The last connection ended.
    Closed,
}

/// Why the last connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally with [`Session::stop`].
    Stopped,
    /// The peer sent the sentinel.
    Sentinel,
    /// Nothing arrived within the receive timeout.
    ReceiveTimeout,
    /// The peer closed or reset the connection.
    PeerClosed,
    /// A read failed for another reason.
    Io,
    /// Replaced by an overwriting `start_listening`.
    Overwritten,
}

/// Builder for configuring and creating a [`Session`].
pub struct SessionBuilder {
    config: EndpointConfig,
    codec: Arc<dyn FrameCodec>,
    matcher: Option<Arc<dyn PeerMatcher>>,
    hooks: EventHooks,
}

impl SessionBuilder {
    /// Create a builder with the default codec and a port matcher for
    /// `config.peer_port()`.
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            codec: Arc::new(JsonFrameCodec),
            matcher: None,
            hooks: EventHooks::new(),
        }
    }

    /// Replace the wire codec.
    pub fn codec<C: FrameCodec>(mut self, codec: C) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Replace the peer matcher used by the handshake.
    pub fn peer_matcher<M: PeerMatcher>(mut self, matcher: M) -> Self {
        self.matcher = Some(Arc::new(matcher));
        self
    }

    /// Called once per handshake timeout and once per receive timeout.
    pub fn on_timeout<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.set_on_timeout(hook);
        self
    }

    /// Called once when the peer ends the session with the sentinel.
    pub fn on_stopped<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.set_on_stopped(hook);
        self
    }

    /// Called for malformed frames, handler errors and a lost peer.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&LinkError) + Send + Sync + 'static,
    {
        self.hooks.set_on_error(hook);
        self
    }

    /// Build the session in the `Idle` state.
    pub fn build(self) -> Session {
        let matcher = self
            .matcher
            .unwrap_or_else(|| Arc::new(PortMatcher::new(self.config.peer_port())));

        Session {
            shared: Arc::new(Shared {
                config: self.config,
                codec: self.codec,
                matcher,
                hooks: Arc::new(self.hooks),
                handshake_lock: tokio::sync::Mutex::new(()),
                inner: Mutex::new(Inner::new()),
            }),
        }
    }
}

/// A single-peer TCP session.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Create a new session builder.
    pub fn builder(config: EndpointConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Listen for the peer and start the read loop once it connects.
    ///
    /// With `overwriting`, an established connection is closed (without the
    /// sentinel) or a pending handshake is cancelled before the new
    /// handshake starts. Without it, an active session is left untouched.
    ///
    /// Returns `Ok(true)` once established and `Ok(false)` if the
    /// establishment timeout elapsed (the timeout hook has fired and the
    /// session is back to `Idle`).
    ///
    /// # Errors
    ///
    /// - [`LinkError::AlreadyConnecting`] if listening or established and
    ///   `overwriting` is false
    /// - [`LinkError::Cancelled`] if a later overwriting call superseded
    ///   this handshake
    /// - [`LinkError::Io`] if the listener cannot bind or accept
    pub async fn start_listening<H>(&self, handler: H, overwriting: bool) -> Result<bool>
    where
        H: DataHandler,
    {
        let handler: Arc<dyn DataHandler> = Arc::new(handler);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let (previous, generation) = {
            let mut inner = self.shared.lock();

            if !overwriting
                && matches!(
                    inner.state,
                    SessionState::Listening | SessionState::Established
                )
            {
                return Err(LinkError::AlreadyConnecting);
            }

            if let Some(cancel) = inner.handshake_cancel.take() {
                tracing::info!("Cancelling pending handshake");
                let _ = cancel.send(());
            }

            let previous = inner.take_link(CloseReason::Overwritten);
            inner.generation += 1;
            inner.state = SessionState::Listening;
            inner.peer_addr = None;
            inner.handshake_cancel = Some(cancel_tx);

            (previous, inner.generation)
        };

        let guard = ListeningGuard {
            shared: self.shared.as_ref(),
            generation,
        };

        if let Some(link) = previous {
            tracing::info!("Closing connection to {} for overwrite", link.peer_addr);
            link.close(true).await;
        }

        // A cancelled handshake holds this until its listener is gone
        let outcome = {
            let _listening = self.shared.handshake_lock.lock().await;
            establish(&self.shared.config, self.shared.matcher.as_ref(), cancel_rx).await
        };

        let mut inner = self.shared.lock();
        if inner.generation != generation {
            return Err(LinkError::Cancelled);
        }
        inner.handshake_cancel = None;

        match outcome {
            Ok(accepted) => {
                let link = self.spawn_link(accepted, generation, handler);
                tracing::info!("Session established with {}", link.peer_addr);

                inner.peer_addr = Some(link.peer_addr);
                inner.link = Some(link);
                inner.state = SessionState::Established;
                inner.close_reason = None;
                guard.disarm();
                Ok(true)
            }
            Err(LinkError::HandshakeTimeout(limit)) => {
                inner.state = SessionState::Idle;
                guard.disarm();
                drop(inner);

                tracing::warn!("No peer connected within {:?}", limit);
                self.shared.hooks.timeout();
                Ok(false)
            }
            Err(e) => {
                inner.state = SessionState::Idle;
                guard.disarm();
                Err(e)
            }
        }
    }

    /// Encode and send a frame to the peer.
    ///
    /// Returns `Ok(false)` without sending if the session is not established.
    ///
    /// # Errors
    ///
    /// - [`LinkError::Encode`] if the payload cannot be encoded
    /// - [`LinkError::Io`] / [`LinkError::PeerClosed`] if the write fails
    pub async fn send<T>(&self, frame_type: &str, payload: &T) -> Result<bool>
    where
        T: Serialize + ?Sized,
    {
        let writer = match self.shared.writer() {
            Some(w) => w,
            None => return Ok(false),
        };

        let value =
            serde_json::to_value(payload).map_err(|e| LinkError::Encode(e.to_string()))?;
        let wire = self.shared.codec.encode(frame_type, &value)?;

        tracing::trace!("Sending {} bytes of {:?}", wire.len(), frame_type);
        writer.send(Bytes::from(wire)).await?;
        Ok(true)
    }

    /// Send the sentinel and close the connection.
    ///
    /// Returns `false` if the session was not established. The sentinel is
    /// best effort: the connection closes even if it cannot be written.
    /// Returns once the read loop has exited.
    pub async fn stop(&self) -> bool {
        let link = {
            let mut inner = self.shared.lock();
            if inner.state != SessionState::Established {
                return false;
            }
            inner.take_link(CloseReason::Stopped)
        };

        let mut link = match link {
            Some(link) => link,
            None => return false,
        };

        tracing::info!("Stopping session with {}", link.peer_addr);
        // Reader first: nothing is dispatched while the sentinel waits on the writer
        link.halt_reader();
        link.send_sentinel(self.shared.config.sentinel()).await;
        link.close(true).await;
        true
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Check whether frames can currently be sent.
    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// Remote address of the current or most recent peer.
    ///
    /// Cleared when a new handshake starts.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().peer_addr
    }

    /// Why the most recent connection ended, if it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.lock().close_reason
    }

    /// The endpoint configuration.
    pub fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }

    fn spawn_link(
        &self,
        accepted: Accepted,
        generation: u64,
        handler: Arc<dyn DataHandler>,
    ) -> ActiveLink {
        let Accepted { stream, peer_addr } = accepted;
        let (reader, write_half) = stream.into_split();

        let (writer, writer_task) = spawn_writer_task(write_half);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let runner = DuplexRunner::new(
            Arc::downgrade(&self.shared),
            generation,
            &self.shared.config,
            self.shared.codec.clone(),
            handler,
            self.shared.hooks.clone(),
        );
        let runner_task = tokio::spawn(runner.run(reader, shutdown_rx));

        ActiveLink {
            generation,
            peer_addr,
            writer,
            writer_task,
            shutdown: Some(shutdown_tx),
            runner: runner_task,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Session")
            .field("state", &inner.state)
            .field("peer_addr", &inner.peer_addr)
            .field("close_reason", &inner.close_reason)
            .finish()
    }
}

/// State shared between session handles and the read loop.
pub(crate) struct Shared {
    config: EndpointConfig,
    codec: Arc<dyn FrameCodec>,
    matcher: Arc<dyn PeerMatcher>,
    hooks: Arc<EventHooks>,
    /// Held for the lifetime of a listener.
    handshake_lock: tokio::sync::Mutex<()>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether the link of `generation` is still the live one.
    pub(crate) fn owns(&self, generation: u64) -> bool {
        matches!(&self.lock().link, Some(link) if link.generation == generation)
    }

    fn writer(&self) -> Option<WriterHandle> {
        let inner = self.lock();
        match (&inner.state, &inner.link) {
            (SessionState::Established, Some(link)) => Some(link.writer.clone()),
            _ => None,
        }
    }

    /// Close the link of `generation` from inside its own read loop.
    ///
    /// Returns `false` if that link is already gone (stopped, overwritten or
    /// closed by an earlier call).
    pub(crate) async fn close_link(
        &self,
        generation: u64,
        reason: CloseReason,
        send_sentinel: bool,
    ) -> bool {
        let link = {
            let mut inner = self.lock();
            let owned = matches!(&inner.link, Some(link) if link.generation == generation);
            if owned {
                inner.take_link(reason)
            } else {
                None
            }
        };

        let mut link = match link {
            Some(link) => link,
            None => return false,
        };

        tracing::info!("Session with {} closed: {:?}", link.peer_addr, reason);
        link.halt_reader();
        if send_sentinel {
            link.send_sentinel(self.config.sentinel()).await;
        }
        // Called from the runner itself, which must not join its own task
        link.close(false).await;
        true
    }
}

struct Inner {
    state: SessionState,
    /// Bumped by every `start_listening`.
    generation: u64,
    link: Option<ActiveLink>,
    handshake_cancel: Option<oneshot::Sender<()>>,
    peer_addr: Option<SocketAddr>,
    close_reason: Option<CloseReason>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            generation: 0,
            link: None,
            handshake_cancel: None,
            peer_addr: None,
            close_reason: None,
        }
    }

    fn take_link(&mut self, reason: CloseReason) -> Option<ActiveLink> {
        let link = self.link.take()?;
        self.state = SessionState::Closed;
        self.close_reason = Some(reason);
        Some(link)
    }
}

/// The connection owned by an established session.
struct ActiveLink {
    generation: u64,
    peer_addr: SocketAddr,
    writer: WriterHandle,
    writer_task: JoinHandle<()>,
    /// Taken by the first `halt_reader`.
    shutdown: Option<oneshot::Sender<()>>,
    runner: JoinHandle<()>,
}

impl ActiveLink {
    /// Signal the read loop to exit at its next poll.
    fn halt_reader(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    async fn send_sentinel(&self, sentinel: &str) {
        match tokio::time::timeout(SENTINEL_TIMEOUT, self.writer.send_text(sentinel)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Sentinel not delivered: {}", e),
            Err(_) => tracing::debug!("Sentinel write timed out"),
        }
    }

    /// Release both halves of the connection.
    async fn close(mut self, join_runner: bool) {
        self.halt_reader();

        let ActiveLink {
            writer,
            mut writer_task,
            runner,
            ..
        } = self;

        drop(writer);

        if tokio::time::timeout(CLOSE_GRACE, &mut writer_task)
            .await
            .is_err()
        {
            writer_task.abort();
        }

        if join_runner {
            if let Err(e) = runner.await {
                tracing::error!("Read loop task failed: {}", e);
            }
        }
    }
}

/// Puts the session back to `Idle` if `start_listening` is dropped mid-handshake.
struct ListeningGuard<'a> {
    shared: &'a Shared,
    generation: u64,
}

impl ListeningGuard<'_> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for ListeningGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if inner.generation == self.generation && inner.state == SessionState::Listening {
            inner.state = SessionState::Idle;
            inner.handshake_cancel = None;
        }
    }
}
