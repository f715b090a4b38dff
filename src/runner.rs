//! Background read loop for an established session.
//!
//! One [`DuplexRunner`] task runs per established connection. Each pass:
//!
//! 1. Read up to `buffer_size` bytes, bounded by the receive timeout
//! 2. Sentinel text: close the session, fire `on_stopped`, exit
//! 3. Anything else: decode and hand to the [`DataHandler`]; decode and
//!    handler failures go to the error hook and the loop carries on
//! 4. Timeout: fire `on_timeout`, close the session, exit
//! 5. EOF or read error: close the session, report to the error hook, exit
//!
//! Each read is treated as exactly one frame; nothing is buffered across
//! reads.
//!
//! A local `stop()` or overwrite fires the shutdown signal, which wins over a
//! pending read so the loop exits without touching the hooks. A read that
//! completes after the link was taken is dropped the same way.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;

use crate::codec::FrameCodec;
use crate::config::EndpointConfig;
use crate::error::LinkError;
use crate::handler::{DataHandler, EventHooks};
use crate::session::{CloseReason, Shared};

/// Result of one bounded read.
#[derive(Debug)]
enum ReadOutcome {
    Data(usize),
    Eof,
    TimedOut(Duration),
    Failed(std::io::Error),
}

/// Read loop bound to one link generation of a session.
pub(crate) struct DuplexRunner {
    session: Weak<Shared>,
    generation: u64,
    codec: Arc<dyn FrameCodec>,
    handler: Arc<dyn DataHandler>,
    hooks: Arc<EventHooks>,
    sentinel: String,
    buffer_size: usize,
    receive_timeout: Option<Duration>,
}

impl DuplexRunner {
    pub(crate) fn new(
        session: Weak<Shared>,
        generation: u64,
        config: &EndpointConfig,
        codec: Arc<dyn FrameCodec>,
        handler: Arc<dyn DataHandler>,
        hooks: Arc<EventHooks>,
    ) -> Self {
        Self {
            session,
            generation,
            codec,
            handler,
            hooks,
            sentinel: config.sentinel().to_string(),
            buffer_size: config.buffer_size(),
            receive_timeout: config.receive_timeout(),
        }
    }

    /// Main read loop - reads frames and dispatches them until the link closes.
    pub(crate) async fn run<R>(self, mut reader: R, mut shutdown: oneshot::Receiver<()>)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let outcome = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::debug!("Read loop {} shut down", self.generation);
                    return;
                }
                outcome = read_once(&mut reader, &mut buf, self.receive_timeout) => outcome,
            };

            match outcome {
                ReadOutcome::Data(n) => {
                    if self.on_bytes(&buf[..n]).await {
                        return;
                    }
                }
                ReadOutcome::TimedOut(limit) => {
                    if !self.owns_link() {
                        return;
                    }
                    tracing::warn!("{}, closing session", LinkError::ReceiveTimeout(limit));
                    self.hooks.timeout();
                    self.close(CloseReason::ReceiveTimeout, true).await;
                    return;
                }
                ReadOutcome::Eof => {
                    if self.close(CloseReason::PeerClosed, false).await {
                        self.hooks.error(&LinkError::PeerClosed);
                    }
                    return;
                }
                ReadOutcome::Failed(e) => {
                    let reason = if is_peer_loss(&e) {
                        CloseReason::PeerClosed
                    } else {
                        CloseReason::Io
                    };
                    if self.close(reason, false).await {
                        self.hooks.error(&LinkError::Io(e));
                    }
                    return;
                }
            }
        }
    }

    /// Handle one read. Returns `true` when the loop must exit.
    async fn on_bytes(&self, bytes: &[u8]) -> bool {
        // Stopped or overwritten while this read completed
        if !self.owns_link() {
            return true;
        }

        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                self.hooks
                    .error(&LinkError::Protocol(format!("frame is not UTF-8: {e}")));
                return false;
            }
        };

        if text == self.sentinel {
            tracing::info!("Peer sent sentinel");
            if self.close(CloseReason::Sentinel, true).await {
                self.hooks.stopped();
            }
            return true;
        }

        match self.codec.decode(text) {
            Ok(frame) => {
                tracing::trace!("Dispatching {:?}", frame.frame_type);
                if let Err(e) = self.handler.on_data(&frame.frame_type, frame.payload) {
                    tracing::debug!("Handler error for {:?}: {}", frame.frame_type, e);
                    self.hooks.error(&e);
                }
            }
            Err(e) => {
                self.hooks.error(&LinkError::Protocol(e.to_string()));
            }
        }

        false
    }

    fn owns_link(&self) -> bool {
        self.session
            .upgrade()
            .is_some_and(|session| session.owns(self.generation))
    }

    /// Close this runner's link. Returns `false` if it was already closed.
    async fn close(&self, reason: CloseReason, send_sentinel: bool) -> bool {
        match self.session.upgrade() {
            Some(session) => {
                session
                    .close_link(self.generation, reason, send_sentinel)
                    .await
            }
            None => false,
        }
    }
}

async fn read_once<R>(reader: &mut R, buf: &mut [u8], limit: Option<Duration>) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    let read = match limit {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(read) => read,
            Err(_) => return ReadOutcome::TimedOut(limit),
        },
        None => reader.read(buf).await,
    };

    match read {
        Ok(0) => ReadOutcome::Eof,
        Ok(n) => ReadOutcome::Data(n),
        Err(e) => ReadOutcome::Failed(e),
    }
}

fn is_peer_loss(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}
