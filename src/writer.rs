//! Dedicated writer task for outbound frames.
//!
//! The write half of the connection lives in a single task fed by an mpsc
//! channel, so frames from any number of callers reach the socket one at a
//! time and never interleave.
//!
//! # Architecture
//!
//! ```text
//! send()  ─┐
//! stop()  ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► TcpStream (write half)
//! runner  ─┘        ▲                              │
//!                   └──── oneshot (write result) ◄─┘
//! ```
//!
//! Every frame carries a oneshot that the task completes with the result of
//! its write, so I/O errors reach the caller that issued the frame.
//!
//! Frames are written one per `write_all` + flush and never batched: the
//! receiving side treats each read as exactly one frame.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{LinkError, Result};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A frame queued for writing.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Encoded frame bytes.
    pub payload: Bytes,
    done: oneshot::Sender<std::io::Result<()>>,
}

/// Handle for sending frames to the writer task.
///
/// Cloneable; the task exits once every handle is dropped, shutting down the
/// write half.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue `payload` and wait until it has been written.
    ///
    /// # Errors
    ///
    /// - [`LinkError::PeerClosed`] if the writer task is gone
    /// - [`LinkError::Io`] if the write itself failed
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        let (done, written) = oneshot::channel();

        self.tx
            .send(OutboundFrame { payload, done })
            .await
            .map_err(|_| LinkError::PeerClosed)?;

        written.await.map_err(|_| LinkError::PeerClosed)??;
        Ok(())
    }

    /// Queue UTF-8 text and wait until it has been written.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(Bytes::copy_from_slice(text.as_bytes())).await
    }

    /// Check whether the writer task has exited.
    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
pub fn spawn_writer_task<W>(writer: W) -> (WriterHandle, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let task = tokio::spawn(writer_loop(rx, writer));

    (WriterHandle { tx }, task)
}

/// Main writer loop - receives frames and writes them in order.
///
/// Stops at the first failed write; later frames see a closed channel.
async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let result = write_frame(&mut writer, &frame.payload).await;
        let failed = result.is_err();

        if let Err(e) = &result {
            tracing::warn!("Write failed: {}", e);
        }

        // The caller may have stopped waiting
        let _ = frame.done.send(result);

        if failed {
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Write half shutdown: {}", e);
    }
}

async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_send_reaches_reader() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client);

        handle.send_text("hello!{}").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello!{}");
    }

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client);

        for i in 0..5 {
            handle.send_text(&format!("n!{i}")).await.unwrap();
        }
        drop(handle);

        let mut all = String::new();
        server.read_to_string(&mut all).await.unwrap();
        assert_eq!(all, "n!0n!1n!2n!3n!4");
    }

    #[tokio::test]
    async fn test_task_exits_when_handles_dropped() {
        let (client, mut server) = duplex(64);
        let (handle, task) = spawn_writer_task(client);

        drop(handle);
        task.await.unwrap();

        // Write half shut down: reader sees EOF
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_error_surfaces_to_caller() {
        let (client, server) = duplex(64);
        let (handle, task) = spawn_writer_task(client);
        drop(server);

        let err = handle.send_text("x!{}").await.unwrap_err();
        assert!(matches!(err, LinkError::Io(_)));

        task.await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send_text("y!{}").await,
            Err(LinkError::PeerClosed)
        ));
    }
}
