//! Echo endpoint - example of a session that answers every frame.
//!
//! This example demonstrates:
//! - Building a config from the defaults (listen on 50001, peer on 50002)
//! - Routing typed frames with [`FrameRouter`]
//! - Sending from outside the handler through a cloned [`Session`]
//! - Reacting to the sentinel and timeouts through the hooks
//!
//! # Running
//!
//! ```text
//! RUST_LOG=peerlink=debug cargo run --example echo
//! ```
//!
//! Then connect from source port 50002 and send frames, e.g. with a small
//! Python peer:
//!
//! ```python
//! import socket
//! s = socket.socket()
//! s.bind(("127.0.0.1", 50002))
//! s.connect(("127.0.0.1", 50001))
//! s.send(b'say!{"text": "hi"}')
//! print(s.recv(8192))   # echo!{"text":"hi","count":1}
//! s.send(b"end!")
//! print(s.recv(8192))   # end!
//! ```

use peerlink::handler::FrameRouter;
use peerlink::{EndpointConfig, LinkError, Session};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Input of the `say` frame.
#[derive(Deserialize, Debug)]
struct Say {
    text: String,
}

/// Reply sent back as `echo`.
#[derive(Serialize, Debug)]
struct Echo {
    text: String,
    count: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Handlers run on the read loop and cannot await, so replies go
    // through a channel to the main loop
    let (tx, mut rx) = mpsc::unbounded_channel::<Echo>();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<&'static str>();
    let stopped_tx = done_tx.clone();
    let lost_tx = done_tx.clone();

    let session = Session::builder(EndpointConfig::builder().build()?)
        .on_stopped(move || {
            let _ = stopped_tx.send("peer sent the sentinel");
        })
        .on_timeout(move || {
            let _ = done_tx.send("timed out");
        })
        .on_error(move |e| match e {
            LinkError::PeerClosed | LinkError::Io(_) => {
                let _ = lost_tx.send("peer disconnected");
            }
            other => tracing::warn!("Session error: {}", other),
        })
        .build();

    let mut count = 0u64;
    let counter = std::sync::atomic::AtomicU64::new(0);
    let router = FrameRouter::new()
        .route("say", move |say: Say| {
            let count = counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            let _ = tx.send(Echo {
                text: say.text,
                count,
            });
            Ok(())
        })
        .fallback(|frame_type: &str, payload: Value| {
            tracing::info!("Ignoring {} frame: {}", frame_type, payload);
            Ok(())
        });

    tracing::info!(
        "Waiting for peer port {} on {}:{}",
        session.config().peer_port(),
        session.config().local_host(),
        session.config().local_port()
    );

    if !session.start_listening(router, false).await? {
        tracing::warn!("No peer connected");
        return Ok(());
    }

    loop {
        tokio::select! {
            Some(echo) = rx.recv() => {
                count = echo.count;
                if !session.send("echo", &echo).await? {
                    break;
                }
            }
            Some(why) = done_rx.recv() => {
                tracing::info!("Session over: {}", why);
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                session.stop().await;
                break;
            }
        }
    }

    tracing::info!("Echoed {} frames", count);
    Ok(())
}
