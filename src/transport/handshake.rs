//! Port-filtered handshake.
//!
//! The listening side binds `(local_host, local_port)` and accepts inbound
//! connections until one comes from an address the [`PeerMatcher`] accepts.
//! Everything else is closed on the spot. The establishment timeout bounds
//! the whole wait, not each accept, so rejected connections never extend it.
//!
//! # Identity
//!
//! The default [`PortMatcher`] identifies the peer purely by its source port.
//! Any local process that can bind that port passes. It is a rendezvous
//! convention between cooperating processes, not authentication; plug in a
//! stricter [`PeerMatcher`] where that matters.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::config::EndpointConfig;
use crate::error::{LinkError, Result};

/// Predicate deciding whether an inbound connection is the intended peer.
pub trait PeerMatcher: Send + Sync + 'static {
    /// Return `true` to accept the connection from `remote`.
    fn matches(&self, remote: &SocketAddr) -> bool;
}

/// Accepts connections whose source port equals the expected peer port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMatcher {
    port: u16,
}

impl PortMatcher {
    /// Create a matcher for the given source port.
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Expected source port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl PeerMatcher for PortMatcher {
    fn matches(&self, remote: &SocketAddr) -> bool {
        remote.port() == self.port
    }
}

impl<F> PeerMatcher for F
where
    F: Fn(&SocketAddr) -> bool + Send + Sync + 'static,
{
    fn matches(&self, remote: &SocketAddr) -> bool {
        self(remote)
    }
}

/// The connection selected by the handshake.
#[derive(Debug)]
pub struct Accepted {
    /// Connected stream with `TCP_NODELAY` set.
    pub stream: TcpStream,
    /// Remote address of the accepted socket.
    pub peer_addr: SocketAddr,
}

/// Listen on the configured address and wait for the peer.
///
/// The listener is dropped before returning, whatever the outcome.
///
/// # Errors
///
/// - [`LinkError::HandshakeTimeout`] if no matching peer connects within
///   the build timeout
/// - [`LinkError::Cancelled`] if `cancel` fires first
/// - [`LinkError::Io`] if binding or accepting fails
pub async fn establish(
    config: &EndpointConfig,
    matcher: &dyn PeerMatcher,
    cancel: oneshot::Receiver<()>,
) -> Result<Accepted> {
    let listener = TcpListener::bind((config.local_host(), config.local_port())).await?;

    tracing::debug!(
        "Listening on {} for peer port {}",
        listener.local_addr()?,
        config.peer_port()
    );

    let wait = async {
        match config.build_timeout() {
            Some(limit) => tokio::time::timeout(limit, accept_matching(&listener, matcher))
                .await
                .map_err(|_| LinkError::HandshakeTimeout(limit))?,
            None => accept_matching(&listener, matcher).await,
        }
    };

    tokio::select! {
        accepted = wait => accepted,
        _ = cancel => Err(LinkError::Cancelled),
    }
}

async fn accept_matching(listener: &TcpListener, matcher: &dyn PeerMatcher) -> Result<Accepted> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;

        if !matcher.matches(&peer_addr) {
            tracing::debug!("Rejecting connection from {}", peer_addr);
            drop(stream);
            continue;
        }

        stream.set_nodelay(true)?;
        tracing::info!("Peer connected from {}", peer_addr);

        return Ok(Accepted { stream, peer_addr });
    }
}
