//! Peer-side dialer.
//!
//! The listening side identifies its peer by source port, so the peer must
//! connect *from* a fixed local port instead of an ephemeral one.
//!
//! # Example
//!
//! ```ignore
//! use peerlink::transport::dial;
//!
//! // Connect from port 50002 to a session listening on 50001.
//! let stream = dial(50002, "127.0.0.1:50001".parse()?).await?;
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::{TcpSocket, TcpStream};

use crate::error::Result;

/// Connect to `remote` from `source_port`.
///
/// The socket is bound with `SO_REUSEADDR` so a port left in `TIME_WAIT`
/// by a previous session can be reused, and `TCP_NODELAY` is set on the
/// connected stream.
pub async fn dial(source_port: u16, remote: SocketAddr) -> Result<TcpStream> {
    let (socket, unspecified) = match remote.ip() {
        IpAddr::V4(_) => (TcpSocket::new_v4()?, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        IpAddr::V6(_) => (TcpSocket::new_v6()?, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
    };

    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::new(unspecified, source_port))?;

    let stream = socket.connect(remote).await?;
    stream.set_nodelay(true)?;

    tracing::debug!("Dialed {} from port {}", remote, source_port);

    Ok(stream)
}
