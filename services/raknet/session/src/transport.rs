//! UDP socket seam.
//!
//! Sessions and the manager only ever talk to a [`DatagramSocket`]; the tokio
//! UDP socket implements it for real traffic and tests swap in an in-memory
//! socket.

use crate::session::SessionEvent;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Largest UDP payload read in one call
pub const RECV_BUFFER_SIZE: usize = 2048;

/// Send and receive raw datagrams
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send one datagram to `target`
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Local bound address
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Bind a UDP socket
pub async fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    UdpSocket::bind(addr).await
}

/// Unspecified address of the same family as `peer`, port 0
pub fn ephemeral_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Write a session's outbox to the socket and forward its events
pub(crate) async fn deliver(
    socket: &dyn DatagramSocket,
    peer: SocketAddr,
    outbox: Vec<Bytes>,
    events: Vec<SessionEvent>,
    event_tx: &mpsc::UnboundedSender<SessionEvent>,
) {
    for bytes in outbox {
        if let Err(e) = socket.send_to(&bytes, peer).await {
            warn!("Failed to send datagram: peer={}, error={}", peer, e);
        }
    }
    for event in events {
        if event_tx.send(event).is_err() {
            debug!("Event receiver dropped: peer={}", peer);
        }
    }
}
