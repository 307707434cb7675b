//! The datagram transport the gossip engine pushes snapshots over.
//!
//! The engine only ever needs unreliable, unordered delivery of whole
//! datagrams to an address, which keeps the seam small enough to swap
//! the network out for an in-memory implementation in tests.

mod channel;
mod udp;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
pub use channel::{ChannelSocket, ChannelTransport};
pub use udp::{UdpConnection, UdpTransport};

#[async_trait]
/// Opens sockets for the gossip engine.
pub trait Transport: Send + Sync + 'static {
    /// Binds a new socket to the given address.
    async fn open(&self, listen_addr: SocketAddr) -> io::Result<Arc<dyn Socket>>;
}

#[async_trait]
/// A bound datagram socket.
///
/// The socket is shared between the sending jobs and the receiver so
/// both operations only take a shared reference.
pub trait Socket: Send + Sync + 'static {
    /// Sends a single datagram to the target address.
    ///
    /// A successful send gives no guarantee the datagram is delivered.
    async fn send(&self, to: SocketAddr, payload: &[u8]) -> io::Result<()>;

    /// Waits for the next datagram, returning the address it was sent from.
    async fn recv(&self) -> io::Result<(SocketAddr, Vec<u8>)>;
}
