use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::{Socket, Transport};
use crate::config::MAX_DATAGRAM_SIZE;

#[derive(Debug, Copy, Clone)]
/// A transport sending snapshots as UDP datagrams.
pub struct UdpTransport {
    max_datagram_size: usize,
}

impl UdpTransport {
    /// Creates a new transport which receives datagrams of up to `max_datagram_size` bytes.
    ///
    /// Larger datagrams are truncated by the OS and will fail to decode.
    pub fn new(max_datagram_size: usize) -> Self {
        Self {
            max_datagram_size: max_datagram_size.min(MAX_DATAGRAM_SIZE),
        }
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new(MAX_DATAGRAM_SIZE)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn open(&self, listen_addr: SocketAddr) -> io::Result<Arc<dyn Socket>> {
        let socket = UdpSocket::bind(listen_addr).await?;
        info!(listen_addr = %listen_addr, "Bound gossip socket.");

        Ok(Arc::new(UdpConnection {
            socket,
            max_datagram_size: self.max_datagram_size,
        }))
    }
}

pub struct UdpConnection {
    socket: UdpSocket,
    max_datagram_size: usize,
}

#[async_trait]
impl Socket for UdpConnection {
    async fn send(&self, to: SocketAddr, payload: &[u8]) -> io::Result<()> {
        let written = self.socket.send_to(payload, to).await?;

        if written != payload.len() {
            return Err(io::Error::new(
                ErrorKind::WriteZero,
                format!("Only sent {written} of {} bytes.", payload.len()),
            ));
        }

        Ok(())
    }

    async fn recv(&self) -> io::Result<(SocketAddr, Vec<u8>)> {
        let mut buffer = vec![0; self.max_datagram_size];
        let (len, from) = self.socket.recv_from(&mut buffer).await?;
        buffer.truncate(len);
        Ok((from, buffer))
    }
}
