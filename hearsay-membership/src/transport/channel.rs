use std::collections::{HashMap, HashSet};
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Socket, Transport};

type Datagram = (SocketAddr, Vec<u8>);

#[derive(Clone, Default)]
/// An in-memory transport connecting every socket opened from it.
///
/// Datagrams sent to an address with no open socket are dropped,
/// just like they would be on a real network. Sockets can be killed
/// with [ChannelTransport::kill] to simulate a crashed process.
pub struct ChannelTransport(Arc<ChannelTransportInner>);

impl Deref for ChannelTransport {
    type Target = ChannelTransportInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Default)]
pub struct ChannelTransportInner {
    next_socket_id: AtomicU64,
    sockets: Mutex<HashMap<SocketAddr, (u64, flume::Sender<Datagram>)>>,
    killed: Mutex<HashSet<SocketAddr>>,
}

impl ChannelTransportInner {
    /// Stops the socket bound to the given address from sending or receiving.
    ///
    /// The address can be opened again afterwards.
    pub fn kill(&self, addr: SocketAddr) {
        self.killed.lock().insert(addr);
        self.sockets.lock().remove(&addr);
    }

    /// The addresses which currently have an open socket.
    pub fn open_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.lock().keys().copied().collect()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn open(&self, listen_addr: SocketAddr) -> io::Result<Arc<dyn Socket>> {
        let (tx, rx) = flume::unbounded();
        let id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut sockets = self.sockets.lock();
            if sockets.contains_key(&listen_addr) {
                return Err(io::Error::new(
                    ErrorKind::AddrInUse,
                    format!("Address {listen_addr} is already open."),
                ));
            }
            sockets.insert(listen_addr, (id, tx));
        }
        self.killed.lock().remove(&listen_addr);

        Ok(Arc::new(ChannelSocket {
            id,
            addr: listen_addr,
            inbox: rx,
            transport: self.clone(),
        }))
    }
}

pub struct ChannelSocket {
    id: u64,
    addr: SocketAddr,
    inbox: flume::Receiver<Datagram>,
    transport: ChannelTransport,
}

impl ChannelSocket {
    fn is_killed(&self) -> bool {
        self.transport.killed.lock().contains(&self.addr)
    }
}

#[async_trait]
impl Socket for ChannelSocket {
    async fn send(&self, to: SocketAddr, payload: &[u8]) -> io::Result<()> {
        if self.is_killed() {
            return Err(io::Error::new(
                ErrorKind::NotConnected,
                "Socket has been killed.",
            ));
        }

        let target = self.transport.sockets.lock().get(&to).map(|(_, tx)| tx.clone());
        if let Some(tx) = target {
            let _ = tx.send((self.addr, payload.to_vec()));
        }

        Ok(())
    }

    async fn recv(&self) -> io::Result<Datagram> {
        self.inbox.recv_async().await.map_err(|_| {
            io::Error::new(ErrorKind::NotConnected, "Socket has been closed.")
        })
    }
}

impl Drop for ChannelSocket {
    fn drop(&mut self) {
        let mut sockets = self.transport.sockets.lock();
        if matches!(sockets.get(&self.addr), Some((id, _)) if *id == self.id) {
            sockets.remove(&self.addr);
        }
    }
}
