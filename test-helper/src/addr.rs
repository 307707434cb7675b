use std::net::{SocketAddr, UdpSocket};

/// Gets a new local socket address allocated by the OS.
///
/// The socket is released before returning, so the address is only
/// very likely to still be free when the caller binds it.
pub fn get_unused_addr() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}
