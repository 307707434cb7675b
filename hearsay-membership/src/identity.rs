use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter, Write};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

#[derive(Serialize, Deserialize, Archive, Debug, Copy, Clone)]
#[archive_attr(derive(CheckBytes))]
/// The unique, immutable identity of a member of the group.
///
/// An identity is made of the address other members gossip to and the
/// time (unix milliseconds) the process joined the group. A process keeps
/// the same identity for as long as it is part of the group, rejoining
/// after a leave always creates a new one.
///
/// Identities are ordered lexicographically on their string form
/// (`{addr}<{joined_at}>`) which gives every node the same ordering for
/// merging sorted member lists.
pub struct Identity {
    addr: SocketAddr,
    joined_at: u64,
}

impl Identity {
    pub fn new(addr: SocketAddr, joined_at: u64) -> Self {
        Self { addr, joined_at }
    }

    /// Creates a new identity for the given address joining at the current time.
    pub fn joining_now(addr: SocketAddr) -> Self {
        Self::new(addr, get_unix_timestamp_ms())
    }

    #[inline]
    /// The address gossip messages for this member are sent to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    /// The time the member joined the group in unix milliseconds.
    pub fn joined_at(&self) -> u64 {
        self.joined_at
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.addr, self.joined_at)
    }
}

impl Identity {
    /// Writes the string form into a stack buffer, ordering and equality
    /// are both defined on these bytes.
    fn key(&self) -> IdentityKey {
        let mut key = IdentityKey {
            buf: [0; IDENTITY_KEY_CAPACITY],
            len: 0,
        };
        // The longest possible string form fits in the buffer.
        let _ = write!(key, "{}<{}>", self.addr, self.joined_at);
        key
    }
}

// `[v6 addr%scope]:port<u64>` is at most 80 bytes.
const IDENTITY_KEY_CAPACITY: usize = 96;

struct IdentityKey {
    buf: [u8; IDENTITY_KEY_CAPACITY],
    len: usize,
}

impl IdentityKey {
    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for IdentityKey {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().as_bytes().hash(state);
    }
}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identity {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.addr == other.addr && self.joined_at == other.joined_at {
            return Ordering::Equal;
        }

        self.key().as_bytes().cmp(other.key().as_bytes())
    }
}

/// Get the current time since the [UNIX_EPOCH] in milliseconds.
pub fn get_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
