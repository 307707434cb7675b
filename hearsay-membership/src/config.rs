use std::net::SocketAddr;
use std::time::Duration;

use crate::error::MembershipError;

/// The largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Clone)]
/// Configuration for the cluster network.
pub struct ConnectionConfig {
    /// The binding address for the gossip socket to bind and listen on.
    ///
    /// This is often `0.0.0.0` + your chosen port.
    pub listen_addr: SocketAddr,

    /// The public address to be broadcast to other cluster members.
    ///
    /// This is normally the machine's public IP address and the port the socket is listening on.
    /// It becomes part of the node's identity.
    pub public_addr: SocketAddr,

    /// The address of the introducer every node knows ahead of time.
    ///
    /// New and restarted nodes learn about the group by periodically sending their
    /// view directly to the introducer. The introducer itself does not negotiate.
    pub introducer_addr: SocketAddr,
}

impl ConnectionConfig {
    /// Creates a new connection config.
    pub fn new(
        listen_addr: SocketAddr,
        public_addr: SocketAddr,
        introducer_addr: SocketAddr,
    ) -> Self {
        Self {
            listen_addr,
            public_addr,
            introducer_addr,
        }
    }

    /// Returns if this node is the group's introducer.
    pub fn is_introducer(&self) -> bool {
        self.introducer_addr == self.public_addr
            || self.introducer_addr == self.listen_addr
    }
}

#[derive(Debug, Clone)]
/// The timing and sizing parameters of the gossip protocol.
///
/// The time based parameters must keep
/// `gossip_interval < fail_timeout < cleanup_timeout`, ideally with a wide
/// margin between each, otherwise healthy members are flagged as failed
/// before their heartbeat has a chance to propagate.
pub struct GossipConfig {
    /// How often the local heartbeat is incremented and the view is pushed
    /// to one random live peer.
    pub gossip_interval: Duration,

    /// How often non-introducer nodes send their view directly to the introducer.
    pub introducer_negotiate_interval: Duration,

    /// How long a member can go without a heartbeat increase before it is marked as failed.
    pub fail_timeout: Duration,

    /// How long a member can go without a heartbeat increase before it is removed
    /// from the membership list.
    pub cleanup_timeout: Duration,

    /// The number of random peers the leave message is sent to on shutdown.
    pub leave_fanout: usize,

    /// How far ahead of the local heartbeat the leave message's heartbeat is set.
    ///
    /// A leave entry only replaces an alive entry if its heartbeat is strictly
    /// greater, this must exceed the number of heartbeat increments of the local
    /// node which may still be in flight in other members' gossip.
    pub leave_heartbeat_margin: u64,

    /// The largest snapshot the node will send or accept.
    pub max_datagram_size: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(150),
            introducer_negotiate_interval: Duration::from_secs(2),
            fail_timeout: Duration::from_secs(2),
            cleanup_timeout: Duration::from_secs(5),
            leave_fanout: 1,
            leave_heartbeat_margin: 10,
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

impl GossipConfig {
    /// Checks the configuration can produce a working failure detector.
    pub fn validate(&self) -> Result<(), MembershipError> {
        if self.gossip_interval.is_zero() {
            return Err(MembershipError::InvalidConfig(
                "gossip_interval must be greater than zero".into(),
            ));
        }

        if self.introducer_negotiate_interval.is_zero() {
            return Err(MembershipError::InvalidConfig(
                "introducer_negotiate_interval must be greater than zero".into(),
            ));
        }

        if self.gossip_interval >= self.fail_timeout {
            return Err(MembershipError::InvalidConfig(format!(
                "gossip_interval ({:?}) must be less than fail_timeout ({:?})",
                self.gossip_interval, self.fail_timeout,
            )));
        }

        if self.fail_timeout >= self.cleanup_timeout {
            return Err(MembershipError::InvalidConfig(format!(
                "fail_timeout ({:?}) must be less than cleanup_timeout ({:?})",
                self.fail_timeout, self.cleanup_timeout,
            )));
        }

        if self.leave_heartbeat_margin == 0 {
            return Err(MembershipError::InvalidConfig(
                "leave_heartbeat_margin must be at least 1".into(),
            ));
        }

        if self.max_datagram_size == 0 || self.max_datagram_size > MAX_DATAGRAM_SIZE {
            return Err(MembershipError::InvalidConfig(format!(
                "max_datagram_size must be within 1..={MAX_DATAGRAM_SIZE}",
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        GossipConfig::default()
            .validate()
            .expect("Default config should be valid");
    }

    #[test]
    fn test_timeouts_must_be_ordered() {
        let cfg = GossipConfig {
            fail_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(MembershipError::InvalidConfig(_))
        ));

        let cfg = GossipConfig {
            cleanup_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(MembershipError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_leave_margin_must_be_positive() {
        let cfg = GossipConfig {
            leave_heartbeat_margin: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_introducer_detection() {
        let introducer: SocketAddr = ([127, 0, 0, 1], 7000).into();
        let other: SocketAddr = ([127, 0, 0, 1], 7001).into();

        assert!(ConnectionConfig::new(introducer, introducer, introducer).is_introducer());
        assert!(!ConnectionConfig::new(other, other, introducer).is_introducer());
    }
}
