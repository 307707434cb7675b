//! # Hearsay Membership
//! Decentralised group membership and failure detection using push gossip
//! over unreliable datagrams.
//!
//! Every node keeps a [MembershipList] of the members it knows about. Each
//! gossip round the node increments its own heartbeat, ages every other
//! member and pushes its view to one random alive member. Members whose
//! heartbeat stops increasing are marked as failed after the fail timeout
//! and removed after the cleanup timeout. New nodes find the group by
//! sending their view to a well known introducer.
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use hearsay_membership::{ConnectionConfig, MembershipNodeBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let introducer = "127.0.0.1:7000".parse::<SocketAddr>().unwrap();
//!     let addr = "127.0.0.1:7001".parse::<SocketAddr>().unwrap();
//!     let connection_cfg = ConnectionConfig::new(addr, addr, introducer);
//!
//!     let node = MembershipNodeBuilder::new(connection_cfg).connect().await?;
//!     node.subscribe(|_: &hearsay_membership::MembershipList, changes: &[hearsay_membership::MemberStateChange]| {
//!         for change in changes {
//!             println!("{change}");
//!         }
//!     })
//!     .await;
//!
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate tracing;

mod config;
mod error;
mod extension;
mod gossip;
mod identity;
mod list;
mod listener;
mod member;
mod snapshot;
mod statistics;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

pub use config::{ConnectionConfig, GossipConfig, MAX_DATAGRAM_SIZE};
pub use error::MembershipError;
pub use extension::ClusterExtension;
pub use identity::{get_unix_timestamp_ms, Identity};
pub use list::{MembershipList, StateChanges};
pub use listener::{ListenerRegistry, MembershipListener, SubscriptionId};
pub use member::{Member, MemberState, MemberStateChange, ObservedState};
pub use snapshot::{MembershipSnapshot, SnapshotEntry, SnapshotError};
pub use statistics::ClusterStatistics;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::gossip::{GossipEngine, Shared};
use crate::transport::{Transport, UdpTransport};

/// Build a membership node using provided settings.
pub struct MembershipNodeBuilder {
    connection_cfg: ConnectionConfig,
    gossip_cfg: GossipConfig,
}

impl MembershipNodeBuilder {
    /// Create a new node builder with the default gossip configuration.
    pub fn new(connection_cfg: ConnectionConfig) -> Self {
        Self {
            connection_cfg,
            gossip_cfg: GossipConfig::default(),
        }
    }

    /// Replace the gossip configuration of the node.
    pub fn with_gossip_config(mut self, cfg: GossipConfig) -> Self {
        self.gossip_cfg = cfg;
        self
    }

    /// Set how often the node gossips its view to a random member.
    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_cfg.gossip_interval = interval;
        self
    }

    /// Set how long a member can be silent before it is marked as failed
    /// and before it is removed from the membership list.
    pub fn with_timeouts(mut self, fail_timeout: Duration, cleanup_timeout: Duration) -> Self {
        self.gossip_cfg.fail_timeout = fail_timeout;
        self.gossip_cfg.cleanup_timeout = cleanup_timeout;
        self
    }

    /// Starts the node over UDP, joining the group through the configured introducer.
    ///
    /// The introducer does not need to be live at the time of connecting,
    /// the node keeps negotiating with it until it is shut down.
    pub async fn connect(self) -> Result<MembershipNode, MembershipError> {
        let transport = UdpTransport::new(self.gossip_cfg.max_datagram_size);
        self.connect_with_transport(&transport).await
    }

    /// Starts the node using a custom transport.
    pub async fn connect_with_transport(
        self,
        transport: &dyn Transport,
    ) -> Result<MembershipNode, MembershipError> {
        self.gossip_cfg.validate()?;

        let statistics = ClusterStatistics::default();
        let engine = GossipEngine::start(
            self.connection_cfg,
            self.gossip_cfg,
            transport,
            statistics,
        )
        .await?;

        let handle = MembershipHandle {
            shared: engine.shared().clone(),
        };

        info!(
            self_id = %handle.me(),
            "Membership node connected."
        );

        Ok(MembershipNode { engine, handle })
    }
}

/// A running member of the group.
///
/// Dropping the node without calling [MembershipNode::shutdown] leaves the
/// gossip jobs running until the runtime is stopped.
pub struct MembershipNode {
    engine: GossipEngine,
    handle: MembershipHandle,
}

impl MembershipNode {
    /// Leaves the group and stops every gossip job.
    ///
    /// Any extensions observing the membership should be stopped first.
    pub async fn shutdown(self) -> Result<(), MembershipError> {
        self.engine.shutdown().await
    }

    /// Adds a new extension to the node.
    pub async fn add_extension<E>(&self, extension: E) -> Result<E::Output, E::Error>
    where
        E: ClusterExtension,
    {
        extension.init_extension(self).await
    }

    #[inline]
    /// Creates a handle to the node providing the core functionality of the node.
    pub fn handle(&self) -> MembershipHandle {
        self.handle.clone()
    }

    #[inline]
    /// The identity of the node itself.
    pub fn me(&self) -> &Identity {
        self.handle.me()
    }

    #[inline]
    /// Gets the live membership statistics.
    pub fn statistics(&self) -> ClusterStatistics {
        self.handle.statistics()
    }

    #[inline]
    /// Returns a handle to the alive members watcher channel.
    pub fn members_watcher(&self) -> watch::Receiver<Vec<Identity>> {
        self.handle.members_watcher()
    }

    #[inline]
    /// Return [WatchStream] for monitoring changes of the alive members.
    pub fn member_change_watcher(&self) -> WatchStream<Vec<Identity>> {
        WatchStream::new(self.members_watcher())
    }

    /// Gets the alive members of the group, including the node itself.
    pub async fn alive_members(&self) -> Vec<Identity> {
        self.handle.alive_members().await
    }

    /// Gets a copy of the full membership list.
    pub async fn membership_list(&self) -> MembershipList {
        self.handle.membership_list().await
    }

    /// Registers a listener for every future membership change.
    pub async fn subscribe(&self, listener: impl MembershipListener) -> SubscriptionId {
        self.handle.subscribe(listener).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handle.unsubscribe(id).await
    }

    /// Waits until the node has stopped, either from a call to
    /// [MembershipNode::shutdown] or because a fatal error stopped the gossip.
    pub async fn stopped(&self) {
        self.handle.stopped().await
    }

    /// Convenience method for testing that waits for the predicate to hold true
    /// for the alive members.
    pub async fn wait_for_members<F>(
        &self,
        mut predicate: F,
        timeout_after: Duration,
    ) -> Result<(), anyhow::Error>
    where
        F: FnMut(&[Identity]) -> bool,
    {
        use tokio::time::timeout;

        timeout(
            timeout_after,
            self.member_change_watcher()
                .skip_while(|members| !predicate(members))
                .next(),
        )
        .await?;
        Ok(())
    }
}

#[derive(Clone)]
/// A cheap, clonable handle to a running node.
pub struct MembershipHandle {
    shared: Arc<Shared>,
}

impl MembershipHandle {
    #[inline]
    /// The identity of the node itself.
    pub fn me(&self) -> &Identity {
        &self.shared.self_id
    }

    #[inline]
    /// The gossip configuration the node is running with.
    pub fn gossip_config(&self) -> &GossipConfig {
        &self.shared.config
    }

    #[inline]
    /// Gets the live membership statistics.
    pub fn statistics(&self) -> ClusterStatistics {
        self.shared.statistics.clone()
    }

    #[inline]
    /// Returns a handle to the alive members watcher channel.
    pub fn members_watcher(&self) -> watch::Receiver<Vec<Identity>> {
        self.shared.members_watcher()
    }

    #[inline]
    /// Returns if the node has been told to stop.
    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Waits until the node has stopped.
    pub async fn stopped(&self) {
        self.shared.stopped().await
    }

    /// Runs the given closure against the current membership list.
    ///
    /// The list is locked for the duration of the call.
    pub async fn with_view<F, R>(&self, inspect: F) -> R
    where
        F: FnOnce(&MembershipList) -> R,
    {
        self.shared.with_view(inspect).await
    }

    /// Gets the alive members of the group, including the node itself.
    pub async fn alive_members(&self) -> Vec<Identity> {
        self.with_view(|view| view.alive_members()).await
    }

    /// Gets the alive members of the group, excluding the node itself.
    pub async fn alive_members_excluding_self(&self) -> Vec<Identity> {
        self.with_view(|view| view.alive_members_excluding_self()).await
    }

    /// Gets the alive member which joined the group first.
    pub async fn oldest_alive_member(&self) -> Identity {
        self.with_view(|view| view.oldest_alive_member()).await
    }

    /// Gets a copy of the full membership list.
    pub async fn membership_list(&self) -> MembershipList {
        self.with_view(|view| view.clone()).await
    }

    /// Registers a listener for every future membership change.
    pub async fn subscribe(&self, listener: impl MembershipListener) -> SubscriptionId {
        let (id, _) = self.shared.subscribe_with(listener, |_| ()).await;
        id
    }

    /// Registers a listener and inspects the current view without any
    /// change slipping in between the two.
    pub async fn subscribe_with<L, F, R>(&self, listener: L, inspect: F) -> (SubscriptionId, R)
    where
        L: MembershipListener,
        F: FnOnce(&MembershipList) -> R,
    {
        self.shared.subscribe_with(listener, inspect).await
    }

    /// Removes a listener, returning if it was registered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.unsubscribe(id).await
    }
}
