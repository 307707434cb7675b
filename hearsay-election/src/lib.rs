//! # Hearsay Election
//! Leader election on top of the gossip membership view.
//!
//! The leader is the alive member which joined the group first. Every node
//! runs the same election against its own view, so once views converge every
//! node agrees on the leader. This is not a consensus protocol, two nodes with
//! diverging views may briefly disagree.
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use hearsay_membership::{ConnectionConfig, MembershipNodeBuilder};
//! use hearsay_election::LeaderElectorExtension;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let addr = "127.0.0.1:8080".parse::<SocketAddr>().unwrap();
//!     let connection_cfg = ConnectionConfig::new(addr, addr, addr);
//!     let node = MembershipNodeBuilder::new(connection_cfg).connect().await?;
//!
//!     let elector = node.add_extension(LeaderElectorExtension::new()).await?;
//!     elector.subscribe(|leader: &hearsay_membership::Identity| {
//!         println!("New leader: {leader}");
//!     });
//!
//!     elector.shutdown().await;
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate tracing;

mod elector;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
pub use elector::LeaderListener;
use hearsay_membership::{
    ClusterExtension,
    Identity,
    MemberStateChange,
    MembershipError,
    MembershipHandle,
    MembershipList,
    MembershipNode,
    SubscriptionId,
};
use tokio::task::JoinHandle;

use crate::elector::ElectorInner;

/// How long the elector waits for the membership to settle before the first election.
pub const DEFAULT_SETTLE_DELAY: Duration = if cfg!(test) {
    Duration::from_millis(200)
} else {
    Duration::from_secs(3)
};

/// Adds a leader elector to a membership node.
pub struct LeaderElectorExtension {
    settle_delay: Duration,
}

impl Default for LeaderElectorExtension {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderElectorExtension {
    /// Creates a new extension using the default settle delay.
    pub fn new() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    /// Set how long to wait after starting before the first election.
    ///
    /// This should be long enough for the node to learn about the
    /// existing members through the introducer.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

#[async_trait]
impl ClusterExtension for LeaderElectorExtension {
    type Output = LeaderElector;
    type Error = MembershipError;

    async fn init_extension(
        self,
        node: &MembershipNode,
    ) -> Result<Self::Output, Self::Error> {
        let handle = node.handle();

        if handle.is_stopped() {
            return Err(MembershipError::Extension(anyhow::anyhow!(
                "Cannot start leader election on a stopped node."
            )));
        }

        Ok(LeaderElector::start(handle, self.settle_delay))
    }
}

/// Tracks the leader of the group.
///
/// The elector must be shut down before the node it is attached to.
pub struct LeaderElector {
    inner: Arc<ElectorInner>,
    node: MembershipHandle,
    election: JoinHandle<()>,
}

impl LeaderElector {
    fn start(node: MembershipHandle, settle_delay: Duration) -> Self {
        let inner = Arc::new(ElectorInner::new(*node.me()));

        info!(
            self_id = %node.me(),
            settle_delay = ?settle_delay,
            "Starting leader election."
        );

        let election = tokio::spawn(run_initial_election(
            node.clone(),
            inner.clone(),
            settle_delay,
        ));

        Self {
            inner,
            node,
            election,
        }
    }

    #[inline]
    /// The current leader, if one has been elected yet.
    pub fn leader(&self) -> Option<Identity> {
        self.inner.leader()
    }

    #[inline]
    /// Returns if this node is currently the leader.
    pub fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    /// Registers a listener for every leader change.
    ///
    /// If a leader has already been elected, the listener is called with
    /// it before this returns.
    pub fn subscribe(&self, listener: impl LeaderListener) -> SubscriptionId {
        self.inner.subscribe(listener)
    }

    /// Removes a leader listener, returning if it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Stops the elector.
    ///
    /// A pending election is cancelled, the elector stops observing the
    /// membership and the leader is cleared.
    pub async fn shutdown(self) {
        self.election.abort();
        let _ = self.election.await;

        if let Some(id) = self.inner.reset() {
            self.node.unsubscribe(id).await;
        }

        info!(self_id = %self.node.me(), "Leader election stopped.");
    }
}

async fn run_initial_election(
    node: MembershipHandle,
    inner: Arc<ElectorInner>,
    settle_delay: Duration,
) {
    tokio::time::sleep(settle_delay).await;

    let listener = inner.clone();
    let (subscription, ()) = node
        .subscribe_with(
            move |view: &MembershipList, changes: &[MemberStateChange]| {
                listener.on_membership_change(view, changes)
            },
            |view| inner.elect(view),
        )
        .await;

    inner.set_membership_subscription(subscription);
}
