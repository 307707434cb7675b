use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::list::MembershipList;
use crate::MemberState;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the membership system.
pub struct ClusterStatistics(Arc<ClusterStatisticsInner>);

impl Deref for ClusterStatistics {
    type Target = ClusterStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct ClusterStatisticsInner {
    /// The number of currently alive members the node is aware of, including itself.
    pub(crate) num_live_members: Counter,
    /// The number of members the node currently believes have failed.
    pub(crate) num_failed_members: Counter,
    /// The number of members which announced they are leaving and are not yet cleaned up.
    pub(crate) num_left_members: Counter,
    /// The number of gossip rounds the node has completed.
    pub(crate) num_gossip_rounds: Counter,
    /// The number of snapshots received and merged into the local view.
    pub(crate) num_merged_snapshots: Counter,
}

impl ClusterStatisticsInner {
    /// The number of currently alive members the node is aware of, including itself.
    pub fn num_live_members(&self) -> u64 {
        self.num_live_members.load(Ordering::Relaxed)
    }

    /// The number of members the node currently believes have failed.
    pub fn num_failed_members(&self) -> u64 {
        self.num_failed_members.load(Ordering::Relaxed)
    }

    /// The number of members which announced they are leaving and are not yet cleaned up.
    pub fn num_left_members(&self) -> u64 {
        self.num_left_members.load(Ordering::Relaxed)
    }

    /// The number of gossip rounds the node has completed.
    pub fn num_gossip_rounds(&self) -> u64 {
        self.num_gossip_rounds.load(Ordering::Relaxed)
    }

    /// The number of snapshots received and merged into the local view.
    pub fn num_merged_snapshots(&self) -> u64 {
        self.num_merged_snapshots.load(Ordering::Relaxed)
    }

    pub(crate) fn record_view(&self, view: &MembershipList) {
        self.num_live_members
            .store(view.count(MemberState::Alive) as u64, Ordering::Relaxed);
        self.num_failed_members
            .store(view.count(MemberState::Fail) as u64, Ordering::Relaxed);
        self.num_left_members
            .store(view.count(MemberState::Leave) as u64, Ordering::Relaxed);
    }
}
