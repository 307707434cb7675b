use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use smallvec::SmallVec;

use crate::snapshot::{MembershipSnapshot, SnapshotEntry};
use crate::{Identity, Member, MemberState, MemberStateChange, ObservedState};

/// The set of member changes produced by a single merge or update.
pub type StateChanges = SmallVec<[MemberStateChange; 4]>;

#[derive(Debug, Clone)]
/// The local view of the group.
///
/// Members are kept sorted by identity with no duplicates, which lets two
/// views be merged in a single linear pass. The entry of the local node is
/// always present.
///
/// The list is only changed by [MembershipList::merge] and [MembershipList::update],
/// both of which replace entries rather than modifying them.
pub struct MembershipList {
    self_id: Identity,
    members: Vec<Member>,
    fail_timeout: Duration,
    cleanup_timeout: Duration,
}

impl MembershipList {
    /// Creates a new list only containing the local node.
    pub fn new(self_id: Identity, fail_timeout: Duration, cleanup_timeout: Duration) -> Self {
        Self::new_at(self_id, fail_timeout, cleanup_timeout, Instant::now())
    }

    /// Creates a new list only containing the local node, refreshed at `now`.
    pub fn new_at(
        self_id: Identity,
        fail_timeout: Duration,
        cleanup_timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            self_id,
            members: vec![Member::new(self_id, 0, now, MemberState::Alive)],
            fail_timeout,
            cleanup_timeout,
        }
    }

    #[inline]
    /// The identity of the local node.
    pub fn self_id(&self) -> &Identity {
        &self.self_id
    }

    #[inline]
    /// The number of entries in the list, in any state.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[inline]
    /// All entries of the list, sorted by identity.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Gets the entry for a given identity.
    pub fn get(&self, identity: &Identity) -> Option<&Member> {
        self.members
            .binary_search_by(|member| member.identity().cmp(identity))
            .ok()
            .map(|idx| &self.members[idx])
    }

    /// The number of entries currently in the given state.
    pub fn count(&self, state: MemberState) -> usize {
        self.members.iter().filter(|m| m.state() == state).count()
    }

    /// Merges a view received from another member into the local view.
    pub fn merge(&mut self, incoming: &MembershipSnapshot) -> StateChanges {
        self.merge_at(incoming, Instant::now())
    }

    /// Merges a view received from another member into the local view at `now`.
    ///
    /// For members known to both sides the entry with the higher heartbeat wins,
    /// a winning incoming entry is refreshed to `now`. Members only known locally
    /// are kept untouched so they keep decaying. Members only known remotely are
    /// added if they are alive and ignored otherwise, which stops leave and fail
    /// entries from being resurrected after they have been cleaned up.
    pub fn merge_at(&mut self, incoming: &MembershipSnapshot, now: Instant) -> StateChanges {
        let local = std::mem::take(&mut self.members);
        let remote = incoming.entries();

        let mut merged = Vec::with_capacity(local.len() + remote.len());
        let mut changes = StateChanges::new();

        let (mut i, mut j) = (0, 0);
        while i < local.len() && j < remote.len() {
            let ours = &local[i];
            let theirs = &remote[j];

            match ours.identity().cmp(&theirs.identity) {
                Ordering::Equal => {
                    i += 1;
                    j += 1;

                    if theirs.heartbeat > ours.heartbeat() {
                        if theirs.state != ours.state() {
                            changes.push(MemberStateChange::new(
                                theirs.identity,
                                theirs.state,
                            ));
                        }
                        merged.push(Member::new(
                            theirs.identity,
                            theirs.heartbeat,
                            now,
                            theirs.state,
                        ));
                    } else {
                        merged.push(ours.clone());
                    }
                },
                Ordering::Less => {
                    i += 1;
                    merged.push(ours.clone());
                },
                Ordering::Greater => {
                    j += 1;
                    admit_unknown(theirs, now, &mut merged, &mut changes);
                },
            }
        }

        merged.extend(local[i..].iter().cloned());
        for theirs in &remote[j..] {
            admit_unknown(theirs, now, &mut merged, &mut changes);
        }

        self.members = merged;
        changes
    }

    /// Increments the local heartbeat and ages every other member.
    pub fn update(&mut self) -> StateChanges {
        self.update_at(Instant::now())
    }

    /// Increments the local heartbeat and ages every other member as of `now`.
    ///
    /// Members which have not been refreshed for longer than the cleanup timeout
    /// are removed, alive members which have not been refreshed for longer than
    /// the fail timeout are marked as failed without refreshing their update time.
    pub fn update_at(&mut self, now: Instant) -> StateChanges {
        let local = std::mem::take(&mut self.members);
        let mut updated = Vec::with_capacity(local.len());
        let mut changes = StateChanges::new();

        for member in local {
            if member.identity() == &self.self_id {
                updated.push(Member::new(
                    self.self_id,
                    member.heartbeat() + 1,
                    now,
                    MemberState::Alive,
                ));
                continue;
            }

            let elapsed = now.saturating_duration_since(member.updated_at());
            if elapsed > self.cleanup_timeout {
                changes.push(MemberStateChange::new(
                    *member.identity(),
                    ObservedState::Cleanup,
                ));
            } else if elapsed > self.fail_timeout && member.is_alive() {
                changes.push(MemberStateChange::new(
                    *member.identity(),
                    MemberState::Fail,
                ));
                updated.push(member.with_state(MemberState::Fail));
            } else {
                updated.push(member);
            }
        }

        self.members = updated;
        changes
    }

    /// Produces the view which is gossiped to other members.
    pub fn non_fail_snapshot(&self) -> MembershipSnapshot {
        self.non_fail_snapshot_at(Instant::now())
    }

    /// Produces the view which is gossiped to other members as of `now`.
    ///
    /// Failed members are never gossiped. Members which left are gossiped
    /// until their entry is older than the fail timeout, which bounds how long
    /// a leave announcement circulates.
    pub fn non_fail_snapshot_at(&self, now: Instant) -> MembershipSnapshot {
        let entries = self
            .members
            .iter()
            .filter(|member| match member.state() {
                MemberState::Alive => true,
                MemberState::Fail => false,
                MemberState::Leave => {
                    now.saturating_duration_since(member.updated_at()) <= self.fail_timeout
                },
            })
            .map(to_entry)
            .collect();

        MembershipSnapshot::from_sorted(entries)
    }

    /// The identities of all alive members, including the local node.
    pub fn alive_members(&self) -> Vec<Identity> {
        self.members
            .iter()
            .filter(|member| member.is_alive())
            .map(|member| *member.identity())
            .collect()
    }

    /// The identities of all alive members, excluding the local node.
    pub fn alive_members_excluding_self(&self) -> Vec<Identity> {
        self.members
            .iter()
            .filter(|member| member.is_alive() && member.identity() != &self.self_id)
            .map(|member| *member.identity())
            .collect()
    }

    /// Picks a random alive member which is not the local node.
    pub fn random_alive_member<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Identity> {
        self.alive_members_excluding_self().choose(rng).copied()
    }

    /// The alive member which joined the group first, including the local node.
    ///
    /// Ties on the join time are broken by the identity ordering so every
    /// node with the same view picks the same member.
    pub fn oldest_alive_member(&self) -> Identity {
        self.members
            .iter()
            .filter(|member| member.is_alive())
            .map(|member| *member.identity())
            .min_by(|a, b| a.joined_at().cmp(&b.joined_at()).then_with(|| a.cmp(b)))
            .unwrap_or(self.self_id)
    }

    /// Produces the message announcing the local node is leaving the group.
    ///
    /// The heartbeat is set `margin` ahead of the local heartbeat so the leave
    /// entry replaces any alive entry of this node which is still circulating.
    pub fn voluntary_leave_message(&self, margin: u64) -> MembershipSnapshot {
        let heartbeat = self
            .get(&self.self_id)
            .map(|member| member.heartbeat())
            .unwrap_or_default();

        MembershipSnapshot::from_sorted(vec![SnapshotEntry {
            identity: self.self_id,
            heartbeat: heartbeat.saturating_add(margin),
            state: MemberState::Leave,
        }])
    }
}

impl Display for MembershipList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let now = Instant::now();

        writeln!(f, "[")?;
        for member in &self.members {
            let age = now.saturating_duration_since(member.updated_at());
            writeln!(
                f,
                "\t{}\t{}\t{}ms\t{}",
                member.identity(),
                member.heartbeat(),
                age.as_millis(),
                member.state(),
            )?;
        }
        write!(f, "]")
    }
}

fn admit_unknown(
    entry: &SnapshotEntry,
    now: Instant,
    merged: &mut Vec<Member>,
    changes: &mut StateChanges,
) {
    if entry.state != MemberState::Alive {
        return;
    }

    merged.push(Member::new(entry.identity, entry.heartbeat, now, entry.state));
    changes.push(MemberStateChange::new(entry.identity, entry.state));
}

fn to_entry(member: &Member) -> SnapshotEntry {
    SnapshotEntry {
        identity: *member.identity(),
        heartbeat: member.heartbeat(),
        state: member.state(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    const FAIL: Duration = Duration::from_millis(2000);
    const CLEANUP: Duration = Duration::from_millis(5000);

    fn id(port: u16, joined_at: u64) -> Identity {
        Identity::new(([127, 0, 0, 1], port).into(), joined_at)
    }

    fn entry(identity: Identity, heartbeat: u64, state: MemberState) -> SnapshotEntry {
        SnapshotEntry {
            identity,
            heartbeat,
            state,
        }
    }

    fn snapshot(entries: Vec<SnapshotEntry>) -> MembershipSnapshot {
        MembershipSnapshot::from_entries(entries)
    }

    fn list(self_id: Identity, now: Instant) -> MembershipList {
        MembershipList::new_at(self_id, FAIL, CLEANUP, now)
    }

    fn converged(list: &MembershipList) -> BTreeMap<Identity, (u64, MemberState)> {
        list.members()
            .iter()
            .map(|m| (*m.identity(), (m.heartbeat(), m.state())))
            .collect()
    }

    #[test]
    fn test_new_list_contains_only_self() {
        let me = id(8000, 1);
        let list = list(me, Instant::now());

        assert_eq!(list.len(), 1);
        let member = list.get(&me).expect("Self should be present");
        assert_eq!(member.heartbeat(), 0);
        assert_eq!(member.state(), MemberState::Alive);
    }

    #[test]
    fn test_merge_admits_new_alive_members() {
        let now = Instant::now();
        let me = id(8000, 1);
        let peer = id(8001, 2);
        let mut list = list(me, now);

        let changes = list.merge_at(&snapshot(vec![entry(peer, 3, MemberState::Alive)]), now);

        assert_eq!(changes.as_slice(), &[MemberStateChange::new(peer, MemberState::Alive)]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(&peer).map(|m| m.heartbeat()), Some(3));
        assert!(list.members().windows(2).all(|w| w[0].identity() < w[1].identity()));
    }

    #[test]
    fn test_merge_drops_unknown_non_alive_members() {
        let now = Instant::now();
        let me = id(8000, 1);
        let mut list = list(me, now);

        let incoming = snapshot(vec![
            entry(id(7999, 2), 5, MemberState::Leave),
            entry(id(8001, 3), 5, MemberState::Fail),
            entry(id(8002, 4), 5, MemberState::Leave),
        ]);
        let changes = list.merge_at(&incoming, now);

        assert!(changes.is_empty());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_merge_keeps_local_entry_on_equal_or_lower_heartbeat() {
        let start = Instant::now();
        let me = id(8000, 1);
        let peer = id(8001, 2);
        let mut list = list(me, start);
        list.merge_at(&snapshot(vec![entry(peer, 5, MemberState::Alive)]), start);

        let later = start + Duration::from_millis(500);
        let changes = list.merge_at(&snapshot(vec![entry(peer, 5, MemberState::Leave)]), later);
        assert!(changes.is_empty());

        let member = list.get(&peer).unwrap();
        assert_eq!(member.state(), MemberState::Alive);
        assert_eq!(member.updated_at(), start, "Ties must not refresh the entry.");

        let changes = list.merge_at(&snapshot(vec![entry(peer, 4, MemberState::Alive)]), later);
        assert!(changes.is_empty());
        assert_eq!(list.get(&peer).unwrap().heartbeat(), 5);
    }

    #[test]
    fn test_merge_refreshes_on_higher_heartbeat() {
        let start = Instant::now();
        let me = id(8000, 1);
        let peer = id(8001, 2);
        let mut list = list(me, start);
        list.merge_at(&snapshot(vec![entry(peer, 5, MemberState::Alive)]), start);

        let later = start + Duration::from_millis(500);
        let changes = list.merge_at(&snapshot(vec![entry(peer, 6, MemberState::Alive)]), later);

        assert!(changes.is_empty(), "Same state should not produce an event.");
        let member = list.get(&peer).unwrap();
        assert_eq!(member.heartbeat(), 6);
        assert_eq!(member.updated_at(), later);
    }

    #[test]
    fn test_merge_does_not_refresh_local_only_members() {
        let start = Instant::now();
        let me = id(8000, 1);
        let peer = id(8001, 2);
        let other = id(8002, 3);
        let mut list = list(me, start);
        list.merge_at(&snapshot(vec![entry(peer, 5, MemberState::Alive)]), start);

        let later = start + Duration::from_millis(1500);
        list.merge_at(&snapshot(vec![entry(other, 1, MemberState::Alive)]), later);

        assert_eq!(list.get(&peer).unwrap().updated_at(), start);
        assert_eq!(list.get(&other).unwrap().updated_at(), later);
    }

    #[test]
    fn test_merge_is_idempotent_and_commutative() {
        let now = Instant::now();
        let me = id(8000, 1);
        let a = id(8001, 2);
        let b = id(8002, 3);
        let c = id(8003, 4);

        let snapshots = [
            snapshot(vec![entry(a, 3, MemberState::Alive), entry(b, 1, MemberState::Alive)]),
            snapshot(vec![entry(a, 5, MemberState::Alive), entry(c, 2, MemberState::Alive)]),
            snapshot(vec![entry(b, 4, MemberState::Alive), entry(c, 1, MemberState::Alive)]),
        ];

        let mut forward = list(me, now);
        for s in &snapshots {
            forward.merge_at(s, now);
        }

        let mut reversed = list(me, now);
        for s in snapshots.iter().rev() {
            reversed.merge_at(s, now);
            reversed.merge_at(s, now);
        }

        let mut repeated = forward.clone();
        for s in &snapshots {
            assert!(repeated.merge_at(s, now).is_empty());
        }

        assert_eq!(converged(&forward), converged(&reversed));
        assert_eq!(converged(&forward), converged(&repeated));
        assert_eq!(converged(&forward)[&a], (5, MemberState::Alive));
        assert_eq!(converged(&forward)[&b], (4, MemberState::Alive));
        assert_eq!(converged(&forward)[&c], (2, MemberState::Alive));
    }

    #[test]
    fn test_update_increments_self_heartbeat() {
        let start = Instant::now();
        let me = id(8000, 1);
        let mut list = list(me, start);

        let later = start + Duration::from_millis(150);
        assert!(list.update_at(later).is_empty());
        assert!(list.update_at(later).is_empty());

        let member = list.get(&me).unwrap();
        assert_eq!(member.heartbeat(), 2);
        assert_eq!(member.updated_at(), later);
        assert!(member.is_alive());
    }

    #[test]
    fn test_update_fails_member_exactly_once() {
        let start = Instant::now();
        let me = id(8000, 1);
        let peer = id(8001, 2);
        let mut list = list(me, start);
        list.merge_at(&snapshot(vec![entry(peer, 5, MemberState::Alive)]), start);

        assert!(list.update_at(start + FAIL).is_empty(), "Must exceed the timeout.");

        let changes = list.update_at(start + FAIL + Duration::from_millis(1));
        assert_eq!(changes.as_slice(), &[MemberStateChange::new(peer, MemberState::Fail)]);
        let member = list.get(&peer).unwrap();
        assert_eq!(member.state(), MemberState::Fail);
        assert_eq!(member.updated_at(), start, "Failing must not refresh the entry.");

        for step in 2..10 {
            let changes = list.update_at(start + FAIL + Duration::from_millis(step * 100));
            assert!(changes.is_empty());
        }
    }

    #[test]
    fn test_failed_member_only_revives_on_higher_heartbeat() {
        let start = Instant::now();
        let me = id(8000, 1);
        let peer = id(8001, 2);
        let mut list = list(me, start);
        list.merge_at(&snapshot(vec![entry(peer, 5, MemberState::Alive)]), start);

        let failed_at = start + FAIL + Duration::from_millis(1);
        list.update_at(failed_at);

        let changes = list.merge_at(&snapshot(vec![entry(peer, 5, MemberState::Alive)]), failed_at);
        assert!(changes.is_empty());
        assert_eq!(list.get(&peer).unwrap().state(), MemberState::Fail);

        let changes = list.merge_at(&snapshot(vec![entry(peer, 6, MemberState::Alive)]), failed_at);
        assert_eq!(changes.as_slice(), &[MemberStateChange::new(peer, MemberState::Alive)]);
        assert_eq!(list.get(&peer).unwrap().state(), MemberState::Alive);
    }

    #[test]
    fn test_update_cleans_up_member_exactly_once() {
        let start = Instant::now();
        let me = id(8000, 1);
        let peer = id(8001, 2);
        let mut list = list(me, start);
        list.merge_at(&snapshot(vec![entry(peer, 5, MemberState::Alive)]), start);

        list.update_at(start + FAIL + Duration::from_millis(1));

        let evicted_at = start + CLEANUP + Duration::from_millis(1);
        let changes = list.update_at(evicted_at);
        assert_eq!(
            changes.as_slice(),
            &[MemberStateChange::new(peer, ObservedState::Cleanup)]
        );
        assert!(list.get(&peer).is_none());
        assert!(list.update_at(evicted_at + FAIL).is_empty());

        // A stale leave for the evicted member must not bring it back.
        let changes = list.merge_at(&snapshot(vec![entry(peer, 9, MemberState::Leave)]), evicted_at);
        assert!(changes.is_empty());
        assert!(list.get(&peer).is_none());
    }

    #[test]
    fn test_left_members_are_not_failed() {
        let start = Instant::now();
        let me = id(8000, 1);
        let peer = id(8001, 2);
        let mut list = list(me, start);
        list.merge_at(&snapshot(vec![entry(peer, 5, MemberState::Alive)]), start);

        let changes = list.merge_at(&snapshot(vec![entry(peer, 15, MemberState::Leave)]), start);
        assert_eq!(changes.as_slice(), &[MemberStateChange::new(peer, MemberState::Leave)]);
        assert!(list.alive_members().iter().all(|m| m != &peer));

        let changes = list.update_at(start + FAIL + Duration::from_millis(1));
        assert!(changes.is_empty(), "Leave entries decay straight to cleanup.");

        let changes = list.update_at(start + CLEANUP + Duration::from_millis(1));
        assert_eq!(
            changes.as_slice(),
            &[MemberStateChange::new(peer, ObservedState::Cleanup)]
        );
    }

    #[test]
    fn test_voluntary_leave_wins_against_in_flight_heartbeat() {
        let now = Instant::now();
        let leaver = id(8001, 2);
        let observer = id(8000, 1);

        let mut leaver_list = list(leaver, now);
        for _ in 0..20 {
            leaver_list.update_at(now);
        }
        let margin = 10;
        let leave = leaver_list.voluntary_leave_message(margin);
        assert_eq!(leave.len(), 1);
        assert_eq!(leave.entries()[0].heartbeat, 20 + margin);
        assert_eq!(leave.entries()[0].state, MemberState::Leave);

        // The observer receives the leave, then older gossip which was still in flight.
        let in_flight = snapshot(vec![entry(leaver, 20 + margin - 1, MemberState::Alive)]);
        let mut observer_list = list(observer, now);
        observer_list.merge_at(&snapshot(vec![entry(leaver, 18, MemberState::Alive)]), now);
        observer_list.merge_at(&leave, now);
        observer_list.merge_at(&in_flight, now);
        assert_eq!(observer_list.get(&leaver).unwrap().state(), MemberState::Leave);

        // And the other way around.
        let mut observer_list = list(observer, now);
        observer_list.merge_at(&snapshot(vec![entry(leaver, 18, MemberState::Alive)]), now);
        observer_list.merge_at(&in_flight, now);
        let changes = observer_list.merge_at(&leave, now);
        assert_eq!(changes.as_slice(), &[MemberStateChange::new(leaver, MemberState::Leave)]);
        assert_eq!(observer_list.alive_members(), vec![observer]);
    }

    #[test]
    fn test_non_fail_snapshot_filters_members() {
        let start = Instant::now();
        let me = id(8000, 1);
        let alive = id(8001, 2);
        let failed = id(8002, 3);
        let left = id(8003, 4);
        let mut list = list(me, start);

        list.merge_at(
            &snapshot(vec![
                entry(alive, 1, MemberState::Alive),
                entry(failed, 1, MemberState::Alive),
                entry(left, 1, MemberState::Alive),
            ]),
            start,
        );
        list.merge_at(&snapshot(vec![entry(left, 11, MemberState::Leave)]), start);

        let failed_at = start + FAIL + Duration::from_millis(1);
        list.merge_at(&snapshot(vec![entry(alive, 2, MemberState::Alive)]), failed_at);
        list.update_at(failed_at);
        assert_eq!(list.get(&failed).unwrap().state(), MemberState::Fail);

        let ids = |s: MembershipSnapshot| {
            s.entries().iter().map(|e| e.identity).collect::<Vec<_>>()
        };

        let fresh = list.non_fail_snapshot_at(start + Duration::from_millis(10));
        assert_eq!(ids(fresh), vec![me, alive, left]);

        let stale = list.non_fail_snapshot_at(failed_at);
        assert_eq!(ids(stale), vec![me, alive], "Old leave entries stop circulating.");
    }

    #[test]
    fn test_random_alive_member_excludes_self() {
        let now = Instant::now();
        let me = id(8000, 1);
        let peer = id(8001, 2);
        let mut list = list(me, now);
        let mut rng = rand::thread_rng();

        assert_eq!(list.random_alive_member(&mut rng), None);

        list.merge_at(
            &snapshot(vec![
                entry(peer, 1, MemberState::Alive),
                entry(id(8002, 3), 1, MemberState::Alive),
            ]),
            now,
        );
        list.merge_at(&snapshot(vec![entry(id(8002, 3), 2, MemberState::Leave)]), now);

        for _ in 0..50 {
            assert_eq!(list.random_alive_member(&mut rng), Some(peer));
        }
        assert_eq!(list.alive_members_excluding_self(), vec![peer]);
        assert_eq!(list.alive_members(), vec![me, peer]);
    }

    #[test]
    fn test_oldest_alive_member() {
        let now = Instant::now();
        let me = id(8000, 30);
        let oldest = id(8001, 10);
        let middle = id(8002, 20);
        let mut list = list(me, now);

        assert_eq!(list.oldest_alive_member(), me);

        list.merge_at(
            &snapshot(vec![
                entry(oldest, 1, MemberState::Alive),
                entry(middle, 1, MemberState::Alive),
            ]),
            now,
        );
        assert_eq!(list.oldest_alive_member(), oldest);

        list.update_at(now + FAIL + Duration::from_millis(1));
        assert_eq!(list.oldest_alive_member(), me, "Failed members are not eligible.");
    }

    #[test]
    fn test_display_lists_every_member() {
        let me = id(8000, 1);
        let list = list(me, Instant::now());
        let rendered = list.to_string();

        assert!(rendered.starts_with('['));
        assert!(rendered.contains("127.0.0.1:8000<1>\t0\t"));
        assert!(rendered.ends_with("ALIVE\n]"));
    }
}
