use std::sync::Arc;

use hearsay_membership::{
    Identity,
    ListenerRegistry,
    MemberStateChange,
    MembershipList,
    SubscriptionId,
};
use parking_lot::Mutex;

/// Receives the new leader every time the elected leader changes.
///
/// Listeners are called synchronously, one leader change at a time. They may
/// query the elector, but must not subscribe new listeners.
pub trait LeaderListener: Send + Sync + 'static {
    fn on_leader_change(&self, leader: &Identity);
}

impl<F> LeaderListener for F
where
    F: Fn(&Identity) + Send + Sync + 'static,
{
    fn on_leader_change(&self, leader: &Identity) {
        (self)(leader)
    }
}

#[derive(Default)]
struct ElectorState {
    leader: Option<Identity>,
    listeners: ListenerRegistry<dyn LeaderListener>,
    membership_subscription: Option<SubscriptionId>,
}

/// The election state machine.
///
/// When called from a membership listener the membership lock is already
/// held, so the elector locks are always taken after it. `notify` is taken
/// before `state`, and `state` is never held while listeners run.
pub(crate) struct ElectorInner {
    self_id: Identity,
    notify: Mutex<()>,
    state: Mutex<ElectorState>,
}

impl ElectorInner {
    pub(crate) fn new(self_id: Identity) -> Self {
        Self {
            self_id,
            notify: Mutex::new(()),
            state: Mutex::new(ElectorState::default()),
        }
    }

    pub(crate) fn leader(&self) -> Option<Identity> {
        self.state.lock().leader
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.leader() == Some(self.self_id)
    }

    /// Selects the oldest alive member of the view as the leader.
    pub(crate) fn elect(&self, view: &MembershipList) {
        let leader = view.oldest_alive_member();
        let _notify = self.notify.lock();

        let (previous, listeners) = {
            let mut state = self.state.lock();
            let previous = state.leader.replace(leader);
            if previous == Some(leader) {
                return;
            }
            (previous, state.listeners.iter().cloned().collect::<Vec<_>>())
        };

        info!(
            self_id = %self.self_id,
            leader = %leader,
            previous_leader = ?previous.map(|id| id.to_string()),
            "Elected new leader."
        );

        for listener in listeners {
            listener.on_leader_change(&leader);
        }
    }

    /// Re-runs the election if the current leader is no longer usable.
    pub(crate) fn on_membership_change(
        &self,
        view: &MembershipList,
        changes: &[MemberStateChange],
    ) {
        let current = match self.leader() {
            Some(leader) => leader,
            None => return,
        };

        let leader_departed = changes
            .iter()
            .any(|change| change.identity() == &current && change.state().is_departure());

        if leader_departed {
            debug!(self_id = %self.self_id, leader = %current, "Leader has departed, re-electing.");
            self.elect(view);
        }
    }

    /// Adds a new leader listener, replaying the current leader to it if
    /// one has already been elected.
    pub(crate) fn subscribe(&self, listener: impl LeaderListener) -> SubscriptionId {
        let _notify = self.notify.lock();
        let listener = Arc::new(listener);

        let (id, leader) = {
            let mut state = self.state.lock();
            (state.listeners.subscribe(listener.clone()), state.leader)
        };

        if let Some(leader) = leader {
            listener.on_leader_change(&leader);
        }

        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.lock().listeners.unsubscribe(id)
    }

    pub(crate) fn set_membership_subscription(&self, id: SubscriptionId) {
        self.state.lock().membership_subscription = Some(id);
    }

    /// Clears the elected leader and every listener, returning the
    /// membership subscription if the elector had registered one.
    pub(crate) fn reset(&self) -> Option<SubscriptionId> {
        let mut state = self.state.lock();
        state.leader = None;
        state.listeners.clear();
        state.membership_subscription.take()
    }
}
