use std::sync::Arc;

use crate::list::MembershipList;
use crate::MemberStateChange;

/// Receives every batch of membership changes produced by the node.
///
/// Listeners are called synchronously by the task which changed the
/// membership list while it still holds the list lock, so the view
/// passed in is exactly the one the changes were produced against.
/// Listeners must return quickly and must not call back into the node.
pub trait MembershipListener: Send + Sync + 'static {
    fn on_membership_change(&self, view: &MembershipList, changes: &[MemberStateChange]);
}

impl<F> MembershipListener for F
where
    F: Fn(&MembershipList, &[MemberStateChange]) + Send + Sync + 'static,
{
    fn on_membership_change(&self, view: &MembershipList, changes: &[MemberStateChange]) {
        (self)(view, changes)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
/// A unique handle to a registered listener which can be used to unsubscribe it.
pub struct SubscriptionId(u64);

/// A set of listeners in the order they subscribed.
pub struct ListenerRegistry<L: ?Sized> {
    next_id: u64,
    listeners: Vec<(SubscriptionId, Arc<L>)>,
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self {
            next_id: 0,
            listeners: Vec::new(),
        }
    }
}

impl<L: ?Sized> ListenerRegistry<L> {
    /// Adds a new listener to the registry.
    pub fn subscribe(&mut self, listener: Arc<L>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Removes a listener from the registry, returning if it was present.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        before != self.listeners.len()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Iterates over the listeners in subscription order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<L>> {
        self.listeners.iter().map(|(_, listener)| listener)
    }
}
