use std::fmt::{Display, Formatter};
use std::time::Instant;

use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

use crate::Identity;

#[repr(u8)]
#[derive(Serialize, Deserialize, Archive, Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[archive_attr(derive(CheckBytes, Debug))]
/// The state of a member which is stored in the membership list and
/// gossiped to other members.
pub enum MemberState {
    /// The member is refreshing its heartbeat.
    Alive,
    /// The member has not been heard from within the fail timeout.
    Fail,
    /// The member has voluntarily left the group.
    Leave,
}

impl Display for MemberState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberState::Alive => write!(f, "ALIVE"),
            MemberState::Fail => write!(f, "FAIL"),
            MemberState::Leave => write!(f, "LEAVE"),
        }
    }
}

#[derive(Debug, Clone)]
/// A single entry in the membership list.
///
/// Members are values, any change to a member produces a new entry
/// which replaces the old one in the list.
pub struct Member {
    identity: Identity,
    heartbeat: u64,
    updated_at: Instant,
    state: MemberState,
}

impl Member {
    pub(crate) fn new(
        identity: Identity,
        heartbeat: u64,
        updated_at: Instant,
        state: MemberState,
    ) -> Self {
        Self {
            identity,
            heartbeat,
            updated_at,
            state,
        }
    }

    #[inline]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[inline]
    /// The highest heartbeat counter observed for this member.
    pub fn heartbeat(&self) -> u64 {
        self.heartbeat
    }

    #[inline]
    /// The local time this entry was last refreshed.
    ///
    /// This is never transmitted to other members.
    pub fn updated_at(&self) -> Instant {
        self.updated_at
    }

    #[inline]
    pub fn state(&self) -> MemberState {
        self.state
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state == MemberState::Alive
    }

    /// Produces a copy of this entry in the given state, keeping the
    /// heartbeat and update time as is.
    pub(crate) fn with_state(&self, state: MemberState) -> Self {
        Self { state, ..self.clone() }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
/// The state a member moved into as part of a membership change.
pub enum ObservedState {
    /// The member joined the group, or came back with a newer heartbeat.
    Alive,
    /// The member was marked as failed.
    Fail,
    /// The member announced that it is leaving the group.
    Leave,
    /// The member was removed from the membership list.
    ///
    /// This state is never stored, it only exists as a change event.
    Cleanup,
}

impl ObservedState {
    #[inline]
    /// Returns if the member is no longer usable after this change.
    pub fn is_departure(&self) -> bool {
        !matches!(self, ObservedState::Alive)
    }
}

impl From<MemberState> for ObservedState {
    fn from(state: MemberState) -> Self {
        match state {
            MemberState::Alive => ObservedState::Alive,
            MemberState::Fail => ObservedState::Fail,
            MemberState::Leave => ObservedState::Leave,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// A change of state of a single member, produced by a merge or update
/// of the membership list.
pub struct MemberStateChange {
    identity: Identity,
    state: ObservedState,
}

impl MemberStateChange {
    pub fn new(identity: Identity, state: impl Into<ObservedState>) -> Self {
        Self {
            identity,
            state: state.into(),
        }
    }

    #[inline]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[inline]
    pub fn state(&self) -> ObservedState {
        self.state
    }
}

impl Display for MemberStateChange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.state {
            ObservedState::Alive => "JOIN",
            ObservedState::Fail => "FAIL",
            ObservedState::Leave => "LEAVE",
            ObservedState::Cleanup => "CLEANUP",
        };

        write!(f, "{kind}: {}", self.identity)
    }
}
