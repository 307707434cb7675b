//! # hearsay
//! Gossip based cluster membership for building distributed data systems in Rust.
//!
//! This is a convenience package which includes all of the sub-projects within
//! hearsay, realistically you probably only want some of these projects:
//!
//! ### Features
//! - `hearsay_membership` - Gossip membership, failure detection and the node runtime.
//! - `hearsay_election` - Oldest-member leader election built on top of the membership view.

#[cfg(feature = "hearsay-membership")]
pub use hearsay_membership as membership;
#[cfg(feature = "hearsay-election")]
pub use hearsay_election as election;
