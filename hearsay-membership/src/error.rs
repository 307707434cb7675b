use std::io;

use thiserror::Error;

use crate::snapshot::SnapshotError;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("{0}")]
    /// An IO error has occurred,
    IO(#[from] io::Error),

    #[error("Received a membership snapshot which could not be read: {0}")]
    /// A peer sent a snapshot which could not be decoded.
    ///
    /// The protocol assumes well behaved peers, so this stops the node.
    Snapshot(#[from] SnapshotError),

    #[error("Invalid gossip configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to initialised cluster extension: {0}")]
    Extension(anyhow::Error),
}
