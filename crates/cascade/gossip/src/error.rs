//! Cascade gossip error types

use alloy_primitives::B256;
use cascade_dag::DagError;
use thiserror::Error;

/// Why an importer did not take a block
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImportError {
    /// Block already known
    #[error("Block already known: {0}")]
    AlreadyKnown(B256),

    /// A dependency has to arrive first
    #[error("Missing dependency: {0}")]
    MissingDependency(B256),

    /// The block will never be accepted
    #[error("Invalid block: {0}")]
    Invalid(String),

    /// The importer is in an inconsistent state and must stop
    #[error("Fatal import error: {0}")]
    Fatal(String),
}

impl From<DagError> for ImportError {
    fn from(err: DagError) -> Self {
        match err {
            DagError::AlreadyKnown(hash) => Self::AlreadyKnown(hash),
            DagError::MissingDependency(hash) => Self::MissingDependency(hash),
            other => Self::Invalid(other.to_string()),
        }
    }
}

/// Errors that stop block gossip
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GossipError {
    /// The importer reported a fatal error
    #[error("Importer failed on block {hash}: {reason}")]
    Importer {
        /// Block being imported
        hash: B256,
        /// Importer message
        reason: String,
    },
}
