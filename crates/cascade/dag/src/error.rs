//! DAG error types

use alloy_primitives::B256;
use thiserror::Error;

/// Reasons a block is refused by [`BlockDag::insert`](crate::BlockDag::insert).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    /// A parent or justification target is not in the DAG yet. Recoverable: fetch and retry.
    #[error("missing dependency {0}")]
    MissingDependency(B256),

    /// The declared rank is not `1 + max(parent ranks)`
    #[error("rank violation: expected {expected}, got {actual}")]
    RankViolation {
        /// Rank derived from the parents
        expected: u64,
        /// Rank carried by the block
        actual: u64,
    },

    /// The block is structurally invalid and will never be accepted
    #[error("malformed block: {0}")]
    MalformedBlock(String),

    /// The block is already part of the DAG
    #[error("block {0} already known")]
    AlreadyKnown(B256),
}

impl DagError {
    /// Whether inserting the same block later can succeed
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::MissingDependency(_))
    }
}

/// An internal inconsistency detected by an algorithm running on a validated DAG.
///
/// This is a bug upstream of the caller. Consensus results computed past this point would be
/// wrong, so callers abort the operation instead of recovering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invariant violation: {0}")]
pub struct InvariantViolation(pub String);

impl InvariantViolation {
    /// A referenced block is absent from the snapshot
    pub fn unknown_block(hash: B256) -> Self {
        Self(format!("block {hash} referenced but not in the DAG"))
    }
}
