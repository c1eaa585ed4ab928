//! Cascade Finality Detector
//!
//! Safety oracle over the block DAG. Finality is tracked relative to the last finalized block
//! (LFB): every main child of the LFB is a *branch*, and every bonded validator votes for the
//! branch its messages build on.
//!
//! ```text
//! new block ──▶ VotingMatrix::add_block ──▶ find_committee
//!                                               │
//!                          quorum q, fault f:   2 (q - f) > total weight ?
//!                                               │ yes
//!                                               ▼
//!                         branch finalized, matrix rebuilt from the new LFB
//! ```
//!
//! `f` is the stake of validators already caught equivocating; they cannot be counted as
//! honest members of a committee.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod detector;
pub mod matrix;

pub use detector::{FinalityDetector, FinalityStatus, FinalizedBlock};
pub use matrix::{Committee, LevelZeroVote, VotingMatrix};

use alloy_primitives::B256;
use cascade_dag::InvariantViolation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Finality configuration constants
pub mod config {
    /// Fault tolerance above which a pending block is reported final
    pub const DEFAULT_FAULT_TOLERANCE_THRESHOLD: f64 = 0.5;
}

/// Finality detector settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FinalityConfig {
    /// Threshold used by [`FinalityDetector::is_final`], in `[-1, 1]`
    pub fault_tolerance_threshold: f64,
}

impl Default for FinalityConfig {
    fn default() -> Self {
        Self { fault_tolerance_threshold: config::DEFAULT_FAULT_TOLERANCE_THRESHOLD }
    }
}

impl FinalityConfig {
    /// Set the fault tolerance threshold, clamped to `[-1, 1]`
    pub fn with_fault_tolerance_threshold(mut self, threshold: f64) -> Self {
        self.fault_tolerance_threshold = threshold.clamp(-1.0, 1.0);
        self
    }
}

/// Finality errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FinalityError {
    /// The block is not in the DAG snapshot
    #[error("block {0} not found")]
    UnknownBlock(B256),

    /// The DAG contradicts itself
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config = FinalityConfig::default();
        assert_eq!(config.fault_tolerance_threshold, 0.5);
        assert_eq!(config.with_fault_tolerance_threshold(3.0).fault_tolerance_threshold, 1.0);

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<FinalityConfig>(&json).unwrap(), config);
    }
}
