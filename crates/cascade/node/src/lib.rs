//! Cascade Node
//!
//! The [`Casper`] engine wires the consensus components together. Every collaborator (executor,
//! block store, signature verifier, signing key) is handed in through [`CasperBuilder`]; there is
//! no global instance.
//!
//! ```text
//! block ──▶ verify signature ──▶ merge parents ──▶ replay deploys ──▶ BlockDag
//!                                                                       │
//!                                              FinalityDetector ◀───────┘
//!                                                     │
//!                                          watch::Sender<FinalizedBlock>
//! ```
//!
//! Proposal runs the same pipeline forwards: estimator tips, merge, execute, sign.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod casper;
pub mod executor;

pub use casper::{Casper, CasperBuilder};
pub use executor::InMemoryExecutor;

use alloy_primitives::B256;
use cascade_consensus::ExecutorError;
use cascade_dag::{DagError, InvariantViolation, SignatureError};
use cascade_finality::{FinalityConfig, FinalityError};
use thiserror::Error;

/// Node configuration constants
pub mod config {
    /// Maximum number of parents a proposed block cites
    pub const DEFAULT_MAX_PARENTS: usize = 8;
}

/// Casper engine settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CasperConfig {
    /// Upper bound on merge candidates taken from the estimator
    pub max_parents: usize,
    /// Finality detector settings
    pub finality: FinalityConfig,
}

impl Default for CasperConfig {
    fn default() -> Self {
        Self { max_parents: config::DEFAULT_MAX_PARENTS, finality: FinalityConfig::default() }
    }
}

impl CasperConfig {
    /// Set the parent limit, at least one
    pub fn with_max_parents(mut self, max_parents: usize) -> Self {
        self.max_parents = max_parents.max(1);
        self
    }

    /// Set the finality settings
    pub const fn with_finality(mut self, finality: FinalityConfig) -> Self {
        self.finality = finality;
        self
    }
}

/// Errors returned by the Casper engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CasperError {
    /// The DAG refused the block
    #[error(transparent)]
    Dag(#[from] DagError),

    /// Bad block signature
    #[error("Invalid signature: {0}")]
    Signature(#[from] SignatureError),

    /// Execution failed
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Finality tracking failed
    #[error("Finality error: {0}")]
    Finality(#[from] FinalityError),

    /// Internal inconsistency; the node must not continue
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    /// The listed parents are not what merging them yields
    #[error("Parents do not merge: listed {listed:?}, mergeable {merged:?}")]
    InvalidParents {
        /// Parents in the block
        listed: Vec<B256>,
        /// Parents the merge kept
        merged: Vec<B256>,
    },

    /// Replaying the deploys gives another state
    #[error("Post-state mismatch: block has {declared}, replay gives {computed}")]
    PostStateMismatch {
        /// State root in the block
        declared: B256,
        /// State root after replay
        computed: B256,
    },

    /// Replaying the deploys gives other bonds
    #[error("Bonds of block {0} differ from the replayed state")]
    BondsMismatch(B256),

    /// Proposing needs a signing key
    #[error("Node has no validator key")]
    NotAValidator,
}

impl CasperError {
    /// Whether the node state can no longer be trusted
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::Finality(FinalityError::Invariant(_)))
    }
}
