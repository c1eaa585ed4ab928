//! Execution engine interface

use alloy_primitives::{B256, U256};
use cascade_dag::{Deploy, Validator, Weight};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

use crate::effect::ExecutionEffect;

/// Result of a single deploy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployStatus {
    /// Applied
    Success,
    /// Rejected; its operations had no effect
    Failed(String),
}

/// Per-deploy result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    /// Deploy hash
    pub deploy: B256,
    /// What happened
    pub status: DeployStatus,
}

/// Result of executing a batch of deploys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// State root after the successful deploys
    pub post_state: B256,
    /// One entry per input deploy, in order
    pub results: Vec<DeployResult>,
    /// Combined effect of the successful deploys
    pub effect: ExecutionEffect,
}

/// Executor failures. Failed deploys are not errors, see [`DeployStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// The state root is not known to the executor
    #[error("unknown state {0}")]
    UnknownState(B256),

    /// Genesis or bonding data is unusable
    #[error("invalid bonds: {0}")]
    InvalidBonds(String),
}

/// The execution engine the consensus core drives.
pub trait Executor: Send + Sync + fmt::Debug {
    /// Execute deploys on top of `pre_state`
    fn compute_effect(
        &self,
        pre_state: B256,
        deploys: &[Deploy],
    ) -> Result<ExecutionOutcome, ExecutorError>;

    /// Apply an effect to `pre_state`, returning the new root
    fn commit(&self, pre_state: B256, effect: &ExecutionEffect) -> Result<B256, ExecutorError>;

    /// Bonded validators in a state
    fn weight_map(&self, state: B256) -> Result<BTreeMap<Validator, Weight>, ExecutorError>;

    /// Create the initial state
    fn genesis(
        &self,
        bonds: &BTreeMap<Validator, Weight>,
        allocations: &BTreeMap<B256, U256>,
    ) -> Result<(B256, ExecutionEffect), ExecutorError>;
}
