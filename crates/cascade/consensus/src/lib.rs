//! Cascade consensus algorithms
//!
//! - [`estimator`]: fork choice, ordering the DAG's tips by validator support
//! - [`effect`]: the `Op`/`Transform` algebra of execution effects
//! - [`merge`]: picking the parents whose effects commute
//! - [`executor`]: the execution engine interface
//!
//! ```text
//!   latest messages ──▶ Estimator ──tips──▶ abstract_merge ──parents──▶ new block
//!                                               │
//!                                  Effect::commutes_with per block
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod effect;
pub mod estimator;
pub mod executor;
pub mod merge;

pub use effect::{Effect, ExecutionEffect, Op, OpMap, Transform};
pub use estimator::Estimator;
pub use executor::{DeployResult, DeployStatus, ExecutionOutcome, Executor, ExecutorError};
pub use merge::{abstract_merge, DagMergeView, MergeDag, MergeResult, RankedHash};
