//! Cascade block DAG
//!
//! Blocks cite several parents (the first one is the *main parent*) and, through their
//! justifications, the latest block of every validator the sender has seen. This crate holds
//! the primitives and the DAG structure the consensus algorithms run on:
//!
//! ```text
//!   Block ──insert──▶ BlockDag ──snapshot──▶ BlockDagRepresentation
//!                        │                       (immutable, Arc shared)
//!                        ▼
//!                hash / children / rank / latest-message indices
//! ```
//!
//! - [`BlockDag`]: the single writer, validates and indexes blocks
//! - [`BlockDagRepresentation`]: read-only snapshot with the query surface
//! - [`BlockStore`] / [`BlockDagStorage`]: block bodies and the shared lock
//! - [`SignatureVerifier`] / [`BlockSigner`]: secp256k1 block signatures

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod block;
mod dag;
mod error;
pub mod signature;
pub mod storage;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use block::{Block, BlockMetadata, Deploy, DeployOp, Validator, Weight};
pub use dag::{BlockDag, BlockDagRepresentation};
pub use error::{DagError, InvariantViolation};
pub use signature::{BlockSigner, Secp256k1Verifier, SignatureError, SignatureVerifier};
pub use storage::{BlockDagStorage, BlockStore, InMemoryBlockStore};
