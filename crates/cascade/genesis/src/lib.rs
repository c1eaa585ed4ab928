//! Cascade Genesis Tool
//!
//! Creates the parentless block every Cascade DAG starts from.
//!
//! ```text
//! GenesisConfig (JSON)
//! ├── network: mainnet | testnet | devnet
//! ├── timestamp
//! ├── bonds:       validator → stake   (initial validator set)
//! └── allocations: account → balance   (initial state)
//!         │
//!         ▼  Executor::genesis
//! Genesis block: rank 0, no parents, bonds + post-state root
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod builder;
pub mod config;

pub use builder::{Genesis, GenesisBuilder, GenesisFile};
pub use config::{Allocation, Bond, GenesisConfig, NetworkType};

use alloy_primitives::B256;
use cascade_consensus::ExecutorError;
use thiserror::Error;

/// Genesis creation errors
#[derive(Debug, Error)]
pub enum GenesisError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The executor refused the initial state
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// A stored genesis block does not match its configuration
    #[error("Genesis hash mismatch: file has {expected}, config builds {actual}")]
    HashMismatch {
        /// Hash stored in the file
        expected: B256,
        /// Hash rebuilt from the config
        actual: B256,
    },
}

/// Network constants
pub mod constants {
    use alloy_primitives::{keccak256, Address, B256};

    /// Mainnet network ID
    pub const MAINNET_NETWORK_ID: u64 = 7001;

    /// Testnet network ID
    pub const TESTNET_NETWORK_ID: u64 = 7002;

    /// Devnet network ID
    pub const DEVNET_NETWORK_ID: u64 = 7003;

    /// Stake given to every devnet validator
    pub const DEVNET_STAKE: u64 = 100;

    /// Balance given to every devnet validator
    pub const DEVNET_BALANCE: u64 = 1_000_000;

    /// State key of an account balance
    pub fn balance_key(account: &Address) -> B256 {
        let mut data = Vec::with_capacity(36);
        data.extend_from_slice(b"CASCADE_BALANCE:");
        data.extend_from_slice(account.as_slice());
        keccak256(&data)
    }
}
