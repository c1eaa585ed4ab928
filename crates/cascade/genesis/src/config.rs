//! Genesis configuration types

use alloy_primitives::{Address, B256, U256};
use cascade_dag::{Validator, Weight};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
};

use crate::{constants, GenesisError};

/// Network type for genesis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Production mainnet
    Mainnet,
    /// Public testnet
    Testnet,
    /// Local development
    #[default]
    Devnet,
}

impl NetworkType {
    /// Numeric network identifier
    pub const fn network_id(&self) -> u64 {
        match self {
            Self::Mainnet => constants::MAINNET_NETWORK_ID,
            Self::Testnet => constants::TESTNET_NETWORK_ID,
            Self::Devnet => constants::DEVNET_NETWORK_ID,
        }
    }
}

/// Initial stake of a validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bond {
    /// Validator address
    pub validator: Validator,
    /// Bonded stake, must be positive
    pub stake: Weight,
}

/// An account balance in genesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Account address
    pub account: Address,
    /// Initial balance
    pub balance: U256,
    /// Description/purpose
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Allocation {
    /// Create a new allocation
    pub fn new(account: Address, balance: U256, description: impl Into<String>) -> Self {
        Self { account, balance, description: description.into() }
    }

    /// State key holding the balance
    pub fn key(&self) -> B256 {
        constants::balance_key(&self.account)
    }
}

/// Genesis configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Network type
    pub network: NetworkType,
    /// Genesis timestamp (unix millis)
    pub timestamp: u64,
    /// Initial validator set
    pub bonds: Vec<Bond>,
    /// Account allocations
    #[serde(default)]
    pub allocations: Vec<Allocation>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            network: NetworkType::Devnet,
            timestamp: 0,
            bonds: Vec::new(),
            allocations: Vec::new(),
        }
    }
}

impl GenesisConfig {
    /// Create an empty config for the specified network, stamped with the current time
    pub fn new(network: NetworkType) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64);
        Self { network, timestamp, ..Default::default() }
    }

    /// Devnet with equally staked validators, each funded with the devnet balance
    pub fn devnet(validators: &[Validator]) -> Self {
        let mut config = Self::new(NetworkType::Devnet);
        for validator in validators {
            config = config
                .with_bond(*validator, constants::DEVNET_STAKE)
                .with_allocation(Allocation::new(
                    *validator,
                    U256::from(constants::DEVNET_BALANCE),
                    "devnet validator",
                ));
        }
        config
    }

    /// Add a validator bond
    pub fn with_bond(mut self, validator: Validator, stake: Weight) -> Self {
        self.bonds.push(Bond { validator, stake });
        self
    }

    /// Add an allocation
    pub fn with_allocation(mut self, allocation: Allocation) -> Self {
        self.allocations.push(allocation);
        self
    }

    /// Set the timestamp
    pub const fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Bonds as a weight map
    pub fn bond_map(&self) -> BTreeMap<Validator, Weight> {
        self.bonds.iter().map(|bond| (bond.validator, bond.stake)).collect()
    }

    /// Allocations keyed by state key
    pub fn allocation_map(&self) -> BTreeMap<B256, U256> {
        self.allocations.iter().map(|alloc| (alloc.key(), alloc.balance)).collect()
    }

    /// Calculate total allocated
    pub fn total_allocated(&self) -> U256 {
        self.allocations.iter().fold(U256::ZERO, |acc, a| acc.saturating_add(a.balance))
    }

    /// Total bonded stake
    pub fn total_stake(&self) -> u128 {
        self.bonds.iter().map(|bond| u128::from(bond.stake)).sum()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), GenesisError> {
        if self.bonds.is_empty() {
            return Err(GenesisError::InvalidConfig("no validator bonds".into()));
        }

        let mut validators = HashSet::new();
        for bond in &self.bonds {
            if bond.stake == 0 {
                return Err(GenesisError::InvalidConfig(format!(
                    "zero stake for validator {}",
                    bond.validator
                )));
            }
            if !validators.insert(bond.validator) {
                return Err(GenesisError::InvalidConfig(format!(
                    "duplicate bond for validator {}",
                    bond.validator
                )));
            }
        }

        let mut accounts = HashSet::new();
        for alloc in &self.allocations {
            if !accounts.insert(alloc.account) {
                return Err(GenesisError::InvalidConfig(format!(
                    "duplicate allocation address: {}",
                    alloc.account
                )));
            }
        }

        Ok(())
    }

    /// Load a config from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GenesisError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}
