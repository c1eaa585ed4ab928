//! Genesis block builder

use alloy_primitives::{Address, Bytes, B256};
use cascade_consensus::{ExecutionEffect, Executor};
use cascade_dag::{Block, Validator};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};

use crate::{GenesisConfig, GenesisError};

/// A built genesis: the block and the effect that produced its state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Genesis {
    /// The parentless block
    pub block: Block,
    /// Effect of writing the initial state
    pub effect: ExecutionEffect,
}

/// Genesis as written to disk: the inputs and the resulting block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisFile {
    /// Configuration the block was built from
    pub config: GenesisConfig,
    /// Resulting block
    pub block: Block,
}

/// Builder for creating Cascade genesis blocks
#[derive(Debug)]
pub struct GenesisBuilder {
    config: GenesisConfig,
}

impl GenesisBuilder {
    /// Create a new genesis builder
    pub const fn new(config: GenesisConfig) -> Self {
        Self { config }
    }

    /// Create a devnet genesis builder
    pub fn devnet(validators: &[Validator]) -> Self {
        Self::new(GenesisConfig::devnet(validators))
    }

    /// Configuration in use
    pub const fn config(&self) -> &GenesisConfig {
        &self.config
    }

    /// Run the initial state through the executor and build the genesis block
    pub fn build(&self, executor: &dyn Executor) -> Result<Genesis, GenesisError> {
        self.config.validate()?;

        let (post_state, effect) =
            executor.genesis(&self.config.bond_map(), &self.config.allocation_map())?;
        let bonds = executor.weight_map(post_state)?;
        if bonds != self.config.bond_map() {
            return Err(GenesisError::InvalidConfig(
                "executor bonds differ from configured bonds".into(),
            ));
        }

        let block = Block {
            hash: B256::ZERO,
            rank: 0,
            seq_num: 0,
            sender: Address::ZERO,
            parents: Vec::new(),
            justifications: BTreeMap::new(),
            bonds,
            post_state_hash: post_state,
            deploys: Vec::new(),
            timestamp: self.config.timestamp,
            signature: Bytes::new(),
        }
        .seal();

        Ok(Genesis { block, effect })
    }

    /// Write genesis to a JSON file
    pub fn write_json(
        &self,
        executor: &dyn Executor,
        path: impl AsRef<Path>,
    ) -> Result<Genesis, GenesisError> {
        let genesis = self.build(executor)?;
        let file = GenesisFile { config: self.config.clone(), block: genesis.block.clone() };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(genesis)
    }

    /// Get genesis as JSON string
    pub fn to_json(&self, executor: &dyn Executor) -> Result<String, GenesisError> {
        let genesis = self.build(executor)?;
        let file = GenesisFile { config: self.config.clone(), block: genesis.block };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    /// Read a genesis file and rebuild it, checking that the stored block is reproduced
    pub fn load(executor: &dyn Executor, path: impl AsRef<Path>) -> Result<Genesis, GenesisError> {
        let content = std::fs::read_to_string(path)?;
        let file: GenesisFile = serde_json::from_str(&content)?;
        let genesis = Self::new(file.config).build(executor)?;
        if genesis.block.hash != file.block.hash {
            return Err(GenesisError::HashMismatch {
                expected: file.block.hash,
                actual: genesis.block.hash,
            });
        }
        Ok(genesis)
    }
}
