//! Helpers for building DAGs in tests.

use alloy_primitives::{Address, Bytes, B256};
use std::collections::{BTreeMap, HashMap};

use crate::{Block, BlockDag, BlockDagRepresentation, Validator, Weight};

/// Deterministic validator address
pub fn validator(n: u8) -> Validator {
    Address::repeat_byte(n)
}

/// Builds unsigned blocks and inserts them into a [`BlockDag`].
///
/// Blocks copy the bonds of their main parent and get increasing timestamps.
#[derive(Debug, Clone, Default)]
pub struct TestDag {
    dag: BlockDag,
    blocks: HashMap<B256, Block>,
    clock: u64,
}

impl TestDag {
    /// A DAG holding only a genesis block with the given bonds
    pub fn with_genesis(bonds: &[(Validator, Weight)]) -> (Self, B256) {
        let mut this = Self::default();
        let genesis = Block {
            hash: B256::ZERO,
            rank: 0,
            seq_num: 0,
            sender: Address::ZERO,
            parents: Vec::new(),
            justifications: BTreeMap::new(),
            bonds: bonds.iter().copied().collect(),
            post_state_hash: B256::ZERO,
            deploys: Vec::new(),
            timestamp: 0,
            signature: Bytes::new(),
        }
        .seal();
        let hash = this.insert(genesis);
        (this, hash)
    }

    /// Add a block justified by every current latest message
    pub fn add_block(&mut self, sender: Validator, parents: &[B256]) -> B256 {
        let snapshot = self.dag.snapshot();
        let justifications = snapshot
            .latest_messages()
            .keys()
            .filter_map(|v| snapshot.latest_message(v).map(|hash| (*v, hash)))
            .collect();
        self.add_block_with_justifications(sender, parents, justifications)
    }

    /// Add a block with explicit justifications
    pub fn add_block_with_justifications(
        &mut self,
        sender: Validator,
        parents: &[B256],
        justifications: BTreeMap<Validator, B256>,
    ) -> B256 {
        let block = self.build_block(sender, parents, justifications);
        self.insert(block)
    }

    /// Build a sealed block without inserting it
    pub fn build_block(
        &mut self,
        sender: Validator,
        parents: &[B256],
        justifications: BTreeMap<Validator, B256>,
    ) -> Block {
        let snapshot = self.dag.snapshot();
        let rank = parents
            .iter()
            .filter_map(|p| snapshot.lookup(p))
            .map(|meta| meta.rank + 1)
            .max()
            .unwrap_or_default();
        let seq_num = justifications
            .get(&sender)
            .and_then(|prev| snapshot.lookup(prev))
            .map_or(0, |meta| meta.seq_num + 1);
        let bonds = parents
            .first()
            .and_then(|p| self.blocks.get(p))
            .map(|parent| parent.bonds.clone())
            .unwrap_or_default();
        self.clock += 1;

        Block {
            hash: B256::ZERO,
            rank,
            seq_num,
            sender,
            parents: parents.to_vec(),
            justifications,
            bonds,
            post_state_hash: B256::ZERO,
            deploys: Vec::new(),
            timestamp: self.clock,
            signature: Bytes::new(),
        }
        .seal()
    }

    /// Insert a prepared block; panics if the DAG refuses it
    pub fn insert(&mut self, block: Block) -> B256 {
        let hash = block.hash;
        if let Err(err) = self.dag.insert(&block) {
            panic!("test block {hash} rejected: {err}");
        }
        self.blocks.insert(hash, block);
        hash
    }

    /// Full block by hash; panics if unknown
    pub fn block(&self, hash: &B256) -> &Block {
        &self.blocks[hash]
    }

    /// Every block inserted through this builder, unordered
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    /// Current snapshot
    pub fn representation(&self) -> BlockDagRepresentation {
        self.dag.snapshot()
    }

    /// The wrapped DAG
    pub fn dag_mut(&mut self) -> &mut BlockDag {
        &mut self.dag
    }
}
