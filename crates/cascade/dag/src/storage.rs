//! Block storage and the shared DAG handle

use alloy_primitives::B256;
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::trace;

use crate::{Block, BlockDag, BlockDagRepresentation, DagError};

/// Full block bodies, keyed by hash.
pub trait BlockStore: Send + Sync + fmt::Debug {
    /// Fetch a block
    fn get(&self, hash: &B256) -> Option<Arc<Block>>;

    /// Store a block; storing a known hash again is a no-op
    fn put(&self, block: Arc<Block>);

    /// All stored blocks matching a predicate
    fn find(&self, predicate: &dyn Fn(&Block) -> bool) -> Vec<Arc<Block>>;

    /// Whether the block is stored
    fn contains(&self, hash: &B256) -> bool {
        self.get(hash).is_some()
    }
}

/// A [`BlockStore`] backed by a hash map.
#[derive(Debug, Default)]
pub struct InMemoryBlockStore {
    blocks: RwLock<HashMap<B256, Arc<Block>>>,
}

impl InMemoryBlockStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlockStore for InMemoryBlockStore {
    fn get(&self, hash: &B256) -> Option<Arc<Block>> {
        self.blocks.read().get(hash).cloned()
    }

    fn put(&self, block: Arc<Block>) {
        trace!(target: "cascade::storage", hash = %block.hash, "Storing block");
        self.blocks.write().entry(block.hash).or_insert(block);
    }

    fn find(&self, predicate: &dyn Fn(&Block) -> bool) -> Vec<Arc<Block>> {
        self.blocks.read().values().filter(|block| predicate(block)).cloned().collect()
    }
}

/// The DAG behind a read/write lock, paired with the block bodies.
///
/// Writers serialize on the lock; readers take a snapshot and release it immediately.
#[derive(Debug)]
pub struct BlockDagStorage {
    dag: RwLock<BlockDag>,
    store: Arc<dyn BlockStore>,
}

impl BlockDagStorage {
    /// Create a storage over an empty DAG
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { dag: RwLock::new(BlockDag::new()), store }
    }

    /// Insert into the DAG, then persist the body
    pub fn insert(&self, block: Arc<Block>) -> Result<BlockDagRepresentation, DagError> {
        let snapshot = {
            let mut dag = self.dag.write();
            dag.insert(&block)?;
            dag.snapshot()
        };
        self.store.put(block);
        Ok(snapshot)
    }

    /// Current snapshot
    pub fn snapshot(&self) -> BlockDagRepresentation {
        self.dag.read().snapshot()
    }

    /// Block body lookup
    pub fn block(&self, hash: &B256) -> Option<Arc<Block>> {
        self.store.get(hash)
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }
}
