//! Dependency buffering in front of a block importer

use alloy_primitives::B256;
use cascade_dag::Block;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, trace, warn};

use crate::{GossipConfig, GossipError, ImportError};

/// Channel for blocks received from peers
pub type BlockSender = mpsc::Sender<Arc<Block>>;
/// Receiver for blocks received from peers
pub type BlockReceiver = mpsc::Receiver<Arc<Block>>;

/// Channel for requests to fetch missing blocks
pub type FetchSender = mpsc::Sender<FetchRequest>;
/// Receiver for requests to fetch missing blocks
pub type FetchReceiver = mpsc::Receiver<FetchRequest>;

/// Creates a channel for incoming blocks
pub fn block_channel(buffer: usize) -> (BlockSender, BlockReceiver) {
    mpsc::channel(buffer)
}

/// Creates a channel for fetch requests
pub fn fetch_channel(buffer: usize) -> (FetchSender, FetchReceiver) {
    mpsc::channel(buffer)
}

/// Something that takes validated blocks into a DAG
pub trait BlockImporter: Send + Sync + fmt::Debug {
    /// Import a block whose dependencies may or may not be known
    fn import_block(&self, block: Arc<Block>) -> Result<(), ImportError>;
}

/// Ask peers for a block some buffered block depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// Hash of the missing block
    pub hash: B256,
    /// Buffered block that needs it
    pub requested_by: B256,
}

/// Holds blocks back until their dependencies are imported.
///
/// Each buffered block waits under exactly one missing hash. When that hash is imported the
/// block is retried, and may be buffered again under the next missing dependency.
#[derive(Debug)]
pub struct BlockGossip {
    importer: Arc<dyn BlockImporter>,
    fetch_tx: FetchSender,
    config: GossipConfig,
    /// Missing hash -> blocks waiting for it
    pending: HashMap<B256, Vec<Arc<Block>>>,
    /// Hashes of every buffered block
    buffered: HashSet<B256>,
    /// Missing hashes a fetch request went out for
    requested: HashSet<B256>,
}

impl BlockGossip {
    /// Create a gossip front end for an importer
    pub fn new(
        importer: Arc<dyn BlockImporter>,
        fetch_tx: FetchSender,
        config: GossipConfig,
    ) -> Self {
        Self {
            importer,
            fetch_tx,
            config,
            pending: HashMap::new(),
            buffered: HashSet::new(),
            requested: HashSet::new(),
        }
    }

    /// Settings in use
    pub const fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Number of blocks waiting for dependencies
    pub fn pending_len(&self) -> usize {
        self.buffered.len()
    }

    /// Whether a block is waiting for dependencies
    pub fn is_pending(&self, hash: &B256) -> bool {
        self.buffered.contains(hash)
    }

    /// Hashes buffered blocks are waiting for that are not buffered themselves
    pub fn missing(&self) -> impl Iterator<Item = &B256> + '_ {
        self.pending.keys().filter(|hash| !self.buffered.contains(*hash))
    }

    /// Import a block and everything that was waiting on it.
    ///
    /// Returns the hashes imported, in import order. Only a fatal importer error is returned;
    /// invalid blocks are dropped together with their buffered dependents.
    pub fn process_block(&mut self, block: Arc<Block>) -> Result<Vec<B256>, GossipError> {
        if self.buffered.contains(&block.hash) {
            trace!(target: "cascade::gossip", hash = %block.hash, "Block already buffered");
            return Ok(Vec::new());
        }

        let mut imported = Vec::new();
        let mut queue = VecDeque::from([block]);
        while let Some(block) = queue.pop_front() {
            let hash = block.hash;
            match self.importer.import_block(Arc::clone(&block)) {
                Ok(()) => {
                    debug!(target: "cascade::gossip", %hash, rank = block.rank, "Block imported");
                    imported.push(hash);
                    self.release(hash, &mut queue);
                }
                Err(ImportError::AlreadyKnown(_)) => {
                    trace!(target: "cascade::gossip", %hash, "Block already known");
                    self.release(hash, &mut queue);
                }
                Err(ImportError::MissingDependency(missing)) => self.buffer(block, missing),
                Err(ImportError::Invalid(reason)) => {
                    warn!(target: "cascade::gossip", %hash, %reason, "Invalid block dropped");
                    self.drop_dependents(hash);
                }
                Err(ImportError::Fatal(reason)) => {
                    error!(target: "cascade::gossip", %hash, %reason, "Importer failed");
                    return Err(GossipError::Importer { hash, reason });
                }
            }
        }

        Ok(imported)
    }

    /// Run the gossip loop until the block channel closes or the importer fails
    pub async fn run(mut self, mut blocks: BlockReceiver) -> Result<(), GossipError> {
        info!(target: "cascade::gossip", "Block gossip started");

        while let Some(block) = blocks.recv().await {
            self.process_block(block)?;
        }

        info!(target: "cascade::gossip", pending = self.pending_len(), "Block gossip stopped");
        Ok(())
    }

    /// Queue everything waiting on an imported hash
    fn release(&mut self, hash: B256, queue: &mut VecDeque<Arc<Block>>) {
        self.requested.remove(&hash);
        if let Some(waiting) = self.pending.remove(&hash) {
            for block in waiting {
                self.buffered.remove(&block.hash);
                queue.push_back(block);
            }
        }
    }

    fn buffer(&mut self, block: Arc<Block>, missing: B256) {
        let hash = block.hash;
        if self.buffered.len() >= self.config.max_pending_blocks {
            warn!(
                target: "cascade::gossip",
                %hash,
                limit = self.config.max_pending_blocks,
                "Pending buffer full, dropping block"
            );
            return;
        }

        debug!(target: "cascade::gossip", %hash, %missing, "Buffering block");
        self.buffered.insert(hash);
        self.pending.entry(missing).or_default().push(block);

        if !self.buffered.contains(&missing) && self.requested.insert(missing) {
            self.request(FetchRequest { hash: missing, requested_by: hash });
        }
    }

    fn request(&mut self, request: FetchRequest) {
        match self.fetch_tx.try_send(request) {
            Ok(()) => {
                trace!(target: "cascade::gossip", hash = %request.hash, "Fetch requested");
            }
            Err(TrySendError::Full(request)) => {
                // Asked again when the next dependent arrives
                self.requested.remove(&request.hash);
                warn!(target: "cascade::gossip", hash = %request.hash, "Fetch channel full");
            }
            Err(TrySendError::Closed(request)) => {
                debug!(target: "cascade::gossip", hash = %request.hash, "No fetcher listening");
            }
        }
    }

    /// Forget every block that transitively waits on a rejected hash
    fn drop_dependents(&mut self, rejected: B256) {
        let mut stack = vec![rejected];
        while let Some(hash) = stack.pop() {
            self.requested.remove(&hash);
            for block in self.pending.remove(&hash).unwrap_or_default() {
                warn!(
                    target: "cascade::gossip",
                    hash = %block.hash,
                    dependency = %hash,
                    "Dropping block depending on invalid block"
                );
                self.buffered.remove(&block.hash);
                stack.push(block.hash);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_dag::{
        test_utils::{validator, TestDag},
        BlockDagStorage, InMemoryBlockStore,
    };

    #[derive(Debug)]
    struct DagImporter(BlockDagStorage);

    impl DagImporter {
        fn new(genesis: &Block) -> Self {
            let storage = BlockDagStorage::new(Arc::new(InMemoryBlockStore::new()));
            storage.insert(Arc::new(genesis.clone())).unwrap();
            Self(storage)
        }

        fn contains(&self, hash: &B256) -> bool {
            self.0.snapshot().contains(hash)
        }
    }

    impl BlockImporter for DagImporter {
        fn import_block(&self, block: Arc<Block>) -> Result<(), ImportError> {
            self.0.insert(block).map(|_| ()).map_err(Into::into)
        }
    }

    #[derive(Debug)]
    struct BrokenImporter;

    impl BlockImporter for BrokenImporter {
        fn import_block(&self, _block: Arc<Block>) -> Result<(), ImportError> {
            Err(ImportError::Fatal("storage gone".into()))
        }
    }

    /// genesis <- a <- b <- c, one validator per block
    fn chain() -> (TestDag, B256, [B256; 3]) {
        let (mut test, genesis) =
            TestDag::with_genesis(&[(validator(1), 10), (validator(2), 10), (validator(3), 10)]);
        let a = test.add_block(validator(1), &[genesis]);
        let b = test.add_block(validator(2), &[a]);
        let c = test.add_block(validator(3), &[b]);
        (test, genesis, [a, b, c])
    }

    fn body(test: &TestDag, hash: &B256) -> Arc<Block> {
        Arc::new(test.block(hash).clone())
    }

    #[test]
    fn test_out_of_order_blocks_are_retried() {
        let (test, genesis, [a, b, c]) = chain();
        let importer = Arc::new(DagImporter::new(test.block(&genesis)));
        let (fetch_tx, mut fetch_rx) = fetch_channel(8);
        let mut gossip = BlockGossip::new(importer.clone(), fetch_tx, GossipConfig::default());

        assert!(gossip.process_block(body(&test, &c)).unwrap().is_empty());
        assert!(gossip.is_pending(&c));
        assert_eq!(fetch_rx.try_recv().unwrap(), FetchRequest { hash: b, requested_by: c });

        assert!(gossip.process_block(body(&test, &b)).unwrap().is_empty());
        assert_eq!(fetch_rx.try_recv().unwrap(), FetchRequest { hash: a, requested_by: b });
        assert_eq!(gossip.missing().copied().collect::<Vec<_>>(), vec![a]);

        let imported = gossip.process_block(body(&test, &a)).unwrap();
        assert_eq!(imported, vec![a, b, c]);
        assert_eq!(gossip.pending_len(), 0);
        assert!(importer.contains(&c));
        assert!(fetch_rx.try_recv().is_err());
    }

    #[test]
    fn test_missing_block_requested_once() {
        let (mut test, genesis) = TestDag::with_genesis(&[(validator(1), 10), (validator(2), 10)]);
        let a = test.add_block(validator(1), &[genesis]);
        let b1 = test.add_block_with_justifications(
            validator(2),
            &[a],
            [(validator(1), a)].into_iter().collect(),
        );
        let b2 = test.add_block_with_justifications(
            validator(1),
            &[a],
            [(validator(1), a)].into_iter().collect(),
        );

        let importer = Arc::new(DagImporter::new(test.block(&genesis)));
        let (fetch_tx, mut fetch_rx) = fetch_channel(8);
        let mut gossip = BlockGossip::new(importer, fetch_tx, GossipConfig::default());

        gossip.process_block(body(&test, &b1)).unwrap();
        gossip.process_block(body(&test, &b2)).unwrap();
        gossip.process_block(body(&test, &b2)).unwrap();
        assert_eq!(gossip.pending_len(), 2);
        assert_eq!(fetch_rx.try_recv().unwrap().hash, a);
        assert!(fetch_rx.try_recv().is_err());

        let mut imported = gossip.process_block(body(&test, &a)).unwrap();
        imported.sort();
        let mut expected = vec![a, b1, b2];
        expected.sort();
        assert_eq!(imported, expected);
    }

    #[test]
    fn test_invalid_block_drops_dependents() {
        let (test, genesis, [a, b, c]) = chain();
        let importer = Arc::new(DagImporter::new(test.block(&genesis)));
        let (fetch_tx, _fetch_rx) = fetch_channel(8);
        let mut gossip = BlockGossip::new(importer.clone(), fetch_tx, GossipConfig::default());

        gossip.process_block(body(&test, &c)).unwrap();
        gossip.process_block(body(&test, &b)).unwrap();
        assert_eq!(gossip.pending_len(), 2);

        // Same hash, different content
        let forged = Block { timestamp: 999, ..test.block(&a).clone() };
        assert!(gossip.process_block(Arc::new(forged)).unwrap().is_empty());
        assert_eq!(gossip.pending_len(), 0);
        assert_eq!(gossip.missing().count(), 0);
        assert!(!importer.contains(&b));
    }

    #[test]
    fn test_already_known_releases_dependents() {
        let (test, genesis, [a, b, _]) = chain();
        let importer = Arc::new(DagImporter::new(test.block(&genesis)));
        importer.import_block(body(&test, &a)).unwrap();

        let (fetch_tx, _fetch_rx) = fetch_channel(8);
        let mut gossip = BlockGossip::new(importer, fetch_tx, GossipConfig::default());
        assert_eq!(gossip.process_block(body(&test, &b)).unwrap(), vec![b]);
        assert!(gossip.process_block(body(&test, &a)).unwrap().is_empty());
    }

    #[test]
    fn test_pending_limit() {
        let (test, genesis, [_, b, c]) = chain();
        let importer = Arc::new(DagImporter::new(test.block(&genesis)));
        let (fetch_tx, _fetch_rx) = fetch_channel(8);
        let config = GossipConfig::default().with_max_pending_blocks(1);
        let mut gossip = BlockGossip::new(importer, fetch_tx, config);

        gossip.process_block(body(&test, &c)).unwrap();
        gossip.process_block(body(&test, &b)).unwrap();
        assert_eq!(gossip.pending_len(), 1);
        assert!(gossip.is_pending(&c));
        assert!(!gossip.is_pending(&b));
    }

    #[test]
    fn test_fatal_importer_error() {
        let (test, _, [a, _, _]) = chain();
        let (fetch_tx, _fetch_rx) = fetch_channel(8);
        let mut gossip =
            BlockGossip::new(Arc::new(BrokenImporter), fetch_tx, GossipConfig::default());

        assert!(matches!(
            gossip.process_block(body(&test, &a)),
            Err(GossipError::Importer { hash, .. }) if hash == a
        ));
    }

    #[tokio::test]
    async fn test_run_fetches_missing_ancestors() {
        let (test, genesis, [a, b, c]) = chain();
        let importer = Arc::new(DagImporter::new(test.block(&genesis)));
        let (block_tx, block_rx) = block_channel(8);
        let (fetch_tx, mut fetch_rx) = fetch_channel(8);
        let gossip = BlockGossip::new(importer.clone(), fetch_tx, GossipConfig::default());
        let handle = tokio::spawn(gossip.run(block_rx));

        // Only the tip is announced; its ancestors are served on request
        block_tx.send(body(&test, &c)).await.unwrap();
        for expected in [b, a] {
            let request = fetch_rx.recv().await.unwrap();
            assert_eq!(request.hash, expected);
            block_tx.send(body(&test, &request.hash)).await.unwrap();
        }
        drop(block_tx);

        handle.await.unwrap().unwrap();
        assert!([a, b, c].iter().all(|hash| importer.contains(hash)));
    }

    #[tokio::test]
    async fn test_run_stops_on_fatal_error() {
        let (test, _, [a, _, _]) = chain();
        let (block_tx, block_rx) = block_channel(8);
        let (fetch_tx, _fetch_rx) = fetch_channel(8);
        let gossip = BlockGossip::new(Arc::new(BrokenImporter), fetch_tx, GossipConfig::default());
        let handle = tokio::spawn(gossip.run(block_rx));

        block_tx.send(body(&test, &a)).await.unwrap();
        assert!(handle.await.unwrap().is_err());
    }
}
