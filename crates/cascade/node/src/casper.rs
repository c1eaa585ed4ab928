//! The Casper engine: block validation, proposal and finality queries

use alloy_primitives::B256;
use cascade_consensus::{
    DagMergeView, Estimator, ExecutionEffect, ExecutionOutcome, Executor, MergeResult,
};
use cascade_dag::{
    Block, BlockDagRepresentation, BlockDagStorage, BlockSigner, BlockStore, DagError, Deploy,
    InMemoryBlockStore, InvariantViolation, Secp256k1Verifier, SignatureVerifier, Validator,
};
use cascade_finality::{FinalityDetector, FinalityStatus, FinalizedBlock};
use cascade_genesis::Genesis;
use cascade_gossip::{BlockImporter, ImportError};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{CasperConfig, CasperError};

/// Builds a [`Casper`] from its collaborators.
///
/// Defaults to an in-memory block store, secp256k1 signature checks and no signing key (an
/// observing node).
#[derive(Debug)]
pub struct CasperBuilder {
    executor: Arc<dyn Executor>,
    store: Arc<dyn BlockStore>,
    verifier: Arc<dyn SignatureVerifier>,
    signer: Option<BlockSigner>,
    config: CasperConfig,
}

impl CasperBuilder {
    /// Start from an executor
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            store: Arc::new(InMemoryBlockStore::new()),
            verifier: Arc::new(Secp256k1Verifier),
            signer: None,
            config: CasperConfig::default(),
        }
    }

    /// Use another block store
    pub fn with_store(mut self, store: Arc<dyn BlockStore>) -> Self {
        self.store = store;
        self
    }

    /// Use another signature check
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Propose blocks with this key
    pub fn with_signer(mut self, signer: BlockSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Engine settings
    pub const fn with_config(mut self, config: CasperConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the engine on a genesis the executor already holds the state of
    pub fn build(self, genesis: &Genesis) -> Result<Casper, CasperError> {
        let block = &genesis.block;
        if self.executor.weight_map(block.post_state_hash)? != block.bonds {
            return Err(CasperError::BondsMismatch(block.hash));
        }

        let storage = BlockDagStorage::new(self.store);
        let snapshot = storage.insert(Arc::new(block.clone()))?;
        let finality = FinalityDetector::new(&snapshot, block.hash, self.config.finality)?;
        let view = ConsensusView { dag: snapshot, finality: finality.clone() };
        let (finalized_tx, _) = watch::channel(FinalizedBlock {
            hash: block.hash,
            rank: block.rank,
            fault_tolerance: 1.0,
        });

        info!(
            target: "cascade::casper",
            genesis = %block.hash,
            validators = block.bonds.len(),
            address = ?self.signer.as_ref().map(BlockSigner::address),
            "Casper engine started"
        );

        Ok(Casper {
            config: self.config,
            storage,
            executor: self.executor,
            verifier: self.verifier,
            signer: self.signer,
            estimator: Estimator,
            effects: RwLock::new(HashMap::from([(block.hash, genesis.effect.clone())])),
            finality: Mutex::new(finality),
            view: RwLock::new(Arc::new(view)),
            finalized_tx,
        })
    }
}

/// A validator's (or observer's) view of the consensus.
#[derive(Debug)]
pub struct Casper {
    config: CasperConfig,
    storage: BlockDagStorage,
    executor: Arc<dyn Executor>,
    verifier: Arc<dyn SignatureVerifier>,
    signer: Option<BlockSigner>,
    estimator: Estimator,
    /// Effect of each block's own deploys
    effects: RwLock<HashMap<B256, ExecutionEffect>>,
    /// Held for the whole of `add_block`, making it the single DAG writer
    finality: Mutex<FinalityDetector>,
    /// What queries read; replaced after every insert
    view: RwLock<Arc<ConsensusView>>,
    finalized_tx: watch::Sender<FinalizedBlock>,
}

/// A DAG snapshot and the detector state that has seen exactly that snapshot
#[derive(Debug)]
struct ConsensusView {
    dag: BlockDagRepresentation,
    finality: FinalityDetector,
}

impl ConsensusView {
    fn last_finalized_block(&self) -> B256 {
        self.finality.last_finalized_block()
    }
}

impl Casper {
    /// Validate a block, add it to the DAG and update finality.
    ///
    /// Returns the blocks this one finalized, oldest first.
    pub fn add_block(&self, block: Arc<Block>) -> Result<Vec<FinalizedBlock>, CasperError> {
        let mut finality = self.finality.lock();
        let snapshot = self.storage.snapshot();
        let hash = block.hash;

        if snapshot.contains(&hash) {
            return Err(DagError::AlreadyKnown(hash).into());
        }
        if block.is_genesis() {
            return Err(DagError::MalformedBlock("second parentless block".into()).into());
        }
        let computed = block.compute_hash();
        if computed != hash {
            return Err(DagError::MalformedBlock(format!(
                "hash mismatch: declared {hash}, computed {computed}"
            ))
            .into());
        }
        let mut dependencies = block.parents.iter().chain(block.justifications.values());
        if let Some(missing) = dependencies.find(|dep| !snapshot.contains(dep)) {
            debug!(target: "cascade::casper", %hash, %missing, "Dependency missing");
            return Err(DagError::MissingDependency(*missing).into());
        }
        self.verifier.verify(&block)?;

        let outcome = self.replay(&snapshot, &block).inspect_err(|err| {
            warn!(target: "cascade::casper", %hash, sender = %block.sender, %err, "Replay failed");
        })?;

        let snapshot = self.storage.insert(Arc::clone(&block))?;
        self.effects.write().insert(hash, outcome.effect);

        let finalized =
            finality.on_new_block_added_to_the_block_dag(&snapshot, hash).map_err(fatal)?;
        *self.view.write() = Arc::new(ConsensusView { dag: snapshot, finality: finality.clone() });
        if let Some(last) = finalized.last() {
            self.finalized_tx.send_replace(*last);
        }

        info!(
            target: "cascade::casper",
            %hash,
            rank = block.rank,
            sender = %block.sender,
            parents = block.parents.len(),
            deploys = block.deploys.len(),
            lfb = %finality.last_finalized_block(),
            "Block added"
        );
        Ok(finalized)
    }

    /// Build and sign a block on top of the current fork choice. The block is not added.
    pub fn create_block(&self, deploys: Vec<Deploy>) -> Result<Block, CasperError> {
        let signer = self.signer.as_ref().ok_or(CasperError::NotAValidator)?;
        let view = self.view();
        let (snapshot, lfb) = (&view.dag, view.last_finalized_block());

        let mut tips =
            self.estimator.tips(snapshot, lfb, snapshot.latest_messages()).map_err(fatal)?;
        tips.truncate(self.config.max_parents);
        let merged = self.merge(snapshot, &tips)?;
        let parents = merged.chosen;

        let main_parent = parents
            .first()
            .ok_or_else(|| fatal(InvariantViolation("merge chose no parent".into())))?;
        let parent_state = self.body(main_parent)?.post_state_hash;
        let pre_state = self.executor.commit(parent_state, &merged.non_first_effect)?;
        let outcome = self.executor.compute_effect(pre_state, &deploys)?;
        let bonds = self.executor.weight_map(outcome.post_state)?;

        let justifications: BTreeMap<Validator, B256> = snapshot
            .latest_messages()
            .keys()
            .filter_map(|validator| snapshot.latest_message(validator).map(|h| (*validator, h)))
            .collect();
        let sender = signer.address();
        let seq_num = match justifications.get(&sender) {
            Some(previous) => snapshot.expect_lookup(previous).map_err(fatal)?.seq_num + 1,
            None => 0,
        };
        let mut rank = 0;
        for parent in &parents {
            rank = rank.max(snapshot.expect_lookup(parent).map_err(fatal)?.rank + 1);
        }

        let block = Block {
            hash: B256::ZERO,
            rank,
            seq_num,
            sender,
            parents,
            justifications,
            bonds,
            post_state_hash: outcome.post_state,
            deploys,
            timestamp: now_millis(),
            signature: Default::default(),
        }
        .seal();
        let block = signer.sign_block(block)?;

        debug!(
            target: "cascade::casper",
            hash = %block.hash,
            rank = block.rank,
            seq_num = block.seq_num,
            parents = block.parents.len(),
            "Block created"
        );
        Ok(block)
    }

    /// Create a block and add it locally
    pub fn propose(&self, deploys: Vec<Deploy>) -> Result<Arc<Block>, CasperError> {
        let block = Arc::new(self.create_block(deploys)?);
        self.add_block(Arc::clone(&block))?;
        Ok(block)
    }

    /// Fork-choice tips above the last finalized block, best first
    pub fn estimator(&self) -> Result<Vec<B256>, CasperError> {
        let view = self.view();
        let dag = &view.dag;
        self.estimator.tips(dag, view.last_finalized_block(), dag.latest_messages()).map_err(fatal)
    }

    /// Finality of a block
    pub fn finality_status(&self, hash: &B256) -> Result<FinalityStatus, CasperError> {
        let view = self.view();
        view.finality.status(&view.dag, hash).map_err(fatal)
    }

    /// Normalized fault tolerance of a block, in `[-1, 1]`
    pub fn normalized_fault_tolerance(&self, hash: &B256) -> Result<f64, CasperError> {
        self.finality_status(hash).map(|status| status.fault_tolerance())
    }

    /// Whether a block is final under the configured threshold
    pub fn is_final(&self, hash: &B256) -> Result<bool, CasperError> {
        let view = self.view();
        view.finality.is_final(&view.dag, hash).map_err(fatal)
    }

    /// Last finalized block
    pub fn last_finalized_block(&self) -> B256 {
        self.view().last_finalized_block()
    }

    /// Watch the last finalized block
    pub fn subscribe_finalized(&self) -> watch::Receiver<FinalizedBlock> {
        self.finalized_tx.subscribe()
    }

    /// Current DAG snapshot
    pub fn snapshot(&self) -> BlockDagRepresentation {
        self.storage.snapshot()
    }

    /// Full block by hash
    pub fn block(&self, hash: &B256) -> Option<Arc<Block>> {
        self.storage.block(hash)
    }

    /// Address this node proposes with
    pub fn address(&self) -> Option<Validator> {
        self.signer.as_ref().map(BlockSigner::address)
    }

    /// Engine settings
    pub const fn config(&self) -> &CasperConfig {
        &self.config
    }

    /// State as of the last completed insert; never waits for ingestion
    fn view(&self) -> Arc<ConsensusView> {
        Arc::clone(&self.view.read())
    }

    /// Re-execute a block on its merged parents and compare the results
    fn replay(
        &self,
        snapshot: &BlockDagRepresentation,
        block: &Block,
    ) -> Result<ExecutionOutcome, CasperError> {
        let merged = self.merge(snapshot, &block.parents)?;
        if merged.chosen != block.parents {
            return Err(CasperError::InvalidParents {
                listed: block.parents.clone(),
                merged: merged.chosen,
            });
        }

        let main_parent =
            block.main_parent().ok_or_else(|| DagError::MalformedBlock("no parents".into()))?;
        let parent_state = self.body(&main_parent)?.post_state_hash;
        let pre_state = self.executor.commit(parent_state, &merged.non_first_effect)?;
        let outcome = self.executor.compute_effect(pre_state, &block.deploys)?;

        if outcome.post_state != block.post_state_hash {
            return Err(CasperError::PostStateMismatch {
                declared: block.post_state_hash,
                computed: outcome.post_state,
            });
        }
        if self.executor.weight_map(outcome.post_state)? != block.bonds {
            return Err(CasperError::BondsMismatch(block.hash));
        }
        Ok(outcome)
    }

    fn merge(
        &self,
        snapshot: &BlockDagRepresentation,
        candidates: &[B256],
    ) -> Result<MergeResult<ExecutionEffect, B256>, CasperError> {
        let effects = self.effects.read();
        DagMergeView::new(snapshot, |hash: &B256| effects.get(hash).cloned())
            .merge(candidates)
            .map_err(fatal)
    }

    fn body(&self, hash: &B256) -> Result<Arc<Block>, CasperError> {
        self.storage.block(hash).ok_or_else(|| fatal(InvariantViolation::unknown_block(*hash)))
    }
}

impl BlockImporter for Casper {
    fn import_block(&self, block: Arc<Block>) -> Result<(), ImportError> {
        match self.add_block(block) {
            Ok(_) => Ok(()),
            Err(CasperError::Dag(err)) => Err(err.into()),
            Err(err) if err.is_fatal() => Err(ImportError::Fatal(err.to_string())),
            Err(err) => Err(ImportError::Invalid(err.to_string())),
        }
    }
}

/// Log consensus invariant violations where they surface
fn fatal(err: impl Into<CasperError>) -> CasperError {
    let err = err.into();
    if err.is_fatal() {
        error!(target: "cascade::casper", %err, "Consensus invariant violated");
    }
    err
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}
