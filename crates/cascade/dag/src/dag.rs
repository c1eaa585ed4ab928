//! Append-only block DAG and its immutable snapshots

use alloy_primitives::B256;
use imbl::{HashMap, OrdSet, Vector};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{Block, BlockMetadata, DagError, InvariantViolation, Validator, Weight};

/// Shared state behind [`BlockDag`] and its snapshots.
///
/// The indexes grow with the DAG and are persistent collections, so cloning the state shares
/// them. Only the per-validator maps are copied outright.
#[derive(Debug, Clone, Default)]
struct DagState {
    /// Hash index
    blocks: HashMap<B256, Arc<BlockMetadata>>,
    /// Reverse parent edges
    children: HashMap<B256, OrdSet<B256>>,
    /// Rank layers indexed by rank, hash ordered. Ranks have no gaps.
    ranks: Vector<OrdSet<B256>>,
    /// Blocks per (sender, sequence number)
    sequences: HashMap<(Validator, u64), OrdSet<B256>>,
    /// Latest visible blocks of each validator
    latest_messages: BTreeMap<Validator, BTreeSet<B256>>,
    /// Validators caught producing more than one latest message
    equivocators: BTreeSet<Validator>,
    /// The single parentless block
    genesis: Option<B256>,
}

/// The single-writer DAG.
///
/// Every [`BlockDag::insert`] works on a copy-on-write state: snapshots handed out through
/// [`BlockDag::snapshot`] keep observing the state they were taken from, and share all but the
/// touched paths with it.
#[derive(Debug, Clone, Default)]
pub struct BlockDag {
    state: Arc<DagState>,
}

impl BlockDag {
    /// Create an empty DAG
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.state.blocks.len()
    }

    /// Whether the DAG holds no block
    pub fn is_empty(&self) -> bool {
        self.state.blocks.is_empty()
    }

    /// Take an immutable snapshot of the current state
    pub fn snapshot(&self) -> BlockDagRepresentation {
        BlockDagRepresentation { state: Arc::clone(&self.state) }
    }

    /// Validate a block against the DAG and add it.
    pub fn insert(&mut self, block: &Block) -> Result<(), DagError> {
        let hash = block.hash;
        if self.state.blocks.contains_key(&hash) {
            return Err(DagError::AlreadyKnown(hash));
        }

        self.check_structure(block)?;
        self.check_dependencies(block)?;
        self.check_against_dependencies(block)?;

        let state = Arc::make_mut(&mut self.state);
        state.blocks.insert(hash, Arc::new(BlockMetadata::from(block)));
        for parent in &block.parents {
            add_to_set(&mut state.children, *parent, hash);
        }
        add_to_layer(&mut state.ranks, block.rank, hash);

        if block.is_genesis() {
            state.genesis = Some(hash);
            debug!(target: "cascade::dag", %hash, "Genesis inserted");
            return Ok(());
        }

        let sender = block.sender;
        let seq_clash = add_to_set(&mut state.sequences, (sender, block.seq_num), hash) > 1;

        let latest = state.latest_messages.entry(sender).or_default();
        if let Some(previous) = block.justifications.get(&sender) {
            latest.remove(previous);
        }
        latest.insert(hash);

        if (seq_clash || latest.len() > 1) && state.equivocators.insert(sender) {
            warn!(
                target: "cascade::dag",
                %sender,
                %hash,
                seq_num = block.seq_num,
                "Equivocation detected"
            );
        }

        debug!(
            target: "cascade::dag",
            %hash,
            rank = block.rank,
            %sender,
            parents = block.parents.len(),
            "Block inserted"
        );
        Ok(())
    }

    /// Checks that need nothing but the block itself
    fn check_structure(&self, block: &Block) -> Result<(), DagError> {
        let hash = block.hash;
        let computed = block.compute_hash();
        if computed != hash {
            return Err(DagError::MalformedBlock(format!(
                "hash mismatch: declared {hash}, computed {computed}"
            )));
        }

        if block.is_genesis() {
            if self.state.genesis.is_some() {
                return Err(DagError::MalformedBlock("second parentless block".into()));
            }
            if block.rank != 0 {
                return Err(DagError::RankViolation { expected: 0, actual: block.rank });
            }
            if !block.justifications.is_empty() {
                return Err(DagError::MalformedBlock("genesis carries justifications".into()));
            }
            if block.bonds.is_empty() {
                return Err(DagError::MalformedBlock("genesis declares no bonds".into()));
            }
        }

        let unique: BTreeSet<_> = block.parents.iter().collect();
        if unique.len() != block.parents.len() {
            return Err(DagError::MalformedBlock("duplicate parent".into()));
        }
        if unique.contains(&hash) || block.justifications.values().any(|j| *j == hash) {
            return Err(DagError::MalformedBlock("block references itself".into()));
        }
        if let Some((validator, _)) = block.bonds.iter().find(|(_, weight)| **weight == 0) {
            return Err(DagError::MalformedBlock(format!("zero stake bond for {validator}")));
        }

        Ok(())
    }

    /// Parents first, then justifications in validator order
    fn check_dependencies(&self, block: &Block) -> Result<(), DagError> {
        block
            .parents
            .iter()
            .chain(block.justifications.values())
            .find(|dep| !self.state.blocks.contains_key(*dep))
            .map_or(Ok(()), |missing| Err(DagError::MissingDependency(*missing)))
    }

    /// Checks that need the dependencies to be present
    fn check_against_dependencies(&self, block: &Block) -> Result<(), DagError> {
        let dependency = |hash: &B256| {
            self.state.blocks.get(hash).ok_or(DagError::MissingDependency(*hash))
        };

        for (validator, target) in &block.justifications {
            let sender = dependency(target)?.sender;
            if sender != *validator {
                return Err(DagError::MalformedBlock(format!(
                    "justification {target} for {validator} was created by {sender}"
                )));
            }
        }

        if !block.is_genesis() {
            let expected_seq = match block.justifications.get(&block.sender) {
                Some(previous) => dependency(previous)?.seq_num + 1,
                None => 0,
            };
            if block.seq_num != expected_seq {
                return Err(DagError::MalformedBlock(format!(
                    "sequence number {} does not follow {expected_seq}",
                    block.seq_num
                )));
            }

            let mut expected_rank = 0;
            for parent in &block.parents {
                expected_rank = expected_rank.max(dependency(parent)?.rank + 1);
            }
            if block.rank != expected_rank {
                return Err(DagError::RankViolation { expected: expected_rank, actual: block.rank });
            }
        }

        Ok(())
    }
}

/// A consistent, immutable view of the DAG.
///
/// Cheap to clone; never changes after it was taken.
#[derive(Debug, Clone, Default)]
pub struct BlockDagRepresentation {
    state: Arc<DagState>,
}

impl BlockDagRepresentation {
    /// Number of blocks in the snapshot
    pub fn len(&self) -> usize {
        self.state.blocks.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.state.blocks.is_empty()
    }

    /// Whether the block is in the snapshot
    pub fn contains(&self, hash: &B256) -> bool {
        self.state.blocks.contains_key(hash)
    }

    /// Metadata of a block
    pub fn lookup(&self, hash: &B256) -> Option<&BlockMetadata> {
        self.state.blocks.get(hash).map(AsRef::as_ref)
    }

    /// Metadata of a block that must exist
    pub fn expect_lookup(&self, hash: &B256) -> Result<&BlockMetadata, InvariantViolation> {
        self.lookup(hash).ok_or_else(|| InvariantViolation::unknown_block(*hash))
    }

    /// Genesis hash, if inserted
    pub fn genesis(&self) -> Option<B256> {
        self.state.genesis
    }

    /// Blocks that cite `hash` as a parent
    pub fn children(&self, hash: &B256) -> BTreeSet<B256> {
        let children = self.state.children.get(hash);
        children.map(|set| set.iter().copied().collect()).unwrap_or_default()
    }

    /// Children whose main parent is `hash`, in hash order
    pub fn main_children(&self, hash: &B256) -> Vec<B256> {
        self.state
            .children
            .get(hash)
            .into_iter()
            .flat_map(|set| set.iter())
            .filter(|child| {
                self.lookup(child).and_then(BlockMetadata::main_parent).as_ref() == Some(hash)
            })
            .copied()
            .collect()
    }

    /// Main parent of a block
    pub fn main_parent(&self, hash: &B256) -> Option<B256> {
        self.lookup(hash).and_then(BlockMetadata::main_parent)
    }

    /// Latest message set of every validator
    pub fn latest_messages(&self) -> &BTreeMap<Validator, BTreeSet<B256>> {
        &self.state.latest_messages
    }

    /// Latest message hashes of one validator
    pub fn latest_message_hashes(&self, validator: &Validator) -> BTreeSet<B256> {
        self.state.latest_messages.get(validator).cloned().unwrap_or_default()
    }

    /// The single latest message to cite for a validator: the highest ranked one, ties by hash
    pub fn latest_message(&self, validator: &Validator) -> Option<B256> {
        self.state
            .latest_messages
            .get(validator)?
            .iter()
            .filter_map(|hash| self.lookup(hash))
            .max_by(|a, b| a.rank.cmp(&b.rank).then_with(|| b.hash.cmp(&a.hash)))
            .map(|meta| meta.hash)
    }

    /// Validators that equivocated
    pub fn equivocators(&self) -> &BTreeSet<Validator> {
        &self.state.equivocators
    }

    /// Blocks a validator created at a sequence number
    pub fn blocks_at_seq(&self, validator: &Validator, seq_num: u64) -> BTreeSet<B256> {
        self.state
            .sequences
            .get(&(*validator, seq_num))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Highest rank present
    pub fn max_rank(&self) -> Option<u64> {
        (self.state.ranks.len() as u64).checked_sub(1)
    }

    /// Rank layers from `start_rank` upwards, hash ordered within a layer.
    ///
    /// Lazy and bounded by the snapshot; every call starts over.
    pub fn topo_sort(&self, start_rank: u64) -> impl Iterator<Item = Vec<B256>> + '_ {
        let skip = usize::try_from(start_rank).unwrap_or(usize::MAX);
        self.state.ranks.iter().skip(skip).map(|layer| layer.iter().copied().collect())
    }

    /// Whether `ancestor` is reachable from `descendant` through any parent links (inclusive)
    pub fn is_ancestor(&self, ancestor: &B256, descendant: &B256) -> bool {
        let Some(target) = self.lookup(ancestor) else { return false };
        let mut visited = HashSet::new();
        let mut stack = vec![*descendant];
        while let Some(hash) = stack.pop() {
            if hash == target.hash {
                return true;
            }
            let Some(meta) = self.lookup(&hash) else { continue };
            if meta.rank > target.rank && visited.insert(hash) {
                stack.extend(meta.parents.iter().copied());
            }
        }
        false
    }

    /// Whether `ancestor` lies on the main-parent chain of `descendant` (inclusive)
    pub fn is_in_main_chain(&self, ancestor: &B256, descendant: &B256) -> bool {
        let Some(target) = self.lookup(ancestor) else { return false };
        let mut current = self.lookup(descendant);
        while let Some(meta) = current {
            if meta.rank < target.rank {
                return false;
            }
            if meta.hash == target.hash {
                return true;
            }
            current = meta.main_parent().and_then(|p| self.lookup(&p));
        }
        false
    }

    /// The block on `descendant`'s main-parent chain whose main parent is `root`.
    ///
    /// `None` when the chain does not pass through `root` or `descendant == root`.
    pub fn main_chain_child_of(&self, root: &B256, descendant: &B256) -> Option<B256> {
        let root_rank = self.lookup(root)?.rank;
        let mut current = self.lookup(descendant)?;
        loop {
            if current.rank <= root_rank {
                return None;
            }
            let parent = current.main_parent()?;
            if parent == *root {
                return Some(current.hash);
            }
            current = self.lookup(&parent)?;
        }
    }

    /// Validator weights a block is judged with: the bonds of its main parent, the block's own
    /// bonds for genesis. Blocks without recorded bonds defer to their own main parent.
    pub fn main_parent_weight_map(
        &self,
        hash: &B256,
    ) -> Result<BTreeMap<Validator, Weight>, InvariantViolation> {
        let block = self.expect_lookup(hash)?;
        let mut current = match block.main_parent() {
            Some(parent) => self.expect_lookup(&parent)?,
            None => block,
        };
        loop {
            if !current.bonds.is_empty() {
                return Ok(current.bonds.clone());
            }
            match current.main_parent() {
                Some(parent) => current = self.expect_lookup(&parent)?,
                None => {
                    return Err(InvariantViolation(format!(
                        "no bonds recorded on the main chain of {hash}"
                    )))
                }
            }
        }
    }
}

/// Add `value` to the set under `key`, returning the new set size
fn add_to_set<K>(map: &mut HashMap<K, OrdSet<B256>>, key: K, value: B256) -> usize
where
    K: std::hash::Hash + Eq + Clone,
{
    let mut set = map.get(&key).cloned().unwrap_or_default();
    set.insert(value);
    let len = set.len();
    map.insert(key, set);
    len
}

fn add_to_layer(ranks: &mut Vector<OrdSet<B256>>, rank: u64, hash: B256) {
    let index = usize::try_from(rank).unwrap_or(usize::MAX);
    match ranks.get(index).cloned() {
        Some(mut layer) => {
            layer.insert(hash);
            ranks.set(index, layer);
        }
        None => ranks.push_back(OrdSet::unit(hash)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{validator, TestDag};
    use std::time::{Duration, Instant};

    #[test]
    fn test_rank_invariant() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10), (validator(2), 10)]);
        let a = dag.add_block(validator(1), &[genesis]);
        let b = dag.add_block(validator(2), &[genesis]);
        let c = dag.add_block(validator(1), &[a, b]);
        let d = dag.add_block(validator(2), &[b]);
        let e = dag.add_block(validator(1), &[c, d]);

        let snapshot = dag.representation();
        assert_eq!(snapshot.lookup(&genesis).unwrap().rank, 0);
        for hash in [a, b, c, d, e] {
            let meta = snapshot.lookup(&hash).unwrap();
            let max_parent =
                meta.parents.iter().map(|p| snapshot.lookup(p).unwrap().rank).max().unwrap();
            assert_eq!(meta.rank, max_parent + 1);
        }
    }

    #[test]
    fn test_rank_violation_rejected() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10)]);
        let mut block = dag.build_block(validator(1), &[genesis], BTreeMap::new());
        block.rank = 5;
        let block = block.seal();
        assert_eq!(
            dag.dag_mut().insert(&block),
            Err(DagError::RankViolation { expected: 1, actual: 5 })
        );
    }

    #[test]
    fn test_missing_dependency_then_retry() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10)]);
        let mut other = dag.clone();
        let a = other.add_block(validator(1), &[genesis]);
        let a_block = other.block(&a).clone();
        let b_block = other.build_block(
            validator(1),
            &[a],
            BTreeMap::from([(validator(1), a)]),
        );

        assert_eq!(dag.dag_mut().insert(&b_block), Err(DagError::MissingDependency(a)));
        dag.dag_mut().insert(&a_block).unwrap();
        dag.dag_mut().insert(&b_block).unwrap();
        assert!(dag.representation().contains(&b_block.hash));
    }

    #[test]
    fn test_missing_justification_detected() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10), (validator(2), 10)]);
        let mut other = dag.clone();
        let unseen = other.add_block(validator(2), &[genesis]);
        let block =
            dag.build_block(validator(1), &[genesis], BTreeMap::from([(validator(2), unseen)]));
        assert_eq!(dag.dag_mut().insert(&block), Err(DagError::MissingDependency(unseen)));
    }

    #[test]
    fn test_malformed_blocks() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10)]);

        let mut tampered = dag.build_block(validator(1), &[genesis], BTreeMap::new());
        tampered.timestamp += 1;
        assert!(matches!(dag.dag_mut().insert(&tampered), Err(DagError::MalformedBlock(_))));

        let mut duplicate = dag.build_block(validator(1), &[genesis], BTreeMap::new());
        duplicate.parents.push(genesis);
        let duplicate = duplicate.seal();
        assert!(matches!(dag.dag_mut().insert(&duplicate), Err(DagError::MalformedBlock(_))));

        let mut bad_seq = dag.build_block(validator(1), &[genesis], BTreeMap::new());
        bad_seq.seq_num = 3;
        let bad_seq = bad_seq.seal();
        assert!(matches!(dag.dag_mut().insert(&bad_seq), Err(DagError::MalformedBlock(_))));

        let a = dag.add_block(validator(1), &[genesis]);
        let wrong_justification =
            dag.build_block(validator(2), &[a], BTreeMap::from([(validator(2), a)]));
        assert!(matches!(
            dag.dag_mut().insert(&wrong_justification),
            Err(DagError::MalformedBlock(_))
        ));
    }

    #[test]
    fn test_duplicate_insert() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10)]);
        let a = dag.add_block(validator(1), &[genesis]);
        let block = dag.block(&a).clone();
        assert_eq!(dag.dag_mut().insert(&block), Err(DagError::AlreadyKnown(a)));
    }

    #[test]
    fn test_children_and_main_children() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10), (validator(2), 10)]);
        let a = dag.add_block(validator(1), &[genesis]);
        let b = dag.add_block(validator(2), &[genesis]);
        let c = dag.add_block(validator(1), &[b, a]);

        let snapshot = dag.representation();
        assert_eq!(snapshot.children(&a), BTreeSet::from([c]));
        assert_eq!(snapshot.children(&b), BTreeSet::from([c]));
        assert!(snapshot.main_children(&a).is_empty());
        assert_eq!(snapshot.main_children(&b), vec![c]);
        assert_eq!(snapshot.main_chain_child_of(&genesis, &c), Some(b));
        assert!(snapshot.is_in_main_chain(&b, &c));
        assert!(!snapshot.is_in_main_chain(&a, &c));
    }

    #[test]
    fn test_latest_messages_advance() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10)]);
        let a = dag.add_block(validator(1), &[genesis]);
        let b = dag.add_block(validator(1), &[a]);

        let snapshot = dag.representation();
        assert_eq!(snapshot.latest_message_hashes(&validator(1)), BTreeSet::from([b]));
        assert!(snapshot.equivocators().is_empty());
    }

    #[test]
    fn test_equivocation_keeps_both() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10), (validator(2), 5)]);
        let a = dag.add_block(validator(1), &[genesis]);
        let b1 = dag.add_block_with_justifications(
            validator(1),
            &[a],
            BTreeMap::from([(validator(1), a)]),
        );
        let mut fork = dag.build_block(validator(1), &[a], BTreeMap::from([(validator(1), a)]));
        fork.timestamp += 100;
        let fork = fork.seal();
        dag.dag_mut().insert(&fork).unwrap();

        let snapshot = dag.representation();
        assert_eq!(snapshot.latest_message_hashes(&validator(1)), BTreeSet::from([b1, fork.hash]));
        assert!(snapshot.equivocators().contains(&validator(1)));
        assert_eq!(snapshot.blocks_at_seq(&validator(1), 1).len(), 2);
    }

    #[test]
    fn test_topo_sort_layers() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10), (validator(2), 10)]);
        let a = dag.add_block(validator(1), &[genesis]);
        let b = dag.add_block(validator(2), &[genesis]);
        let c = dag.add_block(validator(1), &[a, b]);

        let snapshot = dag.representation();
        let layers: Vec<_> = snapshot.topo_sort(0).collect();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec![genesis]);
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(layers[1], expected);
        assert_eq!(layers[2], vec![c]);

        // restartable and bounded by the start rank
        assert_eq!(snapshot.topo_sort(2).collect::<Vec<_>>(), vec![vec![c]]);
        assert_eq!(snapshot.topo_sort(0).count(), 3);
        assert_eq!(snapshot.topo_sort(7).count(), 0);
    }

    #[test]
    fn test_snapshot_isolation() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10)]);
        let before = dag.representation();
        let a = dag.add_block(validator(1), &[genesis]);
        assert!(!before.contains(&a));
        assert!(dag.representation().contains(&a));
        assert_eq!(before.len(), 1);
    }

    #[test]
    fn test_snapshots_share_structure() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10)]);
        let mut snapshots = vec![dag.representation()];
        let mut tip = genesis;

        // Every snapshot stays alive; copying the indexes on each insert would be quadratic
        let started = Instant::now();
        for _ in 0..5_000 {
            tip = dag.add_block(validator(1), &[tip]);
            snapshots.push(dag.representation());
        }
        assert!(started.elapsed() < Duration::from_secs(20));

        for (rank, snapshot) in snapshots.iter().enumerate() {
            assert_eq!(snapshot.len(), rank + 1);
            assert_eq!(snapshot.max_rank(), Some(rank as u64));
        }
        assert!(!snapshots[100].contains(&tip));
        assert_eq!(snapshots[5_000].topo_sort(4_999).count(), 2);
    }

    #[test]
    fn test_is_ancestor_follows_every_parent() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 10), (validator(2), 10)]);
        let a = dag.add_block(validator(1), &[genesis]);
        let b = dag.add_block(validator(2), &[genesis]);
        let c = dag.add_block(validator(1), &[a, b]);
        let d = dag.add_block(validator(2), &[b]);

        let snapshot = dag.representation();
        assert!(snapshot.is_ancestor(&b, &c));
        assert!(!snapshot.is_in_main_chain(&b, &c));
        assert!(snapshot.is_ancestor(&genesis, &c));
        assert!(snapshot.is_ancestor(&c, &c));
        assert!(!snapshot.is_ancestor(&a, &d));
        assert!(!snapshot.is_ancestor(&c, &a));
        assert!(!snapshot.is_ancestor(&B256::repeat_byte(0xee), &c));
    }

    #[test]
    fn test_main_parent_weight_map() {
        let (mut dag, genesis) = TestDag::with_genesis(&[(validator(1), 2), (validator(2), 3)]);
        let a = dag.add_block(validator(1), &[genesis]);
        let snapshot = dag.representation();
        let weights = snapshot.main_parent_weight_map(&a).unwrap();
        assert_eq!(weights, BTreeMap::from([(validator(1), 2), (validator(2), 3)]));
        assert_eq!(snapshot.main_parent_weight_map(&genesis).unwrap(), weights);
        assert!(snapshot.main_parent_weight_map(&B256::repeat_byte(0xee)).is_err());
    }
}
