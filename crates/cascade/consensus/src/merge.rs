//! Multi-parent merge
//!
//! Given ordered candidate parents, keep the first one and add each later candidate whose
//! not-yet-included ancestry has an effect commuting with everything chosen so far.

use alloy_primitives::B256;
use cascade_dag::{BlockDagRepresentation, InvariantViolation};
use std::collections::BTreeSet;
use tracing::trace;

use crate::effect::{Effect, ExecutionEffect};

/// The block-like capability the merge needs
pub trait MergeDag {
    /// Block handle; `Ord` is the canonical order effects are folded in
    type Block: Ord + Clone;
    /// Effect of a single block
    type Effect: Effect;

    /// Direct parents of a block
    fn parents(&self, block: &Self::Block) -> Result<Vec<Self::Block>, InvariantViolation>;

    /// Effect of executing the block's own deploys
    fn effect(&self, block: &Self::Block) -> Result<Self::Effect, InvariantViolation>;
}

/// Outcome of [`abstract_merge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult<E, B> {
    /// Combined effect of everything merged in beyond the first candidate's ancestry
    pub non_first_effect: E,
    /// Chosen candidates, first candidate first, in input order
    pub chosen: Vec<B>,
}

/// Select the candidates that can be merged without conflicts.
///
/// Duplicated candidates are considered once.
pub fn abstract_merge<D: MergeDag>(
    dag: &D,
    candidates: &[D::Block],
) -> Result<MergeResult<D::Effect, D::Block>, InvariantViolation> {
    let mut unique: Vec<D::Block> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !unique.contains(candidate) {
            unique.push(candidate.clone());
        }
    }

    let Some(first) = unique.first().cloned() else {
        return Err(InvariantViolation("merge called without candidates".into()));
    };
    if unique.len() == 1 {
        return Ok(MergeResult { non_first_effect: D::Effect::empty(), chosen: vec![first] });
    }

    let ancestries =
        unique.iter().map(|candidate| ancestry(dag, candidate)).collect::<Result<Vec<_>, _>>()?;
    let common: BTreeSet<D::Block> = ancestries[0]
        .iter()
        .filter(|block| ancestries[1..].iter().all(|other| other.contains(*block)))
        .cloned()
        .collect();
    let uncommon = ancestries.into_iter().map(|blocks| &blocks - &common);

    let mut chosen = Vec::with_capacity(unique.len());
    let mut chosen_set = BTreeSet::new();
    let mut chosen_effect = D::Effect::empty();
    let mut non_first_effect = D::Effect::empty();

    for (index, (candidate, blocks)) in unique.into_iter().zip(uncommon).enumerate() {
        let to_add: BTreeSet<_> = &blocks - &chosen_set;
        let effect = fold_effects(dag, &to_add)?;

        if index == 0 {
            chosen_effect = effect;
        } else if chosen_effect.commutes_with(&effect) {
            chosen_effect = chosen_effect.combine(&effect);
            non_first_effect = non_first_effect.combine(&effect);
        } else {
            trace!(target: "cascade::merge", index, "Candidate conflicts, skipped");
            continue;
        }
        chosen_set.extend(to_add);
        chosen.push(candidate);
    }

    Ok(MergeResult { non_first_effect, chosen })
}

/// A block and all of its ancestors
fn ancestry<D: MergeDag>(
    dag: &D,
    block: &D::Block,
) -> Result<BTreeSet<D::Block>, InvariantViolation> {
    let mut seen = BTreeSet::from([block.clone()]);
    let mut stack = vec![block.clone()];
    while let Some(current) = stack.pop() {
        for parent in dag.parents(&current)? {
            if seen.insert(parent.clone()) {
                stack.push(parent);
            }
        }
    }
    Ok(seen)
}

fn fold_effects<D: MergeDag>(
    dag: &D,
    blocks: &BTreeSet<D::Block>,
) -> Result<D::Effect, InvariantViolation> {
    blocks.iter().try_fold(D::Effect::empty(), |acc, block| Ok(acc.combine(&dag.effect(block)?)))
}

/// Block handle ordered by rank, then hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RankedHash {
    /// Block rank
    pub rank: u64,
    /// Block hash
    pub hash: B256,
}

/// [`MergeDag`] over a DAG snapshot and a per-block effect lookup.
#[derive(Debug)]
pub struct DagMergeView<'a, F> {
    dag: &'a BlockDagRepresentation,
    effects: F,
}

impl<'a, F> DagMergeView<'a, F>
where
    F: Fn(&B256) -> Option<ExecutionEffect>,
{
    /// Create a view
    pub const fn new(dag: &'a BlockDagRepresentation, effects: F) -> Self {
        Self { dag, effects }
    }

    /// Handle of a block in the snapshot
    pub fn handle(&self, hash: &B256) -> Result<RankedHash, InvariantViolation> {
        let meta = self.dag.expect_lookup(hash)?;
        Ok(RankedHash { rank: meta.rank, hash: meta.hash })
    }

    /// Merge candidate hashes
    pub fn merge(
        &self,
        candidates: &[B256],
    ) -> Result<MergeResult<ExecutionEffect, B256>, InvariantViolation> {
        let handles =
            candidates.iter().map(|hash| self.handle(hash)).collect::<Result<Vec<_>, _>>()?;
        let result = abstract_merge(self, &handles)?;
        Ok(MergeResult {
            non_first_effect: result.non_first_effect,
            chosen: result.chosen.into_iter().map(|handle| handle.hash).collect(),
        })
    }
}

impl<F> MergeDag for DagMergeView<'_, F>
where
    F: Fn(&B256) -> Option<ExecutionEffect>,
{
    type Block = RankedHash;
    type Effect = ExecutionEffect;

    fn parents(&self, block: &RankedHash) -> Result<Vec<RankedHash>, InvariantViolation> {
        let meta = self.dag.expect_lookup(&block.hash)?;
        meta.parents.iter().map(|parent| self.handle(parent)).collect()
    }

    fn effect(&self, block: &RankedHash) -> Result<ExecutionEffect, InvariantViolation> {
        (self.effects)(&block.hash)
            .ok_or_else(|| InvariantViolation(format!("no execution effect for {}", block.hash)))
    }
}
