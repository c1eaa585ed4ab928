//! Voting matrix and committee search
//!
//! Row `i` of the matrix holds, for every validator `j`, the rank of the highest block by `j`
//! that `i` has acknowledged through its justifications. Together with every validator's first
//! level-zero vote (the branch above the root its messages support, and the rank at which that
//! support started) this is enough to find committees: sets of validators that have all seen
//! each other vote for the same branch.

use alloy_primitives::B256;
use cascade_dag::{BlockDagRepresentation, BlockMetadata, InvariantViolation, Validator, Weight};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::ControlFlow,
};

/// A validator's first vote on the current branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelZeroVote {
    /// Main child of the root the vote supports
    pub branch: B256,
    /// Rank of the block that started supporting it
    pub rank: u64,
}

/// A set of validators that acknowledge each other's votes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committee {
    /// Members
    pub members: BTreeSet<Validator>,
    /// Smallest acknowledged vote weight among members
    pub quorum: u128,
}

/// Matrix of acknowledged ranks, rooted at one block.
#[derive(Debug, Clone)]
pub struct VotingMatrix {
    root: B256,
    validators: Vec<Validator>,
    index: HashMap<Validator, usize>,
    weights: Vec<Weight>,
    total_weight: u128,
    /// `ranks[i][j]`: highest rank of `j` seen by `i`, zero when nothing was seen
    ranks: Vec<Vec<u64>>,
    first_level_zero_votes: Vec<Option<LevelZeroVote>>,
}

impl VotingMatrix {
    /// Empty matrix over the validators bonded at `root`
    pub fn new(dag: &BlockDagRepresentation, root: B256) -> Result<Self, InvariantViolation> {
        let weights = root_weights(dag, &root)?;
        let validators: Vec<_> = weights.keys().copied().collect();
        let n = validators.len();
        Ok(Self {
            root,
            index: validators.iter().enumerate().map(|(i, v)| (*v, i)).collect(),
            weights: weights.values().copied().collect(),
            total_weight: weights.values().map(|w| u128::from(*w)).sum(),
            validators,
            ranks: vec![vec![0; n]; n],
            first_level_zero_votes: vec![None; n],
        })
    }

    /// Matrix rooted at `root` with every block above it replayed in topological order
    pub fn build(dag: &BlockDagRepresentation, root: B256) -> Result<Self, InvariantViolation> {
        let mut matrix = Self::new(dag, root)?;
        let root_rank = dag.expect_lookup(&root)?.rank;
        for layer in dag.topo_sort(root_rank + 1) {
            for hash in layer {
                matrix.add_block(dag, dag.expect_lookup(&hash)?)?;
            }
        }
        Ok(matrix)
    }

    /// Root block
    pub const fn root(&self) -> B256 {
        self.root
    }

    /// Sum of bonded weight
    pub const fn total_weight(&self) -> u128 {
        self.total_weight
    }

    /// Weight of a validator, zero if unbonded
    pub fn weight(&self, validator: &Validator) -> Weight {
        self.index.get(validator).map_or(0, |i| self.weights[*i])
    }

    /// Acknowledged rank of `to` in the row of `from`
    pub fn rank_seen(&self, from: &Validator, to: &Validator) -> Option<u64> {
        Some(self.ranks[*self.index.get(from)?][*self.index.get(to)?])
    }

    /// First level-zero vote of a validator
    pub fn level_zero_vote(&self, validator: &Validator) -> Option<LevelZeroVote> {
        self.first_level_zero_votes[*self.index.get(validator)?]
    }

    /// Record a block's votes.
    ///
    /// Blocks that do not descend from the root, and blocks of unbonded senders, change nothing.
    pub fn add_block(
        &mut self,
        dag: &BlockDagRepresentation,
        block: &BlockMetadata,
    ) -> Result<(), InvariantViolation> {
        let Some(&sender) = self.index.get(&block.sender) else { return Ok(()) };
        let Some(branch) = dag.main_chain_child_of(&self.root, &block.hash) else {
            return Ok(());
        };

        let mut panorama = vec![0; self.validators.len()];
        for (validator, target) in &block.justifications {
            if let Some(j) = self.index.get(validator) {
                panorama[*j] = dag.expect_lookup(target)?.rank;
            }
        }
        panorama[sender] = block.rank;

        for (seen, rank) in self.ranks[sender].iter_mut().zip(panorama) {
            *seen = (*seen).max(rank);
        }

        let vote = &mut self.first_level_zero_votes[sender];
        if vote.is_none_or(|current| current.branch != branch) {
            *vote = Some(LevelZeroVote { branch, rank: block.rank });
        }
        Ok(())
    }

    /// Weight of validators whose first vote is on each branch
    pub fn branch_weights(&self) -> BTreeMap<B256, u128> {
        let mut out = BTreeMap::new();
        for (i, vote) in self.first_level_zero_votes.iter().enumerate() {
            if let Some(vote) = vote {
                *out.entry(vote.branch).or_default() += u128::from(self.weights[i]);
            }
        }
        out
    }

    /// Most supported branch, ties go to the smaller hash
    pub fn candidate(&self) -> Option<B256> {
        self.branch_weights()
            .into_iter()
            .max_by(|(a, a_weight), (b, b_weight)| a_weight.cmp(b_weight).then_with(|| b.cmp(a)))
            .map(|(branch, _)| branch)
    }

    /// Total weight of validators the DAG marks as equivocators
    pub fn initial_fault(&self, dag: &BlockDagRepresentation) -> u128 {
        dag.equivocators().iter().map(|v| u128::from(self.weight(v))).sum()
    }

    /// Whether a quorum is safe against `fault` weight of known equivocators
    pub const fn is_safe(&self, quorum: u128, fault: u128) -> bool {
        2 * quorum.saturating_sub(fault) > self.total_weight
    }

    /// Peel the committee around `candidate` until `visit` breaks or no member is left.
    ///
    /// Every round hands the current committee to `visit`, then drops all members whose
    /// acknowledged vote weight equals the round's quorum.
    pub fn peel<T>(
        &self,
        candidate: &B256,
        mut visit: impl FnMut(&Committee) -> ControlFlow<T>,
    ) -> Option<T> {
        let mut members: Vec<usize> = (0..self.validators.len())
            .filter(|i| self.voted_for(*i, candidate).is_some())
            .collect();

        while !members.is_empty() {
            let sums: Vec<u128> = members
                .iter()
                .map(|i| {
                    members
                        .iter()
                        .filter(|j| {
                            self.voted_for(**j, candidate)
                                .is_some_and(|rank| rank <= self.ranks[*i][**j])
                        })
                        .map(|j| u128::from(self.weights[*j]))
                        .sum()
                })
                .collect();
            let quorum = sums.iter().copied().min().unwrap_or_default();

            let committee = Committee {
                members: members.iter().map(|i| self.validators[*i]).collect(),
                quorum,
            };
            if let ControlFlow::Break(result) = visit(&committee) {
                return Some(result);
            }

            members = members
                .into_iter()
                .zip(sums)
                .filter(|(_, sum)| *sum != quorum)
                .map(|(i, _)| i)
                .collect();
        }
        None
    }

    /// Find a committee safe against `fault` on the most supported branch
    pub fn find_committee(&self, fault: u128) -> Option<(B256, Committee)> {
        let candidate = self.candidate()?;
        self.peel(&candidate, |committee| {
            let weight: u128 = committee.members.iter().map(|v| u128::from(self.weight(v))).sum();
            if self.is_safe(committee.quorum, fault) {
                ControlFlow::Break(Some(committee.clone()))
            } else if !self.is_safe(weight, fault) {
                ControlFlow::Break(None)
            } else {
                ControlFlow::Continue(())
            }
        })
        .flatten()
        .map(|committee| (candidate, committee))
    }

    /// Largest quorum reached while peeling the committee around `candidate`
    pub fn max_quorum(&self, candidate: &B256) -> u128 {
        let mut max = 0;
        self.peel::<()>(candidate, |committee| {
            max = max.max(committee.quorum);
            ControlFlow::Continue(())
        });
        max
    }

    /// `(max_quorum - fault) / total`, within `[-1, 1]`
    pub fn fault_tolerance(&self, candidate: &B256, fault: u128) -> f64 {
        normalize(self.max_quorum(candidate), fault, self.total_weight)
    }

    fn voted_for(&self, validator: usize, branch: &B256) -> Option<u64> {
        self.first_level_zero_votes[validator]
            .filter(|vote| vote.branch == *branch)
            .map(|vote| vote.rank)
    }
}

/// `(quorum - fault) / total`, clamped to `[-1, 1]`
pub fn normalize(quorum: u128, fault: u128, total: u128) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let value = (quorum as f64 - fault as f64) / total as f64;
    value.clamp(-1.0, 1.0)
}

/// Weights votes above `root` are counted with: the bonds recorded in the root itself
fn root_weights(
    dag: &BlockDagRepresentation,
    root: &B256,
) -> Result<BTreeMap<Validator, Weight>, InvariantViolation> {
    let meta = dag.expect_lookup(root)?;
    if meta.bonds.is_empty() {
        return dag.main_parent_weight_map(root);
    }
    Ok(meta.bonds.clone())
}
