//! Finality detection on top of the voting matrix

use alloy_primitives::B256;
use cascade_dag::BlockDagRepresentation;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    matrix::{normalize, VotingMatrix},
    FinalityConfig, FinalityError,
};

/// A block that became final
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FinalizedBlock {
    /// Block hash
    pub hash: B256,
    /// Block rank
    pub rank: u64,
    /// Normalized fault tolerance at the time of finalization
    pub fault_tolerance: f64,
}

/// Finality of a single block
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FinalityStatus {
    /// The LFB or one of its ancestors, through any parent
    Finalized {
        /// Fault tolerance recorded at finalization
        fault_tolerance: f64,
    },
    /// Still competing for finality
    Pending {
        /// Current normalized fault tolerance
        fault_tolerance: f64,
    },
    /// Can never become final
    Orphaned,
}

impl FinalityStatus {
    /// Normalized fault tolerance, `-1` for orphans
    pub fn fault_tolerance(&self) -> f64 {
        match self {
            Self::Finalized { fault_tolerance } | Self::Pending { fault_tolerance } => {
                *fault_tolerance
            }
            Self::Orphaned => -1.0,
        }
    }
}

/// Tracks the last finalized block (LFB) and the votes above it.
///
/// Only [`FinalityDetector::on_new_block_added_to_the_block_dag`] and
/// [`FinalityDetector::rebuild_from_latest_finalized_block`] change its state. Clones are cheap
/// enough to publish one per inserted block.
#[derive(Debug, Clone)]
pub struct FinalityDetector {
    config: FinalityConfig,
    last_finalized: B256,
    last_finalized_rank: u64,
    matrix: VotingMatrix,
    /// Fault tolerance recorded per finalized block
    finalized: imbl::HashMap<B256, f64>,
}

impl FinalityDetector {
    /// Start detecting above `last_finalized`, replaying every block already above it
    pub fn new(
        dag: &BlockDagRepresentation,
        last_finalized: B256,
        config: FinalityConfig,
    ) -> Result<Self, FinalityError> {
        let rank = lookup_rank(dag, &last_finalized)?;
        let mut finalized = imbl::HashMap::new();
        finalized.insert(last_finalized, 1.0);
        Ok(Self {
            config,
            last_finalized,
            last_finalized_rank: rank,
            matrix: VotingMatrix::build(dag, last_finalized)?,
            finalized,
        })
    }

    /// Last finalized block
    pub const fn last_finalized_block(&self) -> B256 {
        self.last_finalized
    }

    /// Rank of the last finalized block
    pub const fn last_finalized_rank(&self) -> u64 {
        self.last_finalized_rank
    }

    /// Active configuration
    pub const fn config(&self) -> &FinalityConfig {
        &self.config
    }

    /// Voting matrix rooted at the last finalized block
    pub const fn matrix(&self) -> &VotingMatrix {
        &self.matrix
    }

    /// Account for a block that was just inserted into `dag`.
    ///
    /// Returns every block finalized as a consequence, oldest first.
    pub fn on_new_block_added_to_the_block_dag(
        &mut self,
        dag: &BlockDagRepresentation,
        block_hash: B256,
    ) -> Result<Vec<FinalizedBlock>, FinalityError> {
        let block = dag.lookup(&block_hash).ok_or(FinalityError::UnknownBlock(block_hash))?;
        self.matrix.add_block(dag, block)?;

        let mut newly_finalized = Vec::new();
        loop {
            let fault = self.matrix.initial_fault(dag);
            let Some((candidate, committee)) = self.matrix.find_committee(fault) else { break };
            let finalized = FinalizedBlock {
                hash: candidate,
                rank: lookup_rank(dag, &candidate)?,
                fault_tolerance: normalize(committee.quorum, fault, self.matrix.total_weight()),
            };
            info!(
                target: "cascade::finality",
                hash = %finalized.hash,
                rank = finalized.rank,
                fault_tolerance = finalized.fault_tolerance,
                committee = committee.members.len(),
                "Block finalized"
            );
            self.finalized.insert(candidate, finalized.fault_tolerance);
            newly_finalized.push(finalized);
            self.rebuild_from_latest_finalized_block(dag, candidate)?;
        }

        Ok(newly_finalized)
    }

    /// Move the root to `new_lfb` and replay every block above it
    pub fn rebuild_from_latest_finalized_block(
        &mut self,
        dag: &BlockDagRepresentation,
        new_lfb: B256,
    ) -> Result<(), FinalityError> {
        let rank = lookup_rank(dag, &new_lfb)?;
        self.matrix = VotingMatrix::build(dag, new_lfb)?;
        self.last_finalized = new_lfb;
        self.last_finalized_rank = rank;
        if !self.finalized.contains_key(&new_lfb) {
            self.finalized.insert(new_lfb, 1.0);
        }
        debug!(target: "cascade::finality", lfb = %new_lfb, rank, "Voting matrix rebuilt");
        Ok(())
    }

    /// Finality of a block against the current LFB.
    ///
    /// Everything the LFB builds on is final, secondary parents included; blocks merged in that
    /// way carry the fault tolerance of the LFB. Any other block that does not build on the LFB
    /// is orphaned.
    pub fn status(
        &self,
        dag: &BlockDagRepresentation,
        hash: &B256,
    ) -> Result<FinalityStatus, FinalityError> {
        let meta = dag.lookup(hash).ok_or(FinalityError::UnknownBlock(*hash))?;

        if dag.is_ancestor(hash, &self.last_finalized) {
            let fault_tolerance = self
                .finalized
                .get(hash)
                .or_else(|| self.finalized.get(&self.last_finalized))
                .copied()
                .unwrap_or(1.0);
            return Ok(FinalityStatus::Finalized { fault_tolerance });
        }
        if meta.rank <= self.last_finalized_rank
            || !dag.is_in_main_chain(&self.last_finalized, hash)
        {
            return Ok(FinalityStatus::Orphaned);
        }

        let Some(main_parent) = meta.main_parent() else {
            return Ok(FinalityStatus::Orphaned);
        };
        let fault_tolerance = if main_parent == self.last_finalized {
            self.matrix.fault_tolerance(hash, self.matrix.initial_fault(dag))
        } else {
            let matrix = VotingMatrix::build(dag, main_parent)?;
            matrix.fault_tolerance(hash, matrix.initial_fault(dag))
        };
        Ok(FinalityStatus::Pending { fault_tolerance })
    }

    /// Normalized fault tolerance in `[-1, 1]`
    pub fn normalized_fault_tolerance(
        &self,
        dag: &BlockDagRepresentation,
        candidate: &B256,
    ) -> Result<f64, FinalityError> {
        self.status(dag, candidate).map(|status| status.fault_tolerance())
    }

    /// Whether the block is final or its fault tolerance exceeds the configured threshold
    pub fn is_final(
        &self,
        dag: &BlockDagRepresentation,
        hash: &B256,
    ) -> Result<bool, FinalityError> {
        Ok(match self.status(dag, hash)? {
            FinalityStatus::Finalized { .. } => true,
            FinalityStatus::Pending { fault_tolerance } => {
                fault_tolerance > self.config.fault_tolerance_threshold
            }
            FinalityStatus::Orphaned => false,
        })
    }
}

fn lookup_rank(dag: &BlockDagRepresentation, hash: &B256) -> Result<u64, FinalityError> {
    dag.lookup(hash).map(|meta| meta.rank).ok_or(FinalityError::UnknownBlock(*hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_dag::test_utils::{validator, TestDag};
    use std::collections::BTreeMap;

    fn three_validators() -> (TestDag, B256) {
        TestDag::with_genesis(&[(validator(1), 10), (validator(2), 10), (validator(3), 10)])
    }

    fn add(dag: &TestDag, detector: &mut FinalityDetector, hash: B256) -> Vec<FinalizedBlock> {
        detector.on_new_block_added_to_the_block_dag(&dag.representation(), hash).unwrap()
    }

    #[test]
    fn test_three_validator_chain_finalizes() {
        let (mut dag, genesis) = three_validators();
        let mut detector =
            FinalityDetector::new(&dag.representation(), genesis, FinalityConfig::default())
                .unwrap();

        let fork = dag.add_block_with_justifications(validator(3), &[genesis], BTreeMap::new());
        assert!(add(&dag, &mut detector, fork).is_empty());
        let a = dag.add_block(validator(1), &[genesis]);
        assert!(add(&dag, &mut detector, a).is_empty());
        let b = dag.add_block(validator(2), &[a]);
        assert!(add(&dag, &mut detector, b).is_empty());
        let c = dag.add_block(validator(3), &[b]);
        assert!(add(&dag, &mut detector, c).is_empty());

        let d = dag.add_block(validator(1), &[c]);
        let finalized = add(&dag, &mut detector, d);
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].hash, a);
        assert!((finalized[0].fault_tolerance - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(detector.last_finalized_block(), a);

        let snapshot = dag.representation();
        assert_eq!(
            detector.status(&snapshot, &genesis).unwrap(),
            FinalityStatus::Finalized { fault_tolerance: 1.0 }
        );
        let a_ft = detector.normalized_fault_tolerance(&snapshot, &a).unwrap();
        assert!((a_ft - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(detector.status(&snapshot, &fork).unwrap(), FinalityStatus::Orphaned);
        assert_eq!(detector.normalized_fault_tolerance(&snapshot, &fork).unwrap(), -1.0);

        // main child of the LFB and a deeper descendant
        let b_ft = detector.normalized_fault_tolerance(&snapshot, &b).unwrap();
        let c_ft = detector.normalized_fault_tolerance(&snapshot, &c).unwrap();
        assert!((b_ft - 1.0 / 3.0).abs() < 1e-9);
        assert!((c_ft - 1.0 / 3.0).abs() < 1e-9);
        assert!(detector.is_final(&snapshot, &a).unwrap());
        assert!(!detector.is_final(&snapshot, &b).unwrap());
    }

    #[test]
    fn test_merged_side_branch_finalized_with_lfb() {
        let (mut dag, genesis) = three_validators();
        let mut detector =
            FinalityDetector::new(&dag.representation(), genesis, FinalityConfig::default())
                .unwrap();

        let side = dag.add_block_with_justifications(validator(3), &[genesis], BTreeMap::new());
        add(&dag, &mut detector, side);
        let dropped = dag.add_block_with_justifications(validator(2), &[genesis], BTreeMap::new());
        add(&dag, &mut detector, dropped);
        let a = dag.add_block_with_justifications(
            validator(1),
            &[genesis],
            BTreeMap::from([(validator(3), side)]),
        );
        add(&dag, &mut detector, a);
        let merge = dag.add_block(validator(2), &[a, side]);
        add(&dag, &mut detector, merge);

        let mut tip = merge;
        for round in 0..24u8 {
            if detector.last_finalized_rank() >= 2 {
                break;
            }
            tip = dag.add_block(validator(round % 3 + 1), &[tip]);
            add(&dag, &mut detector, tip);
        }
        assert!(detector.last_finalized_rank() >= 2);

        let snapshot = dag.representation();
        let lfb = detector.last_finalized_block();
        assert!(snapshot.is_ancestor(&side, &lfb));
        assert!(!snapshot.is_in_main_chain(&side, &lfb));

        let lfb_ft = detector.normalized_fault_tolerance(&snapshot, &lfb).unwrap();
        assert_eq!(
            detector.status(&snapshot, &side).unwrap(),
            FinalityStatus::Finalized { fault_tolerance: lfb_ft }
        );
        assert!(detector.is_final(&snapshot, &side).unwrap());
        assert_eq!(detector.status(&snapshot, &dropped).unwrap(), FinalityStatus::Orphaned);
        assert!(!detector.is_final(&snapshot, &dropped).unwrap());
    }

    #[test]
    fn test_equivocator_weight_blocks_finality() {
        let (mut dag, genesis) = three_validators();
        let mut detector =
            FinalityDetector::new(&dag.representation(), genesis, FinalityConfig::default())
                .unwrap();

        let y = dag.add_block_with_justifications(validator(2), &[genesis], BTreeMap::new());
        let a = dag.add_block(validator(1), &[genesis]);
        let b = dag.add_block_with_justifications(
            validator(2),
            &[a],
            BTreeMap::from([(validator(1), a)]),
        );
        let c = dag.add_block(validator(3), &[b]);
        let d = dag.add_block(validator(1), &[c]);
        for hash in [y, a, b, c, d] {
            assert!(add(&dag, &mut detector, hash).is_empty());
        }

        let snapshot = dag.representation();
        assert!(snapshot.equivocators().contains(&validator(2)));
        let ft = detector.normalized_fault_tolerance(&snapshot, &a).unwrap();
        assert!((ft - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(detector.last_finalized_block(), genesis);
    }

    #[test]
    fn test_lfb_rank_monotonic() {
        let (mut dag, genesis) = three_validators();
        let mut detector =
            FinalityDetector::new(&dag.representation(), genesis, FinalityConfig::default())
                .unwrap();

        let mut tip = genesis;
        let mut last_rank = 0;
        let mut finalized = Vec::new();
        for round in 0..12u8 {
            tip = dag.add_block(validator(round % 3 + 1), &[tip]);
            finalized.extend(add(&dag, &mut detector, tip));
            assert!(detector.last_finalized_rank() >= last_rank);
            last_rank = detector.last_finalized_rank();
        }

        assert!(finalized.len() >= 2);
        assert!(finalized.windows(2).all(|pair| pair[0].rank < pair[1].rank));
        for block in &finalized {
            assert!(block.fault_tolerance > 0.5 && block.fault_tolerance <= 1.0);
        }
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let (mut dag, genesis) = three_validators();
        let mut detector =
            FinalityDetector::new(&dag.representation(), genesis, FinalityConfig::default())
                .unwrap();
        let mut tip = genesis;
        for round in 0..7u8 {
            tip = dag.add_block(validator(round % 3 + 1), &[tip]);
            add(&dag, &mut detector, tip);
        }

        let snapshot = dag.representation();
        let lfb = detector.last_finalized_block();
        let replayed = FinalityDetector::new(&snapshot, lfb, FinalityConfig::default()).unwrap();
        assert_eq!(replayed.matrix().branch_weights(), detector.matrix().branch_weights());
        assert_eq!(
            replayed.normalized_fault_tolerance(&snapshot, &tip).unwrap(),
            detector.normalized_fault_tolerance(&snapshot, &tip).unwrap()
        );
    }

    #[test]
    fn test_unknown_block() {
        let (dag, genesis) = three_validators();
        let mut detector =
            FinalityDetector::new(&dag.representation(), genesis, FinalityConfig::default())
                .unwrap();
        let missing = B256::repeat_byte(0x42);
        assert_eq!(
            detector.on_new_block_added_to_the_block_dag(&dag.representation(), missing),
            Err(FinalityError::UnknownBlock(missing))
        );
        assert_eq!(
            detector.normalized_fault_tolerance(&dag.representation(), &missing),
            Err(FinalityError::UnknownBlock(missing))
        );
    }
}
