//! GHOST-style fork choice over main-parent links
//!
//! Every validator backs the main-parent chains of its latest messages. Starting at the root the
//! estimator repeatedly descends into the heaviest main child; siblings that also carry support
//! are resolved to their own tips and returned after the primary one, giving the proposer a set
//! of merge candidates.

use alloy_primitives::B256;
use cascade_dag::{BlockDagRepresentation, InvariantViolation, Validator};
use std::{
    cmp::{Ordering, Reverse},
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
};
use tracing::debug;

/// Accumulated support per block
pub type Scores = HashMap<B256, u128>;

/// Fork choice entry point.
#[derive(Debug, Default, Clone, Copy)]
pub struct Estimator;

impl Estimator {
    /// Compute the ordered tips above `root`, see [`tips`]
    pub fn tips(
        &self,
        dag: &BlockDagRepresentation,
        root: B256,
        latest_messages: &BTreeMap<Validator, BTreeSet<B256>>,
    ) -> Result<Vec<B256>, InvariantViolation> {
        let tips = tips(dag, root, latest_messages)?;
        debug!(
            target: "cascade::estimator",
            %root,
            primary = %tips[0],
            count = tips.len(),
            "Estimated tips"
        );
        Ok(tips)
    }
}

/// Ordered fork-choice tips: the greedy heaviest tip first, then the tips of supported siblings.
/// A sibling tip that an earlier tip already includes through any parent is left out.
///
/// Never empty: without any support the root itself is returned.
pub fn tips(
    dag: &BlockDagRepresentation,
    root: B256,
    latest_messages: &BTreeMap<Validator, BTreeSet<B256>>,
) -> Result<Vec<B256>, InvariantViolation> {
    dag.expect_lookup(&root)?;
    if latest_messages.is_empty() {
        return Ok(vec![root]);
    }

    let scores = score(dag, root, latest_messages)?;

    let mut siblings: Vec<(B256, u128)> = Vec::new();
    let mut current = root;
    while let Some(next) = heaviest_child(dag, &scores, &current) {
        siblings.extend(
            supported_children(dag, &scores, &current)
                .into_iter()
                .filter(|(child, _)| *child != next),
        );
        current = next;
    }
    let mut tips = vec![current];

    siblings.sort_by(|(a, a_score), (b, b_score)| b_score.cmp(a_score).then_with(|| a.cmp(b)));
    for (sibling, _) in siblings {
        let tip = greedy_tip(dag, &scores, sibling);
        if !tips.iter().any(|chosen| dag.is_ancestor(&tip, chosen)) {
            tips.push(tip);
        }
    }

    Ok(tips)
}

/// Support of every block at or above `root`.
///
/// A validator adds its weight once to each block on the union of the main-parent chains from its
/// latest messages down to the root. Chains that miss the root add nothing; unknown latest
/// messages are skipped.
pub fn score(
    dag: &BlockDagRepresentation,
    root: B256,
    latest_messages: &BTreeMap<Validator, BTreeSet<B256>>,
) -> Result<Scores, InvariantViolation> {
    let weights = dag.main_parent_weight_map(&root)?;
    let root_rank = dag.expect_lookup(&root)?.rank;
    let mut scores = Scores::new();

    for (validator, hashes) in latest_messages {
        let weight = weights.get(validator).copied().unwrap_or_default();
        if weight == 0 {
            continue;
        }

        let mut supported: HashSet<B256> = HashSet::new();
        for hash in hashes {
            let Some(mut meta) = dag.lookup(hash) else { continue };
            let mut path = Vec::new();
            let reached = loop {
                if supported.contains(&meta.hash) {
                    break true;
                }
                path.push(meta.hash);
                if meta.hash == root {
                    break true;
                }
                if meta.rank <= root_rank {
                    break false;
                }
                let Some(parent) = meta.main_parent() else { break false };
                meta = dag.expect_lookup(&parent)?;
            };
            if reached {
                supported.extend(path);
            }
        }

        for hash in supported {
            *scores.entry(hash).or_default() += u128::from(weight);
        }
    }

    Ok(scores)
}

fn supported_children(
    dag: &BlockDagRepresentation,
    scores: &Scores,
    block: &B256,
) -> Vec<(B256, u128)> {
    dag.main_children(block)
        .into_iter()
        .filter_map(|child| {
            scores.get(&child).copied().filter(|score| *score > 0).map(|score| (child, score))
        })
        .collect()
}

/// Highest score wins, ties go to the smaller hash
fn heaviest_child(dag: &BlockDagRepresentation, scores: &Scores, block: &B256) -> Option<B256> {
    supported_children(dag, scores, block)
        .into_iter()
        .max_by(|(a, a_score), (b, b_score)| compare(*a_score, a, *b_score, b))
        .map(|(child, _)| child)
}

fn compare(a_score: u128, a: &B256, b_score: u128, b: &B256) -> Ordering {
    (a_score, Reverse(a)).cmp(&(b_score, Reverse(b)))
}

fn greedy_tip(dag: &BlockDagRepresentation, scores: &Scores, start: B256) -> B256 {
    let mut current = start;
    while let Some(next) = heaviest_child(dag, scores, &current) {
        current = next;
    }
    current
}
