//! In-memory reference executor
//!
//! State is a sorted key/value map; its root is the blake3 hash of the entries. Every state the
//! executor produced stays addressable by root, so replaying a block from any known parent
//! state works. Bonds live in the same map under [`bond_key`].

use alloy_primitives::{keccak256, B256, U256};
use cascade_consensus::{
    DeployResult, DeployStatus, Effect, ExecutionEffect, ExecutionOutcome, Executor, ExecutorError,
};
use cascade_dag::{Deploy, DeployOp, Validator, Weight};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, trace};

type State = BTreeMap<B256, U256>;

/// State key holding a validator's bonded stake
pub fn bond_key(validator: &Validator) -> B256 {
    let mut data = Vec::with_capacity(33);
    data.extend_from_slice(b"CASCADE_BOND:");
    data.extend_from_slice(validator.as_slice());
    keccak256(&data)
}

/// Root of a state
pub fn state_root(state: &BTreeMap<B256, U256>) -> B256 {
    let mut hasher = blake3::Hasher::new();
    for (key, value) in state {
        hasher.update(key.as_slice());
        hasher.update(&value.to_be_bytes::<32>());
    }
    B256::from(*hasher.finalize().as_bytes())
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<B256, Arc<State>>,
    /// Bond key -> validator, for every validator ever bonded
    validators: HashMap<B256, Validator>,
}

impl Inner {
    fn state(&self, root: B256) -> Result<Arc<State>, ExecutorError> {
        self.states.get(&root).cloned().ok_or(ExecutorError::UnknownState(root))
    }

    fn store(&mut self, state: State) -> B256 {
        let root = state_root(&state);
        self.states.entry(root).or_insert_with(|| Arc::new(state));
        root
    }

    fn register(&mut self, validator: Validator) -> B256 {
        let key = bond_key(&validator);
        self.validators.insert(key, validator);
        key
    }

    fn apply(&mut self, pre_state: B256, effect: &ExecutionEffect) -> Result<B256, ExecutorError> {
        let mut state = (*self.state(pre_state)?).clone();
        for (key, transform) in &effect.transforms {
            if let Some(value) = transform.apply(state.get(key).copied()) {
                state.insert(*key, value);
            }
        }
        Ok(self.store(state))
    }

    /// Run one deploy against `state`, recording what it did
    fn execute(
        &mut self,
        deploy: &Deploy,
        state: &mut State,
        effect: &mut ExecutionEffect,
    ) -> Result<(), String> {
        for op in &deploy.ops {
            match *op {
                DeployOp::Read(key) => {
                    if !state.contains_key(&key) {
                        return Err(format!("read of missing key {key}"));
                    }
                    effect.record_read(key);
                }
                DeployOp::Write(key, value) => {
                    state.insert(key, value);
                    effect.record_write(key, value);
                }
                DeployOp::Add(key, delta) => {
                    let value = state.entry(key).or_default();
                    *value = value.wrapping_add(delta);
                    effect.record_add(key, delta);
                }
                DeployOp::Bond(validator, stake) => {
                    if stake == 0 {
                        return Err(format!("zero stake bond for {validator}"));
                    }
                    let key = self.register(validator);
                    state.insert(key, U256::from(stake));
                    effect.record_write(key, U256::from(stake));
                }
                DeployOp::Unbond(validator) => {
                    let key = bond_key(&validator);
                    if state.get(&key).is_none_or(|stake| stake.is_zero()) {
                        return Err(format!("{validator} is not bonded"));
                    }
                    state.insert(key, U256::ZERO);
                    effect.record_write(key, U256::ZERO);
                }
            }
        }
        Ok(())
    }
}

/// [`Executor`] keeping every state in memory.
#[derive(Debug)]
pub struct InMemoryExecutor {
    inner: Mutex<Inner>,
}

impl Default for InMemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryExecutor {
    /// Executor knowing only the empty state
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.store(State::new());
        Self { inner: Mutex::new(inner) }
    }

    /// Root of the empty state
    pub fn empty_state_root() -> B256 {
        state_root(&State::new())
    }

    /// Value of a key in a state
    pub fn get(&self, state: B256, key: &B256) -> Result<Option<U256>, ExecutorError> {
        Ok(self.inner.lock().state(state)?.get(key).copied())
    }

    /// Number of distinct states held
    pub fn state_count(&self) -> usize {
        self.inner.lock().states.len()
    }
}

impl Executor for InMemoryExecutor {
    fn compute_effect(
        &self,
        pre_state: B256,
        deploys: &[Deploy],
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let mut inner = self.inner.lock();
        let mut state = (*inner.state(pre_state)?).clone();
        let mut effect = ExecutionEffect::default();
        let mut results = Vec::with_capacity(deploys.len());

        for deploy in deploys {
            let mut scratch = state.clone();
            let mut deploy_effect = ExecutionEffect::default();
            let status = match inner.execute(deploy, &mut scratch, &mut deploy_effect) {
                Ok(()) => {
                    state = scratch;
                    effect = effect.combine(&deploy_effect);
                    DeployStatus::Success
                }
                Err(reason) => {
                    debug!(
                        target: "cascade::executor",
                        deploy = %deploy.hash,
                        %reason,
                        "Deploy failed"
                    );
                    DeployStatus::Failed(reason)
                }
            };
            results.push(DeployResult { deploy: deploy.hash, status });
        }

        let post_state = inner.store(state);
        trace!(
            target: "cascade::executor",
            %pre_state,
            %post_state,
            deploys = deploys.len(),
            "Deploys executed"
        );
        Ok(ExecutionOutcome { post_state, results, effect })
    }

    fn commit(&self, pre_state: B256, effect: &ExecutionEffect) -> Result<B256, ExecutorError> {
        if effect.is_empty() {
            return self.inner.lock().state(pre_state).map(|_| pre_state);
        }
        self.inner.lock().apply(pre_state, effect)
    }

    fn weight_map(&self, state: B256) -> Result<BTreeMap<Validator, Weight>, ExecutorError> {
        let inner = self.inner.lock();
        let values = inner.state(state)?;
        let mut bonds = BTreeMap::new();
        for (key, validator) in &inner.validators {
            let Some(stake) = values.get(key).filter(|stake| !stake.is_zero()) else { continue };
            let stake = Weight::try_from(*stake).map_err(|_| {
                ExecutorError::InvalidBonds(format!("stake of {validator} overflows: {stake}"))
            })?;
            bonds.insert(*validator, stake);
        }
        Ok(bonds)
    }

    fn genesis(
        &self,
        bonds: &BTreeMap<Validator, Weight>,
        allocations: &BTreeMap<B256, U256>,
    ) -> Result<(B256, ExecutionEffect), ExecutorError> {
        if bonds.is_empty() {
            return Err(ExecutorError::InvalidBonds("no validators".into()));
        }

        let mut inner = self.inner.lock();
        let mut effect = ExecutionEffect::default();
        for (key, balance) in allocations {
            effect.record_write(*key, *balance);
        }
        for (validator, stake) in bonds {
            if *stake == 0 {
                return Err(ExecutorError::InvalidBonds(format!("zero stake for {validator}")));
            }
            let key = inner.register(*validator);
            effect.record_write(key, U256::from(*stake));
        }

        let root = inner.apply(Self::empty_state_root(), &effect)?;
        debug!(target: "cascade::executor", %root, validators = bonds.len(), "Genesis state");
        Ok((root, effect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    fn key(n: u8) -> B256 {
        B256::repeat_byte(n)
    }

    fn deploy(ops: Vec<DeployOp>) -> Deploy {
        Deploy::new(Address::repeat_byte(0xaa), 1, ops)
    }

    fn genesis(executor: &InMemoryExecutor) -> B256 {
        let bonds = BTreeMap::from([(Address::repeat_byte(1), 10), (Address::repeat_byte(2), 20)]);
        let allocations = BTreeMap::from([(key(1), U256::from(100))]);
        executor.genesis(&bonds, &allocations).unwrap().0
    }

    #[test]
    fn test_genesis_state() {
        let executor = InMemoryExecutor::new();
        let root = genesis(&executor);

        assert_eq!(executor.get(root, &key(1)).unwrap(), Some(U256::from(100)));
        let bonds = executor.weight_map(root).unwrap();
        assert_eq!(bonds.get(&Address::repeat_byte(2)), Some(&20));
        assert_eq!(bonds.len(), 2);

        // Deterministic across executors
        assert_eq!(genesis(&InMemoryExecutor::new()), root);
    }

    #[test]
    fn test_genesis_rejects_empty_bonds() {
        let executor = InMemoryExecutor::new();
        assert!(matches!(
            executor.genesis(&BTreeMap::new(), &BTreeMap::new()),
            Err(ExecutorError::InvalidBonds(_))
        ));
    }

    #[test]
    fn test_failed_deploy_has_no_effect() {
        let executor = InMemoryExecutor::new();
        let root = genesis(&executor);

        let ok = deploy(vec![DeployOp::Add(key(1), U256::from(5))]);
        let failing = deploy(vec![DeployOp::Write(key(2), U256::from(1)), DeployOp::Read(key(9))]);
        let outcome = executor.compute_effect(root, &[ok, failing]).unwrap();

        assert_eq!(outcome.results[0].status, DeployStatus::Success);
        assert!(matches!(outcome.results[1].status, DeployStatus::Failed(_)));
        assert_eq!(executor.get(outcome.post_state, &key(1)).unwrap(), Some(U256::from(105)));
        assert_eq!(executor.get(outcome.post_state, &key(2)).unwrap(), None);
        assert_eq!(outcome.effect.transforms.len(), 1);
    }

    #[test]
    fn test_commit_matches_execution() {
        let executor = InMemoryExecutor::new();
        let root = genesis(&executor);
        let outcome = executor
            .compute_effect(
                root,
                &[deploy(vec![
                    DeployOp::Read(key(1)),
                    DeployOp::Write(key(3), U256::from(7)),
                    DeployOp::Add(key(1), U256::from(1)),
                ])],
            )
            .unwrap();

        assert_eq!(executor.commit(root, &outcome.effect).unwrap(), outcome.post_state);
        assert_eq!(executor.commit(root, &ExecutionEffect::default()).unwrap(), root);
        assert_eq!(
            executor.commit(key(0xee), &outcome.effect),
            Err(ExecutorError::UnknownState(key(0xee)))
        );
    }

    #[test]
    fn test_bond_and_unbond() {
        let executor = InMemoryExecutor::new();
        let root = genesis(&executor);
        let newcomer = Address::repeat_byte(3);

        let bonded = executor
            .compute_effect(root, &[deploy(vec![DeployOp::Bond(newcomer, 5)])])
            .unwrap()
            .post_state;
        assert_eq!(executor.weight_map(bonded).unwrap().get(&newcomer), Some(&5));

        let unbonded = executor
            .compute_effect(bonded, &[deploy(vec![DeployOp::Unbond(Address::repeat_byte(1))])])
            .unwrap()
            .post_state;
        let bonds = executor.weight_map(unbonded).unwrap();
        assert!(!bonds.contains_key(&Address::repeat_byte(1)));
        assert_eq!(bonds.len(), 2);

        let outcome = executor
            .compute_effect(unbonded, &[deploy(vec![DeployOp::Unbond(Address::repeat_byte(1))])])
            .unwrap();
        assert!(matches!(outcome.results[0].status, DeployStatus::Failed(_)));
        assert_eq!(outcome.post_state, unbonded);
    }
}
