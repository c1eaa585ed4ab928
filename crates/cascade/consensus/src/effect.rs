//! Execution effects and their commutativity algebra
//!
//! Executing a block yields, per touched key, the kind of access ([`Op`]) and the value change
//! ([`Transform`]). Two effects can be applied in either order when every shared key is only
//! read by both or only added to by both.

use alloy_primitives::{B256, U256};
use std::{collections::BTreeMap, ops::Add};

/// Access kind of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Op {
    /// Not touched
    #[default]
    NoOp,
    /// Only read
    Read,
    /// Overwritten
    Write,
    /// Only added to
    Add,
}

impl Op {
    /// Whether the two accesses can be reordered
    pub const fn commutes_with(self, other: Self) -> bool {
        matches!(
            (self, other),
            (Self::NoOp, _) | (_, Self::NoOp) | (Self::Read, Self::Read) | (Self::Add, Self::Add)
        )
    }
}

impl Add for Op {
    type Output = Self;

    /// Sequential composition: `self` then `rhs`
    fn add(self, rhs: Self) -> Self {
        match (self, rhs) {
            (op, Self::NoOp) | (Self::NoOp, op) => op,
            (Self::Read, Self::Read) => Self::Read,
            (Self::Add, Self::Add) => Self::Add,
            _ => Self::Write,
        }
    }
}

/// Per-key access kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpMap<K: Ord>(BTreeMap<K, Op>);

impl<K: Ord> Default for OpMap<K> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<K: Ord + Clone> OpMap<K> {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Compose `op` onto whatever is recorded for `key`
    pub fn record(&mut self, key: K, op: Op) {
        let entry = self.0.entry(key).or_default();
        *entry = *entry + op;
    }

    /// Access kind of a key (`NoOp` if untouched)
    pub fn get(&self, key: &K) -> Op {
        self.0.get(key).copied().unwrap_or_default()
    }

    /// Sequential composition of two maps
    pub fn combine(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (key, op) in &other.0 {
            out.record(key.clone(), *op);
        }
        out
    }

    /// Whether the ops of every shared key commute
    pub fn commutes_with(&self, other: &Self) -> bool {
        let (small, large) =
            if self.0.len() <= other.0.len() { (self, other) } else { (other, self) };
        small.0.iter().all(|(key, op)| op.commutes_with(large.get(key)))
    }

    /// Recorded entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&K, &Op)> {
        self.0.iter()
    }

    /// Number of touched keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no key is touched
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Ord + Clone> FromIterator<(K, Op)> for OpMap<K> {
    fn from_iter<I: IntoIterator<Item = (K, Op)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, op) in iter {
            map.record(key, op);
        }
        map
    }
}

/// Value change of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    /// Unchanged
    #[default]
    Identity,
    /// Set to a value
    Write(U256),
    /// Increment (wrapping)
    Add(U256),
}

impl Transform {
    /// Apply to the current value of a key
    pub fn apply(self, current: Option<U256>) -> Option<U256> {
        match self {
            Self::Identity => current,
            Self::Write(value) => Some(value),
            Self::Add(delta) => Some(current.unwrap_or_default().wrapping_add(delta)),
        }
    }
}

impl Add for Transform {
    type Output = Self;

    /// `self` then `rhs`
    fn add(self, rhs: Self) -> Self {
        match (self, rhs) {
            (t, Self::Identity) | (Self::Identity, t) => t,
            (_, Self::Write(value)) => Self::Write(value),
            (Self::Write(value), Self::Add(delta)) => Self::Write(value.wrapping_add(delta)),
            (Self::Add(a), Self::Add(b)) => Self::Add(a.wrapping_add(b)),
        }
    }
}

/// Effects that can be combined and tested for commutativity.
pub trait Effect: Clone {
    /// The effect of doing nothing
    fn empty() -> Self;

    /// `self` followed by `other`
    fn combine(&self, other: &Self) -> Self;

    /// Whether `self` and `other` may be applied in either order
    fn commutes_with(&self, other: &Self) -> bool;
}

impl<K: Ord + Clone> Effect for OpMap<K> {
    fn empty() -> Self {
        Self::new()
    }

    fn combine(&self, other: &Self) -> Self {
        Self::combine(self, other)
    }

    fn commutes_with(&self, other: &Self) -> bool {
        Self::commutes_with(self, other)
    }
}

/// Everything a set of deploys did to the global state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionEffect {
    /// Access kinds
    pub ops: OpMap<B256>,
    /// Value changes
    pub transforms: BTreeMap<B256, Transform>,
}

impl ExecutionEffect {
    /// A read of `key`
    pub fn record_read(&mut self, key: B256) {
        self.push(key, Op::Read, Transform::Identity);
    }

    /// An overwrite of `key`
    pub fn record_write(&mut self, key: B256, value: U256) {
        self.push(key, Op::Write, Transform::Write(value));
    }

    /// An increment of `key`
    pub fn record_add(&mut self, key: B256, delta: U256) {
        self.push(key, Op::Add, Transform::Add(delta));
    }

    fn push(&mut self, key: B256, op: Op, transform: Transform) {
        self.ops.record(key, op);
        let entry = self.transforms.entry(key).or_default();
        *entry = *entry + transform;
    }

    /// Whether nothing was touched
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Effect for ExecutionEffect {
    fn empty() -> Self {
        Self::default()
    }

    fn combine(&self, other: &Self) -> Self {
        let mut transforms = self.transforms.clone();
        for (key, transform) in &other.transforms {
            let entry = transforms.entry(*key).or_default();
            *entry = *entry + *transform;
        }
        Self { ops: self.ops.combine(&other.ops), transforms }
    }

    fn commutes_with(&self, other: &Self) -> bool {
        self.ops.commutes_with(&other.ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::NoOp), Just(Op::Read), Just(Op::Write), Just(Op::Add)]
    }

    fn arb_effect() -> impl Strategy<Value = ExecutionEffect> {
        proptest::collection::vec((0u8..4, 0u8..3, any::<u64>()), 0..6).prop_map(|entries| {
            let mut effect = ExecutionEffect::default();
            for (key, kind, value) in entries {
                let key = B256::repeat_byte(key);
                match kind {
                    0 => effect.record_read(key),
                    1 => effect.record_write(key, U256::from(value)),
                    _ => effect.record_add(key, U256::from(value)),
                }
            }
            effect
        })
    }

    #[test]
    fn test_op_table() {
        assert_eq!(Op::Read + Op::Write, Op::Write);
        assert_eq!(Op::Read + Op::Add, Op::Write);
        assert_eq!(Op::Add + Op::Read, Op::Write);
        assert_eq!(Op::Add + Op::Add, Op::Add);
        assert_eq!(Op::Read + Op::Read, Op::Read);
        assert_eq!(Op::NoOp + Op::Add, Op::Add);

        assert!(Op::Read.commutes_with(Op::Read));
        assert!(Op::Add.commutes_with(Op::Add));
        assert!(Op::NoOp.commutes_with(Op::Write));
        assert!(!Op::Read.commutes_with(Op::Add));
        assert!(!Op::Write.commutes_with(Op::Write));
    }

    #[test]
    fn test_transform_compose() {
        let one = U256::from(1u64);
        let five = U256::from(5u64);
        assert_eq!(
            Transform::Write(five) + Transform::Add(one),
            Transform::Write(U256::from(6u64))
        );
        assert_eq!(Transform::Add(one) + Transform::Write(five), Transform::Write(five));
        assert_eq!(Transform::Add(one) + Transform::Add(five), Transform::Add(U256::from(6u64)));
        assert_eq!(Transform::Add(five).apply(None), Some(five));
        assert_eq!(Transform::Identity.apply(Some(one)), Some(one));
    }

    #[test]
    fn test_opmap_commutes() {
        let a: OpMap<u8> = [(1, Op::Read), (2, Op::Add)].into_iter().collect();
        let b: OpMap<u8> = [(1, Op::Read), (3, Op::Write)].into_iter().collect();
        let c: OpMap<u8> = [(2, Op::Write)].into_iter().collect();
        assert!(a.commutes_with(&b));
        assert!(!a.commutes_with(&c));
        assert!(b.commutes_with(&c));
        assert_eq!(a.combine(&c).get(&2), Op::Write);
    }

    proptest! {
        #[test]
        fn proptest_noop_neutral(op in arb_op()) {
            prop_assert_eq!(op + Op::NoOp, op);
            prop_assert_eq!(Op::NoOp + op, op);
            prop_assert!(op.commutes_with(Op::NoOp));
        }

        #[test]
        fn proptest_op_associative(a in arb_op(), b in arb_op(), c in arb_op()) {
            prop_assert_eq!((a + b) + c, a + (b + c));
        }

        #[test]
        fn proptest_commutes_symmetric(a in arb_op(), b in arb_op()) {
            prop_assert_eq!(a.commutes_with(b), b.commutes_with(a));
        }

        #[test]
        fn proptest_write_absorbs(op in arb_op()) {
            prop_assert_eq!(Op::Write + op, Op::Write);
            prop_assert_eq!(op + Op::Write, Op::Write);
        }

        #[test]
        fn proptest_commuting_effects_reorder(a in arb_effect(), b in arb_effect()) {
            if a.commutes_with(&b) {
                prop_assert_eq!(a.combine(&b), b.combine(&a));
            }
        }
    }
}
