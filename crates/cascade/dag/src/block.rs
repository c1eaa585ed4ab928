//! Block and deploy primitives

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Validator identity (address derived from the validator's secp256k1 key).
pub type Validator = Address;

/// Stake weight of a validator.
pub type Weight = u64;

/// Domain separator for block hashes.
const BLOCK_DOMAIN: &[u8] = b"CASCADE_BLOCK:";

/// Domain separator for deploy hashes.
const DEPLOY_DOMAIN: &[u8] = b"CASCADE_DEPLOY:";

/// A single state operation requested by a deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployOp {
    /// Read a key (fails if the key is unset)
    Read(B256),
    /// Overwrite a key
    Write(B256, U256),
    /// Add to the value under a key (missing keys count as zero)
    Add(B256, U256),
    /// Bond a validator with the given stake
    Bond(Validator, Weight),
    /// Remove a validator from the bonded set
    Unbond(Validator),
}

impl DeployOp {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Read(key) => {
                out.push(0x01);
                out.extend_from_slice(key.as_slice());
            }
            Self::Write(key, value) => {
                out.push(0x02);
                out.extend_from_slice(key.as_slice());
                out.extend_from_slice(&value.to_be_bytes::<32>());
            }
            Self::Add(key, value) => {
                out.push(0x03);
                out.extend_from_slice(key.as_slice());
                out.extend_from_slice(&value.to_be_bytes::<32>());
            }
            Self::Bond(validator, weight) => {
                out.push(0x04);
                out.extend_from_slice(validator.as_slice());
                out.extend_from_slice(&weight.to_be_bytes());
            }
            Self::Unbond(validator) => {
                out.push(0x05);
                out.extend_from_slice(validator.as_slice());
            }
        }
    }
}

/// A deploy: a signed-off batch of state operations submitted by an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deploy {
    /// Content hash
    pub hash: B256,
    /// Submitting account
    pub account: Address,
    /// Creation time (unix millis)
    pub timestamp: u64,
    /// Operations, applied in order
    pub ops: Vec<DeployOp>,
}

impl Deploy {
    /// Create a deploy and compute its hash
    pub fn new(account: Address, timestamp: u64, ops: Vec<DeployOp>) -> Self {
        let mut deploy = Self { hash: B256::ZERO, account, timestamp, ops };
        deploy.hash = deploy.compute_hash();
        deploy
    }

    /// Hash of the deploy contents
    pub fn compute_hash(&self) -> B256 {
        let mut data = Vec::with_capacity(64 + self.ops.len() * 65);
        data.extend_from_slice(DEPLOY_DOMAIN);
        data.extend_from_slice(self.account.as_slice());
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        for op in &self.ops {
            op.encode(&mut data);
        }
        keccak256(&data)
    }
}

/// A block of the DAG. Immutable once hashed and signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Content hash, see [`Block::compute_hash`]
    pub hash: B256,
    /// Height: `1 + max(parent ranks)`, zero for genesis
    pub rank: u64,
    /// Per-sender sequence number
    pub seq_num: u64,
    /// Proposing validator
    pub sender: Validator,
    /// Parent hashes; the first one is the main parent
    pub parents: Vec<B256>,
    /// Latest block of each validator seen by the sender
    pub justifications: BTreeMap<Validator, B256>,
    /// Bonded stake after this block's deploys
    pub bonds: BTreeMap<Validator, Weight>,
    /// State root after applying this block
    pub post_state_hash: B256,
    /// Deploys included in this block
    pub deploys: Vec<Deploy>,
    /// Creation time (unix millis)
    pub timestamp: u64,
    /// Recoverable secp256k1 signature over `hash` (empty for genesis)
    pub signature: Bytes,
}

impl Block {
    /// Hash over every field except `hash` and `signature`
    pub fn compute_hash(&self) -> B256 {
        let mut data = Vec::with_capacity(
            128 + 32 * self.parents.len() + 52 * self.justifications.len() + 28 * self.bonds.len(),
        );
        data.extend_from_slice(BLOCK_DOMAIN);
        data.extend_from_slice(&self.rank.to_be_bytes());
        data.extend_from_slice(&self.seq_num.to_be_bytes());
        data.extend_from_slice(self.sender.as_slice());

        data.extend_from_slice(&(self.parents.len() as u64).to_be_bytes());
        for parent in &self.parents {
            data.extend_from_slice(parent.as_slice());
        }

        data.extend_from_slice(&(self.justifications.len() as u64).to_be_bytes());
        for (validator, latest) in &self.justifications {
            data.extend_from_slice(validator.as_slice());
            data.extend_from_slice(latest.as_slice());
        }

        data.extend_from_slice(&(self.bonds.len() as u64).to_be_bytes());
        for (validator, weight) in &self.bonds {
            data.extend_from_slice(validator.as_slice());
            data.extend_from_slice(&weight.to_be_bytes());
        }

        data.extend_from_slice(self.post_state_hash.as_slice());
        data.extend_from_slice(&self.timestamp.to_be_bytes());

        data.extend_from_slice(&(self.deploys.len() as u64).to_be_bytes());
        for deploy in &self.deploys {
            data.extend_from_slice(deploy.hash.as_slice());
        }

        keccak256(&data)
    }

    /// Recompute and store the hash
    pub fn seal(mut self) -> Self {
        self.hash = self.compute_hash();
        self
    }

    /// The main (first) parent, `None` for genesis
    pub fn main_parent(&self) -> Option<B256> {
        self.parents.first().copied()
    }

    /// Whether this block is a genesis block
    pub fn is_genesis(&self) -> bool {
        self.parents.is_empty()
    }

    /// Total bonded stake recorded in this block
    pub fn total_weight(&self) -> Weight {
        self.bonds.values().fold(0, |acc, w| acc.saturating_add(*w))
    }
}

/// The part of a [`Block`] the consensus algorithms work with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMetadata {
    /// Block hash
    pub hash: B256,
    /// Block rank
    pub rank: u64,
    /// Sender sequence number
    pub seq_num: u64,
    /// Proposing validator
    pub sender: Validator,
    /// Parent hashes, main parent first
    pub parents: Vec<B256>,
    /// Justifications
    pub justifications: BTreeMap<Validator, B256>,
    /// Bonds recorded in the block
    pub bonds: BTreeMap<Validator, Weight>,
}

impl BlockMetadata {
    /// The main (first) parent
    pub fn main_parent(&self) -> Option<B256> {
        self.parents.first().copied()
    }
}

impl From<&Block> for BlockMetadata {
    fn from(block: &Block) -> Self {
        Self {
            hash: block.hash,
            rank: block.rank,
            seq_num: block.seq_num,
            sender: block.sender,
            parents: block.parents.clone(),
            justifications: block.justifications.clone(),
            bonds: block.bonds.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        Block {
            hash: B256::ZERO,
            rank: 1,
            seq_num: 0,
            sender: Address::repeat_byte(1),
            parents: vec![B256::repeat_byte(9)],
            justifications: BTreeMap::new(),
            bonds: BTreeMap::from([(Address::repeat_byte(1), 10)]),
            post_state_hash: B256::repeat_byte(7),
            deploys: vec![Deploy::new(
                Address::repeat_byte(3),
                5,
                vec![DeployOp::Write(B256::repeat_byte(4), U256::from(1u64))],
            )],
            timestamp: 1000,
            signature: Bytes::new(),
        }
        .seal()
    }

    #[test]
    fn test_hash_covers_contents() {
        let block = sample_block();
        assert_eq!(block.hash, block.compute_hash());

        let mut other = block.clone();
        other.parents.push(B256::repeat_byte(8));
        assert_ne!(other.compute_hash(), block.hash);
    }

    #[test]
    fn test_signature_not_hashed() {
        let block = sample_block();
        let mut signed = block.clone();
        signed.signature = Bytes::from(vec![1u8; 65]);
        assert_eq!(signed.compute_hash(), block.hash);
    }

    #[test]
    fn test_deploy_hash_depends_on_ops() {
        let account = Address::repeat_byte(1);
        let a = Deploy::new(account, 1, vec![DeployOp::Read(B256::repeat_byte(1))]);
        let b = Deploy::new(account, 1, vec![DeployOp::Read(B256::repeat_byte(2))]);
        assert_ne!(a.hash, b.hash);
        assert_eq!(a.hash, a.compute_hash());
    }

    #[test]
    fn test_block_json_roundtrip() {
        let block = sample_block();
        let json = serde_json::to_string(&block).unwrap();
        let decoded: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_metadata_projection() {
        let block = sample_block();
        let meta = BlockMetadata::from(&block);
        assert_eq!(meta.hash, block.hash);
        assert_eq!(meta.main_parent(), Some(B256::repeat_byte(9)));
        assert_eq!(block.total_weight(), 10);
    }
}
