//! Block signing and signature verification
//!
//! Blocks are signed with recoverable secp256k1 ECDSA over their hash. The signature is the
//! 65 byte `r || s || v` encoding; the signer's address is recovered and compared with the
//! block's sender.

use alloy_primitives::{keccak256, Address, Bytes, B256};
use k256::{
    ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
};
use std::fmt;
use thiserror::Error;

use crate::Block;

/// Length of an encoded recoverable signature
pub const SIGNATURE_LENGTH: usize = 65;

/// Signature failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Signature has the wrong size
    #[error("invalid signature length: expected {SIGNATURE_LENGTH}, got {0}")]
    InvalidLength(usize),

    /// Signature bytes do not decode or recover
    #[error("malformed signature: {0}")]
    Malformed(String),

    /// Recovered signer differs from the block sender
    #[error("signer mismatch: block sender {expected}, recovered {recovered}")]
    SignerMismatch {
        /// Declared sender
        expected: Address,
        /// Address recovered from the signature
        recovered: Address,
    },

    /// Secret key bytes are not a valid scalar
    #[error("invalid secret key")]
    InvalidKey,
}

/// Checks that a block was produced by its declared sender.
pub trait SignatureVerifier: Send + Sync + fmt::Debug {
    /// Verify the block's signature
    fn verify(&self, block: &Block) -> Result<(), SignatureError>;
}

/// Recovers the signer address from a secp256k1 signature over the block hash.
///
/// The genesis block is unsigned and always passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Verifier;

impl SignatureVerifier for Secp256k1Verifier {
    fn verify(&self, block: &Block) -> Result<(), SignatureError> {
        if block.is_genesis() {
            return Ok(());
        }
        let recovered = recover_signer(&block.hash, &block.signature)?;
        if recovered != block.sender {
            return Err(SignatureError::SignerMismatch { expected: block.sender, recovered });
        }
        Ok(())
    }
}

/// Recover the address that produced `signature` over `hash`
pub fn recover_signer(hash: &B256, signature: &[u8]) -> Result<Address, SignatureError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(SignatureError::InvalidLength(signature.len()));
    }
    let sig = Signature::from_slice(&signature[..64])
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let recovery_id = RecoveryId::from_byte(signature[64])
        .ok_or_else(|| SignatureError::Malformed(format!("recovery id {}", signature[64])))?;
    let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &sig, recovery_id)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    Ok(public_key_to_address(&key))
}

/// Ethereum style address of a public key
pub fn public_key_to_address(key: &VerifyingKey) -> Address {
    let point = key.as_affine().to_encoded_point(false);
    Address::from_slice(&keccak256(&point.as_bytes()[1..])[12..])
}

/// A validator's signing key.
#[derive(Clone)]
pub struct BlockSigner {
    key: SigningKey,
    address: Address,
}

impl BlockSigner {
    /// Wrap a signing key
    pub fn new(key: SigningKey) -> Self {
        let address = public_key_to_address(key.verifying_key());
        Self { key, address }
    }

    /// Build a signer from 32 secret key bytes
    pub fn from_secret(secret: &[u8]) -> Result<Self, SignatureError> {
        SigningKey::from_slice(secret).map(Self::new).map_err(|_| SignatureError::InvalidKey)
    }

    /// Deterministic key derived from a seed, for devnets and tests
    pub fn from_seed(seed: &[u8]) -> Result<Self, SignatureError> {
        Self::from_secret(keccak256(seed).as_slice())
    }

    /// Validator address of this key
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Sign a hash
    pub fn sign_hash(&self, hash: &B256) -> Result<Bytes, SignatureError> {
        let (sig, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        let mut out = Vec::with_capacity(SIGNATURE_LENGTH);
        out.extend_from_slice(&sig.to_bytes());
        out.push(recovery_id.to_byte());
        Ok(out.into())
    }

    /// Attach a signature over the block's hash
    pub fn sign_block(&self, mut block: Block) -> Result<Block, SignatureError> {
        block.signature = self.sign_hash(&block.hash)?;
        Ok(block)
    }
}

impl fmt::Debug for BlockSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockSigner").field("address", &self.address).finish_non_exhaustive()
    }
}
