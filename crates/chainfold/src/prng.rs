//! Per-block deterministic randomness.
//!
//! The seed of height H is keccak(seeds of the previous [SEED_HISTORY] heights, oldest
//! first, then H's block hash). Every node derives the same ChaCha20 stream.

use crate::store::{progress, BlockTx, ReadTx, StoreError};
use alloy::primitives::B256;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sha3::{Digest, Keccak256};

/// Number of prior seeds folded into each new one.
pub const SEED_HISTORY: u64 = 3;

/// Randomness handed to the state transition for one block.
pub type BlockRng = ChaCha20Rng;

pub fn derive_seed(reader: &impl ReadTx, height: u64, block_hash: &B256) -> Result<B256, StoreError> {
    let mut hasher = Keccak256::new();
    for h in height.saturating_sub(SEED_HISTORY)..height {
        if let Some(seed) = progress::seed(reader, h)? {
            hasher.update(seed.as_slice());
        }
    }
    hasher.update(block_hash.as_slice());
    Ok(B256::from_slice(&hasher.finalize()))
}

/// Derive, persist and return the generator for `height`. Seeds that fall out of the
/// history window are deleted.
pub fn seed_block(tx: &mut BlockTx, height: u64, block_hash: &B256) -> Result<BlockRng, StoreError> {
    let seed = derive_seed(&*tx, height, block_hash)?;
    progress::set_seed(tx, height, &seed)?;
    if let Some(stale) = height.checked_sub(SEED_HISTORY + 1) {
        progress::delete_seed(tx, stale);
    }
    Ok(ChaCha20Rng::from_seed(seed.0))
}
