//! Replay guard for submitted inputs.
//!
//! A key is live for `retention` blocks after it was recorded. Expiry is decided by height
//! arithmetic alone, so when [sweep] runs never changes which inputs are accepted.

use super::{BlockTx, Database, ReadTx, StoreError};
use alloy::primitives::{Address, B256, U256};
use sha3::{Digest, Keccak256};

const KEY_PREFIX: &str = "nonce/";
const HEIGHT_PREFIX: &str = "nonceh/";

/// Replay key of one (user, nonce) pair.
pub fn nonce_key(user: &Address, nonce: &U256) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(user.as_slice());
    hasher.update(nonce.to_be_bytes::<32>());
    B256::from_slice(&hasher.finalize())
}

fn key_row(key: &B256) -> String {
    format!("{KEY_PREFIX}{}", hex::encode(key.as_slice()))
}

fn height_row(height: u64, key_hex: &str) -> String {
    format!("{HEIGHT_PREFIX}{height:020}/{key_hex}")
}

/// Record `key` at `height`. Returns false if it is still live (a replay).
pub fn try_insert(tx: &mut BlockTx, key: &B256, height: u64, retention: u64) -> Result<bool, StoreError> {
    let row = key_row(key);
    let key_hex = hex::encode(key.as_slice());
    if let Some(seen) = tx.get::<u64>(&row)? {
        if height.saturating_sub(seen) <= retention {
            return Ok(false);
        }
        tx.delete(&height_row(seen, &key_hex));
    }
    tx.put(&row, &height)?;
    tx.put_raw(&height_row(height, &key_hex), Vec::new());
    Ok(true)
}

/// Height at which `key` was last recorded.
pub fn recorded_at(reader: &impl ReadTx, key: &B256) -> Result<Option<u64>, StoreError> {
    reader.get(&key_row(key))
}

/// Delete every key recorded below `cutoff` in one atomic batch. Returns the number removed.
pub fn sweep(db: &Database, cutoff: u64) -> Result<usize, StoreError> {
    let start = HEIGHT_PREFIX.to_string();
    let end = format!("{HEIGHT_PREFIX}{cutoff:020}");
    let mut batch = sled::Batch::default();
    let mut removed = 0;
    for row in db.tree().range(start.into_bytes()..end.into_bytes()) {
        let (k, _) = row?;
        let text = String::from_utf8_lossy(&k).into_owned();
        let key_hex = text.rsplit('/').next().unwrap_or_default();
        batch.remove(format!("{KEY_PREFIX}{key_hex}").into_bytes());
        batch.remove(k);
        removed += 1;
    }
    if removed > 0 {
        db.tree().apply_batch(batch)?;
    }
    Ok(removed)
}
