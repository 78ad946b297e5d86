//! Progress cursor, post-execution block headers and per-block PRNG seeds.

use super::{BlockTx, ReadTx, StoreError};
use alloy::primitives::B256;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

const PROGRESS_KEY: &str = "meta/progress";
const HEADER_PREFIX: &str = "header/";
const SEED_PREFIX: &str = "seed/";

pub fn last_processed(reader: &impl ReadTx) -> Result<Option<u64>, StoreError> {
    reader.get(PROGRESS_KEY)
}

pub fn set_last_processed(tx: &mut BlockTx, height: u64) -> Result<(), StoreError> {
    tx.put(PROGRESS_KEY, &height)
}

/// Audit record of one applied block, chained to its predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u64,
    pub block_hash: B256,
    pub prev_hash: B256,
    /// Hashes of inputs the state transition applied, in order.
    pub success: Vec<B256>,
    /// Hashes of inputs it rejected, in order.
    pub failed: Vec<B256>,
    pub hash: B256,
}

impl BlockHeader {
    pub fn new(height: u64, block_hash: B256, prev_hash: B256, success: Vec<B256>, failed: Vec<B256>) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(prev_hash.as_slice());
        hasher.update(height.to_be_bytes());
        hasher.update(block_hash.as_slice());
        for list in [&success, &failed] {
            hasher.update((list.len() as u64).to_be_bytes());
            for h in list {
                hasher.update(h.as_slice());
            }
        }
        let hash = B256::from_slice(&hasher.finalize());
        Self {
            height,
            block_hash,
            prev_hash,
            success,
            failed,
            hash,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct HeaderRow {
    height: u64,
    block_hash: String,
    prev_hash: String,
    success: Vec<String>,
    failed: Vec<String>,
    hash: String,
}

fn hex32(h: &B256) -> String {
    hex::encode(h.as_slice())
}

fn parse32(key: &str, s: &str) -> Result<B256, StoreError> {
    let bytes = hex::decode(s).map_err(|e| StoreError::Corrupted {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    if bytes.len() != 32 {
        return Err(StoreError::Corrupted {
            key: key.to_string(),
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        });
    }
    Ok(B256::from_slice(&bytes))
}

fn header_key(height: u64) -> String {
    format!("{HEADER_PREFIX}{height:020}")
}

fn from_row(key: &str, row: HeaderRow) -> Result<BlockHeader, StoreError> {
    let list = |items: &[String]| -> Result<Vec<B256>, StoreError> {
        items.iter().map(|s| parse32(key, s)).collect()
    };
    Ok(BlockHeader {
        height: row.height,
        block_hash: parse32(key, &row.block_hash)?,
        prev_hash: parse32(key, &row.prev_hash)?,
        success: list(&row.success)?,
        failed: list(&row.failed)?,
        hash: parse32(key, &row.hash)?,
    })
}

pub fn header(reader: &impl ReadTx, height: u64) -> Result<Option<BlockHeader>, StoreError> {
    let key = header_key(height);
    match reader.get::<HeaderRow>(&key)? {
        Some(row) => Ok(Some(from_row(&key, row)?)),
        None => Ok(None),
    }
}

/// Build the header of `height` on top of the previous one and stage it.
pub fn append_header(
    tx: &mut BlockTx,
    height: u64,
    block_hash: B256,
    success: Vec<B256>,
    failed: Vec<B256>,
) -> Result<BlockHeader, StoreError> {
    let prev_hash = match height.checked_sub(1) {
        Some(prev) => header(&*tx, prev)?.map(|h| h.hash).unwrap_or(B256::ZERO),
        None => B256::ZERO,
    };
    let header = BlockHeader::new(height, block_hash, prev_hash, success, failed);
    let row = HeaderRow {
        height,
        block_hash: hex32(&header.block_hash),
        prev_hash: hex32(&header.prev_hash),
        success: header.success.iter().map(hex32).collect(),
        failed: header.failed.iter().map(hex32).collect(),
        hash: hex32(&header.hash),
    };
    tx.put(&header_key(height), &row)?;
    Ok(header)
}

/// Every stored header in height order.
pub fn headers(reader: &impl ReadTx) -> Result<Vec<BlockHeader>, StoreError> {
    reader
        .scan::<HeaderRow>(HEADER_PREFIX)?
        .into_iter()
        .map(|(key, row)| from_row(&key, row))
        .collect()
}

fn seed_key(height: u64) -> String {
    format!("{SEED_PREFIX}{height:020}")
}

pub fn seed(reader: &impl ReadTx, height: u64) -> Result<Option<B256>, StoreError> {
    let key = seed_key(height);
    match reader.get::<String>(&key)? {
        Some(s) => Ok(Some(parse32(&key, &s)?)),
        None => Ok(None),
    }
}

pub fn set_seed(tx: &mut BlockTx, height: u64, seed: &B256) -> Result<(), StoreError> {
    tx.put(&seed_key(height), &hex32(seed))
}

pub fn delete_seed(tx: &mut BlockTx, height: u64) {
    tx.delete(&seed_key(height));
}
