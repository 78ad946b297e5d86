//! Per-extension presync cursors, per-network mapping positions, and pending backfills of
//! extensions registered during sync.

use super::{BlockTx, ReadTx, StoreError};
use serde::{Deserialize, Serialize};

const CURSOR_PREFIX: &str = "cursor/";
const NETWORK_PREFIX: &str = "netcursor/";
const BACKFILL_PREFIX: &str = "backfill/";

/// A page in progress: the range being read and the source's opaque cursor for the next page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingState {
    pub from: u64,
    pub to: u64,
    pub cursor: String,
}

/// Presync progress of one extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionCursor {
    pub extension_id: u32,
    /// Last source position fully read; None before the first complete range.
    pub last_position: Option<u64>,
    /// Set while a paginated range is only partly read.
    pub paging: Option<PagingState>,
    pub finished: bool,
}

impl ExtensionCursor {
    pub fn new(extension_id: u32) -> Self {
        Self {
            extension_id,
            last_position: None,
            paging: None,
            finished: false,
        }
    }
}

/// Source range an extension registered during sync still has to read: from its discovery
/// position to the end of the range already mapped when it was discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backfill {
    pub extension_id: u32,
    pub from: u64,
    pub to: u64,
}

fn cursor_key(extension_id: u32) -> String {
    format!("{CURSOR_PREFIX}{extension_id:010}")
}

fn network_key(network: &str) -> String {
    format!("{NETWORK_PREFIX}{network}")
}

pub fn load(reader: &impl ReadTx, extension_id: u32) -> Result<Option<ExtensionCursor>, StoreError> {
    reader.get(&cursor_key(extension_id))
}

pub fn save(tx: &mut BlockTx, cursor: &ExtensionCursor) -> Result<(), StoreError> {
    tx.put(&cursor_key(cursor.extension_id), cursor)
}

/// Whether any extension cursor was ever written.
pub fn any(reader: &impl ReadTx) -> Result<bool, StoreError> {
    Ok(!reader.scan_prefix_raw(CURSOR_PREFIX.as_bytes())?.is_empty())
}

/// First source position of `network` not yet mapped onto a processed primary height.
pub fn network_position(reader: &impl ReadTx, network: &str) -> Result<Option<u64>, StoreError> {
    reader.get(&network_key(network))
}

pub fn set_network_position(tx: &mut BlockTx, network: &str, position: u64) -> Result<(), StoreError> {
    tx.put(&network_key(network), &position)
}

fn backfill_key(extension_id: u32) -> String {
    format!("{BACKFILL_PREFIX}{extension_id:010}")
}

pub fn set_backfill(tx: &mut BlockTx, backfill: &Backfill) -> Result<(), StoreError> {
    tx.put(&backfill_key(backfill.extension_id), backfill)
}

/// Pending backfills in extension id order.
pub fn backfills(reader: &impl ReadTx) -> Result<Vec<Backfill>, StoreError> {
    Ok(reader
        .scan::<Backfill>(BACKFILL_PREFIX)?
        .into_iter()
        .map(|(_, b)| b)
        .collect())
}

pub fn clear_backfill(tx: &mut BlockTx, extension_id: u32) {
    tx.delete(&backfill_key(extension_id));
}
