//! Scheduled inputs keyed by primary height.
//!
//! Rows live under `sched/{height}/{id}` with zero-padded numbers, so a prefix scan of one
//! height returns its rows in id order. Ids come from a single persisted counter that only
//! advances inside block transactions, which keeps them identical across nodes.

use super::{BlockTx, ReadTx, StoreError};
use serde::{Deserialize, Serialize};

const PREFIX: &str = "sched/";
const SEQ_KEY: &str = "meta/scheduled_seq";

/// Where a scheduled input came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// A datum of `extension_id` at `position` on its own network.
    Extension { extension_id: u32, position: u64 },
    /// The state transition while applying `height`.
    Stf { height: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledData {
    pub id: u64,
    pub block_height: u64,
    pub input_data: String,
    pub provenance: Provenance,
}

fn height_prefix(height: u64) -> String {
    format!("{PREFIX}{height:020}/")
}

/// Queue an input for `height`. Returns its id.
pub fn schedule(
    tx: &mut BlockTx,
    height: u64,
    input_data: String,
    provenance: Provenance,
) -> Result<u64, StoreError> {
    let id = tx.get::<u64>(SEQ_KEY)?.unwrap_or(0);
    tx.put(SEQ_KEY, &(id + 1))?;
    let row = ScheduledData {
        id,
        block_height: height,
        input_data,
        provenance,
    };
    tx.put(&format!("{}{id:020}", height_prefix(height)), &row)?;
    Ok(id)
}

/// Remove and return every row scheduled for `height`, in id order.
pub fn take_due(tx: &mut BlockTx, height: u64) -> Result<Vec<ScheduledData>, StoreError> {
    let due = tx.scan::<ScheduledData>(&height_prefix(height))?;
    let mut out = Vec::with_capacity(due.len());
    for (key, row) in due {
        tx.delete(&key);
        out.push(row);
    }
    Ok(out)
}

/// Rows scheduled for `height`, without consuming them.
pub fn due_at(reader: &impl ReadTx, height: u64) -> Result<Vec<ScheduledData>, StoreError> {
    Ok(reader
        .scan::<ScheduledData>(&height_prefix(height))?
        .into_iter()
        .map(|(_, row)| row)
        .collect())
}

pub fn pending_count(reader: &impl ReadTx) -> Result<usize, StoreError> {
    Ok(reader.scan_prefix_raw(PREFIX.as_bytes())?.len())
}
