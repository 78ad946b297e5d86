//! Slot-based UTXO networks, read through an opaque paginated indexer.
//!
//! The indexer client itself lives outside this crate; [UtxoSource] is the seam. One
//! [ExtensionReader::read] call serves exactly one page so presync can persist the paging
//! cursor between batches.

use super::{with_timeout, ChainSource, ExtensionReader, ReadBatch, ReadRange, ReaderError};
use crate::config::SlotConfig;
use crate::datum::{ChainDataExtensionDatum, DatumPayload};
use crate::extension::{ChainDataExtension, ExtensionKind, SourceFamily};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// One event at a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEvent {
    pub slot: u64,
    pub payload: DatumPayload,
}

/// One page of events in slot order. `next` is the opaque cursor of the following page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoPage {
    pub events: Vec<UtxoEvent>,
    pub next: Option<String>,
}

/// Paginated indexer for a slot-based chain.
#[async_trait]
pub trait UtxoSource: Send + Sync {
    /// Highest slot the indexer has fully ingested.
    async fn confirmed_slot(&self) -> Result<u64, ReaderError>;

    /// Events matching `kind` in `[from_slot, to_slot]`, starting at `paging` (None for the first page).
    async fn fetch(
        &self,
        kind: &ExtensionKind,
        from_slot: u64,
        to_slot: u64,
        paging: Option<&str>,
    ) -> Result<UtxoPage, ReaderError>;
}

/// Reader for delegation, UTXO-asset and mint/burn extensions.
pub struct UtxoReader {
    source: Arc<dyn UtxoSource>,
    timeout: Duration,
}

impl UtxoReader {
    pub fn new(source: Arc<dyn UtxoSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }
}

#[async_trait]
impl ExtensionReader for UtxoReader {
    async fn read(
        &self,
        ext: &ChainDataExtension,
        range: ReadRange,
        paging: Option<&str>,
    ) -> Result<ReadBatch, ReaderError> {
        if ext.config.kind.family() != SourceFamily::Utxo {
            return Err(ReaderError::Unsupported(format!("{} on a UTXO reader", ext.tag())));
        }
        let page = with_timeout(
            self.timeout,
            "UTXO page fetch",
            self.source.fetch(&ext.config.kind, range.from, range.to, paging),
        )
        .await?;
        let datums = page
            .events
            .into_iter()
            .filter(|ev| ev.slot >= range.from && ev.slot <= range.to)
            .map(|ev| ChainDataExtensionDatum {
                extension_id: ext.id,
                block_number: ev.slot,
                payload: ev.payload,
                paging_cursor: paging.map(str::to_string),
            })
            .collect();
        Ok(ReadBatch {
            datums,
            next_paging: page.next,
        })
    }
}

/// [ChainSource] view of a UTXO network: tip is the confirmed slot, time comes from slot arithmetic.
pub struct UtxoChain {
    source: Arc<dyn UtxoSource>,
    slots: SlotConfig,
    timeout: Duration,
}

impl UtxoChain {
    pub fn new(source: Arc<dyn UtxoSource>, slots: SlotConfig, timeout: Duration) -> Self {
        Self {
            source,
            slots,
            timeout,
        }
    }
}

#[async_trait]
impl ChainSource for UtxoChain {
    async fn tip(&self) -> Result<u64, ReaderError> {
        with_timeout(self.timeout, "UTXO confirmed slot", self.source.confirmed_slot()).await
    }

    async fn timestamp(&self, position: u64) -> Result<u64, ReaderError> {
        Ok(self.slots.time_of(position))
    }
}
