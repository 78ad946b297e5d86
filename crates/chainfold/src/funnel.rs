//! Funnel: assembles the complete [ChainData] for one primary height, and drives presync.
//!
//! The funnel never writes. Cursors and network positions are read from the store and
//! advanced by the state machine inside its block transaction.
//!
//! Every secondary network is mapped onto primary heights. Height H covers the source
//! positions `[next, end)` where `next` is the first position not covered by H-1 and `end`
//! follows from H's timestamp:
//! * timestamp mapping: blocks with `timestamp <= ts(H)`; a confirmed block newer than
//!   `ts(H)` must exist so the range can no longer grow;
//! * slot mapping: slots up to `slot_at(ts(H))`, which must itself be confirmed.
//!
//! An extension registered during sync also reads the rest of the range it was discovered
//! in, from its discovery position, together with the next height.
//!
//! Positions below the network's sync start belong to presync. Presync walks one extension
//! at a time in registration order, from its start to the sync start, and must finish for
//! every extension before any height is read.

use crate::config::ConfigError;
use crate::confirmation::ConfirmationPolicy;
use crate::datum::{ChainData, PresyncChainData};
use crate::engine::FunnelMessage;
use crate::error::EngineError;
use crate::extension::ChainDataExtension;
use crate::primary::PrimaryChain;
use crate::reader::{Mapping, NetworkHandle, ReadRange, ReaderError, SourceRegistry};
use crate::store::cursor::{self, Backfill, ExtensionCursor};
use crate::store::{extensions, ReadOnlyDb};
use futures_util::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Wall clock in unix seconds (injectable for tests).
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    })
}

enum PresyncState {
    Done,
    /// The network cannot tell yet where its sync phase starts.
    Waiting,
    Pending { end: u64, cursor: ExtensionCursor },
}

pub struct Funnel {
    db: ReadOnlyDb,
    primary: Arc<dyn PrimaryChain>,
    primary_policy: ConfirmationPolicy,
    primary_start: u64,
    registry: SourceRegistry,
    extensions: Vec<ChainDataExtension>,
    presync_step: u64,
    clock: Clock,
    inbox: mpsc::UnboundedReceiver<FunnelMessage>,
    /// First sync-phase position per network.
    sync_from: BTreeMap<String, u64>,
    presync_done: bool,
}

impl Funnel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: ReadOnlyDb,
        primary: Arc<dyn PrimaryChain>,
        primary_policy: ConfirmationPolicy,
        primary_start: u64,
        registry: SourceRegistry,
        extensions: Vec<ChainDataExtension>,
        presync_step: u64,
        inbox: mpsc::UnboundedReceiver<FunnelMessage>,
    ) -> Self {
        Self {
            db,
            primary,
            primary_policy,
            primary_start,
            registry,
            extensions,
            presync_step: presync_step.max(1),
            clock: system_clock(),
            inbox,
            sync_from: BTreeMap::new(),
            presync_done: false,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn extensions(&self) -> &[ChainDataExtension] {
        &self.extensions
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Apply pending messages from the state machine.
    fn refresh(&mut self) -> Result<(), EngineError> {
        let mut reload = false;
        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                FunnelMessage::ReloadExtensions => reload = true,
            }
        }
        if reload {
            self.extensions = extensions::load_all(&self.db)?;
            self.presync_done = false;
            tracing::info!(count = self.extensions.len(), "reloaded extensions");
        }
        Ok(())
    }

    fn network(&self, name: &str) -> Result<&NetworkHandle, EngineError> {
        self.registry
            .get(name)
            .ok_or_else(|| ConfigError::Invalid(format!("no source for network {name:?}")).into())
    }

    /// First sync-phase position of `name`, or None while it cannot be determined.
    async fn sync_from(&mut self, name: &str) -> Result<Option<u64>, EngineError> {
        if let Some(v) = self.sync_from.get(name) {
            return Ok(Some(*v));
        }
        let mapping = self.network(name)?.mapping;
        let value = match mapping {
            Mapping::Identity => Some(self.primary_start),
            _ if self.primary_start == 0 => Some(0),
            Mapping::Slot(slots) => {
                let t = self.primary.timestamp(self.primary_start - 1).await?;
                Some(slots.slot_at(t) + 1)
            }
            Mapping::Timestamp => {
                let t = self.primary.timestamp(self.primary_start - 1).await?;
                timestamp_end(self.network(name)?, 0, t, self.now()).await?
            }
        };
        if let Some(v) = value {
            tracing::debug!(network = name, sync_from = v, "network sync start resolved");
            self.sync_from.insert(name.to_string(), v);
        }
        Ok(value)
    }

    async fn presync_state(&mut self, ext: &ChainDataExtension) -> Result<PresyncState, EngineError> {
        let Some(sync_from) = self.sync_from(ext.network()).await? else {
            return Ok(PresyncState::Waiting);
        };
        if ext.config.start_height >= sync_from {
            return Ok(PresyncState::Done);
        }
        let end = (sync_from - 1).min(ext.config.stop_height.unwrap_or(u64::MAX));
        let cursor = cursor::load(&self.db, ext.id)?.unwrap_or_else(|| ExtensionCursor::new(ext.id));
        if cursor.finished {
            Ok(PresyncState::Done)
        } else {
            Ok(PresyncState::Pending { end, cursor })
        }
    }

    /// Whether every extension finished presync.
    pub async fn presync_complete(&mut self) -> Result<bool, EngineError> {
        self.refresh()?;
        if self.presync_done {
            return Ok(true);
        }
        let exts = self.extensions.clone();
        for ext in &exts {
            if !matches!(self.presync_state(ext).await?, PresyncState::Done) {
                return Ok(false);
            }
        }
        self.presync_done = true;
        Ok(true)
    }

    /// Next presync batch, or None when presync is complete or cannot advance yet.
    pub async fn read_presync(&mut self) -> Result<Option<PresyncChainData>, EngineError> {
        self.refresh()?;
        if self.presync_done {
            return Ok(None);
        }
        let exts = self.extensions.clone();
        for ext in &exts {
            match self.presync_state(ext).await? {
                PresyncState::Done => continue,
                PresyncState::Waiting => return Ok(None),
                PresyncState::Pending { end, cursor } => {
                    return self.presync_batch(ext, end, &cursor).await;
                }
            }
        }
        self.presync_done = true;
        tracing::info!(extensions = exts.len(), "presync complete");
        Ok(None)
    }

    async fn presync_batch(
        &self,
        ext: &ChainDataExtension,
        end: u64,
        cursor: &ExtensionCursor,
    ) -> Result<Option<PresyncChainData>, EngineError> {
        let handle = self.network(ext.network())?;
        let (from, to, paging) = match &cursor.paging {
            Some(p) => (p.from, p.to, Some(p.cursor.clone())),
            None => {
                let from = cursor
                    .last_position
                    .map(|p| p + 1)
                    .unwrap_or(ext.config.start_height);
                if from > end {
                    return Ok(Some(PresyncChainData {
                        network: ext.network().to_string(),
                        extension_id: ext.id,
                        from: end,
                        to: end,
                        datums: Vec::new(),
                        paging_cursor: None,
                        finished: true,
                    }));
                }
                let to = from.saturating_add(self.presync_step - 1).min(end);
                let Some(safe) = handle
                    .policy
                    .safe_height(&*handle.chain, from, self.now())
                    .await?
                else {
                    tracing::debug!(extension = ext.name(), from, "presync waiting for confirmations");
                    return Ok(None);
                };
                (from, to.min(safe), None)
            }
        };
        let reader = handle.reader(ext.tag())?;
        let batch = reader
            .read(ext, ReadRange::new(from, to), paging.as_deref())
            .await?;
        let finished = batch.next_paging.is_none() && to == end;
        Ok(Some(PresyncChainData {
            network: ext.network().to_string(),
            extension_id: ext.id,
            from,
            to,
            datums: batch.datums,
            paging_cursor: batch.next_paging,
            finished,
        }))
    }

    /// Complete data for `height`, or None if any part of it is not confirmed yet.
    pub async fn read_data(&mut self, height: u64) -> Result<Option<ChainData>, EngineError> {
        if !self.presync_complete().await? {
            tracing::debug!(height, "presync incomplete, sync read skipped");
            return Ok(None);
        }
        let now = self.now();
        if self
            .primary_policy
            .safe_height(&*self.primary, height, now)
            .await?
            .is_none()
        {
            return Ok(None);
        }
        let (block, submitted_inputs) = futures_util::try_join!(
            self.primary.block(height),
            self.primary.submitted_inputs(height)
        )?;

        // Half-open source range per network this height covers.
        let networks: BTreeSet<String> = self.extensions.iter().map(|e| e.network().to_string()).collect();
        let mut ranges: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        let mut network_positions = BTreeMap::new();
        for name in networks {
            let mapping = self.network(&name)?.mapping;
            let range = match mapping {
                Mapping::Identity => (height, height + 1),
                mapping => {
                    let next = match cursor::network_position(&self.db, &name)? {
                        Some(p) => p,
                        None => match self.sync_from(&name).await? {
                            Some(v) => v,
                            None => return Ok(None),
                        },
                    };
                    let handle = self.network(&name)?;
                    let Some(end) = map_end(handle, mapping, next, block.timestamp, now).await? else {
                        tracing::debug!(height, network = %name, "network not confirmed for height");
                        return Ok(None);
                    };
                    network_positions.insert(name.clone(), end);
                    (next, end)
                }
            };
            ranges.insert(name, range);
        }

        let backfills: BTreeMap<u32, Backfill> = cursor::backfills(&self.db)?
            .into_iter()
            .map(|b| (b.extension_id, b))
            .collect();
        let backfilled: Vec<u32> = self
            .extensions
            .iter()
            .filter(|ext| backfills.contains_key(&ext.id))
            .map(|ext| ext.id)
            .collect();

        let this = &*self;
        let reads = this.extensions.iter().filter_map(|ext| {
            let earlier = backfills.get(&ext.id).and_then(|b| ext.clip(b.from, b.to));
            let current = ranges
                .get(ext.network())
                .filter(|(from, end)| end > from)
                .and_then(|(from, end)| ext.clip(*from, end - 1));
            if earlier.is_none() && current.is_none() {
                return None;
            }
            Some(async move {
                let reader = this.network(ext.network())?.reader(ext.tag())?;
                let mut datums = Vec::new();
                for (a, b) in earlier.into_iter().chain(current) {
                    datums.extend(reader.read_all(ext, ReadRange::new(a, b)).await?);
                }
                Ok::<_, EngineError>(datums)
            })
        });
        let extension_datums = try_join_all(reads).await?.into_iter().flatten().collect();
        if !backfilled.is_empty() {
            tracing::debug!(height, extensions = ?backfilled, "backfilling registered extensions");
        }

        Ok(Some(ChainData {
            block_height: height,
            block_hash: block.hash,
            timestamp: block.timestamp,
            submitted_inputs,
            extension_datums,
            network_positions,
            backfilled,
        }))
    }

    /// Whether `height` is the last confirmed primary height.
    pub async fn caught_up(&self, height: u64) -> Result<bool, EngineError> {
        let next = self
            .primary_policy
            .safe_height(&*self.primary, height + 1, self.now())
            .await?;
        Ok(next.is_none())
    }
}

/// End (exclusive) of the range starting at `next` covered by a primary block at time `t`.
async fn map_end(
    handle: &NetworkHandle,
    mapping: Mapping,
    next: u64,
    t: u64,
    now: u64,
) -> Result<Option<u64>, ReaderError> {
    match mapping {
        Mapping::Identity => Ok(Some(next + 1)),
        Mapping::Slot(slots) => {
            let last = slots.slot_at(t);
            if last < next {
                return Ok(Some(next));
            }
            Ok(handle
                .policy
                .safe_height(&*handle.chain, last, now)
                .await?
                .map(|_| last + 1))
        }
        Mapping::Timestamp => timestamp_end(handle, next, t, now).await,
    }
}

/// First block at or after `next` with timestamp > `t`, once a confirmed block proves it.
async fn timestamp_end(handle: &NetworkHandle, next: u64, t: u64, now: u64) -> Result<Option<u64>, ReaderError> {
    let chain = &*handle.chain;
    let Some(safe) = handle.policy.safe_height(chain, next, now).await? else {
        return Ok(None);
    };
    if chain.timestamp(safe).await? <= t {
        return Ok(None);
    }
    if chain.timestamp(next).await? > t {
        return Ok(Some(next));
    }
    // Invariant: ts(lo) <= t < ts(hi).
    let (mut lo, mut hi) = (next, safe);
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if chain.timestamp(mid).await? <= t {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(Some(lo + 1))
}
