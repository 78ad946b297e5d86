//! State machine: applies one primary block (or one presync batch) in one transaction.
//!
//! Inputs reach the state transition in a fixed order: submitted inputs that pass the
//! nonce filter, then scheduled inputs due at the height (including ones the block's
//! datums just produced). Any error before commit drops the overlay, so nothing of the
//! block is visible and progress still reads the previous height.

use crate::datum::{ChainData, ChainDataExtensionDatum, PresyncChainData, SubmittedInput};
use crate::error::EngineError;
use crate::extension::ChainDataExtension;
use crate::prng::{self, BlockRng};
use crate::processor::{self, ProcessContext};
use crate::store::cursor::{self, Backfill, ExtensionCursor, PagingState};
use crate::store::scheduler::{self, Provenance, ScheduledData};
use crate::store::tables::{self, Update};
use crate::store::{extensions, nonce, progress, BlockTx, Database};
use crate::config::PRIMARY_NETWORK;
use alloy::primitives::{Address, B256, U256};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message from the state machine to the funnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunnelMessage {
    /// The pinned extension set grew; reload it before the next read.
    ReloadExtensions,
}

/// Where an input came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputOrigin {
    Submitted {
        user: Address,
        nonce: U256,
        tx_hash: B256,
        log_index: u64,
    },
    Scheduled {
        id: u64,
        provenance: Provenance,
    },
}

/// One input handed to the state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StfInput {
    pub data: String,
    pub origin: InputOrigin,
    /// Identity recorded in the block header.
    pub hash: B256,
}

impl StfInput {
    fn submitted(input: &SubmittedInput) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(b"submitted");
        hasher.update(input.user_address.as_slice());
        hasher.update(input.nonce.to_be_bytes::<32>());
        hasher.update(input.data.as_bytes());
        Self {
            data: input.data.clone(),
            origin: InputOrigin::Submitted {
                user: input.user_address,
                nonce: input.nonce,
                tx_hash: input.tx_hash,
                log_index: input.log_index,
            },
            hash: B256::from_slice(&hasher.finalize()),
        }
    }

    fn scheduled(row: ScheduledData) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(b"scheduled");
        hasher.update(row.id.to_be_bytes());
        hasher.update(row.input_data.as_bytes());
        Self {
            data: row.input_data,
            origin: InputOrigin::Scheduled {
                id: row.id,
                provenance: row.provenance,
            },
            hash: B256::from_slice(&hasher.finalize()),
        }
    }
}

/// What the state transition did with one input.
#[derive(Debug, Clone, PartialEq)]
pub enum StfOutcome {
    /// Apply these updates in order.
    Applied(Vec<Update>),
    /// The input is invalid for the application; recorded in the header's failed list.
    Rejected(String),
}

/// Application-supplied deterministic state transition.
///
/// `tx` reads see every update applied earlier in the same block. Returning `Err` aborts
/// the whole block; it is retried after a backoff.
pub trait StateTransition: Send {
    fn apply(
        &mut self,
        input: &StfInput,
        block_height: u64,
        rng: &mut BlockRng,
        tx: &BlockTx,
    ) -> anyhow::Result<StfOutcome>;
}

impl<F> StateTransition for F
where
    F: FnMut(&StfInput, u64, &mut BlockRng, &BlockTx) -> anyhow::Result<StfOutcome> + Send,
{
    fn apply(
        &mut self,
        input: &StfInput,
        block_height: u64,
        rng: &mut BlockRng,
        tx: &BlockTx,
    ) -> anyhow::Result<StfOutcome> {
        self(input, block_height, rng, tx)
    }
}

/// Summary of a committed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReport {
    pub height: u64,
    pub header_hash: B256,
    pub applied: usize,
    pub rejected: usize,
    pub registered: usize,
}

pub struct StateMachine<S> {
    db: Arc<Database>,
    stf: S,
    primary_start: u64,
    nonce_retention: u64,
    extensions: BTreeMap<u32, ChainDataExtension>,
    funnel_tx: mpsc::UnboundedSender<FunnelMessage>,
}

impl<S: StateTransition> StateMachine<S> {
    pub fn new(
        db: Arc<Database>,
        stf: S,
        primary_start: u64,
        nonce_retention: u64,
        extensions: &[ChainDataExtension],
        funnel_tx: mpsc::UnboundedSender<FunnelMessage>,
    ) -> Self {
        Self {
            db,
            stf,
            primary_start,
            nonce_retention,
            extensions: extensions.iter().map(|e| (e.id, e.clone())).collect(),
            funnel_tx,
        }
    }

    /// Height the next block must have.
    pub fn next_height(&self) -> Result<u64, EngineError> {
        Ok(progress::last_processed(&self.db.read_only())?
            .map(|h| h + 1)
            .unwrap_or(self.primary_start))
    }

    pub fn stf(&self) -> &S {
        &self.stf
    }

    /// Run datums through their processors, staging updates and registrations.
    fn apply_datums(
        &self,
        tx: &mut BlockTx,
        datums: &[ChainDataExtensionDatum],
        ctx: ProcessContext,
    ) -> Result<Vec<ChainDataExtension>, EngineError> {
        let mut registered = Vec::new();
        for datum in datums {
            let Some(ext) = self.extensions.get(&datum.extension_id) else {
                tracing::warn!(extension_id = datum.extension_id, "datum for unknown extension dropped");
                continue;
            };
            let output = processor::process(datum, ext, &ctx, &*tx)?;
            for update in &output.updates {
                match update {
                    Update::Schedule { height, input_data } => {
                        scheduler::schedule(
                            tx,
                            *height,
                            input_data.clone(),
                            Provenance::Extension {
                                extension_id: ext.id,
                                position: datum.block_number,
                            },
                        )?;
                    }
                    other => tables::write(tx, other)?,
                }
            }
            for config in output.register {
                if let Some(new) = extensions::register_dynamic(tx, config)? {
                    registered.push(new);
                }
            }
        }
        Ok(registered)
    }

    fn adopt(&mut self, registered: Vec<ChainDataExtension>) {
        if registered.is_empty() {
            return;
        }
        for ext in registered {
            tracing::info!(
                extension = ext.name(),
                id = ext.id,
                network = ext.network(),
                start = ext.config.start_height,
                "registered dynamic extension"
            );
            self.extensions.insert(ext.id, ext);
        }
        // The funnel may already be gone during shutdown.
        let _ = self.funnel_tx.send(FunnelMessage::ReloadExtensions);
    }

    /// Apply one primary block. On error nothing is written.
    pub fn process_block(&mut self, data: &ChainData) -> Result<BlockReport, EngineError> {
        let height = data.block_height;
        let expected = self.next_height()?;
        if height != expected {
            return Err(EngineError::InvalidState(format!(
                "block {height} out of order, expected {expected}"
            )));
        }
        let mut tx = self.db.begin();

        let mut inputs = Vec::new();
        for input in &data.submitted_inputs {
            if input.data.trim().is_empty() {
                tracing::warn!(height, tx_hash = %input.tx_hash, "dropping empty submitted input");
                continue;
            }
            let key = nonce::nonce_key(&input.user_address, &input.nonce);
            if !nonce::try_insert(&mut tx, &key, height, self.nonce_retention)? {
                tracing::debug!(height, user = %input.user_address, nonce = %input.nonce, "replayed nonce skipped");
                continue;
            }
            inputs.push(StfInput::submitted(input));
        }

        for extension_id in &data.backfilled {
            cursor::clear_backfill(&mut tx, *extension_id);
        }
        let registered = self.apply_datums(
            &mut tx,
            &data.extension_datums,
            ProcessContext {
                in_presync: false,
                schedule_height: height,
            },
        )?;
        // Children read the rest of the range they were discovered in with the next block.
        for ext in &registered {
            let end = if ext.network() == PRIMARY_NETWORK {
                Some(height)
            } else {
                data.network_positions
                    .get(ext.network())
                    .and_then(|end| end.checked_sub(1))
            };
            if let Some(to) = end.filter(|to| *to >= ext.config.start_height) {
                cursor::set_backfill(
                    &mut tx,
                    &Backfill {
                        extension_id: ext.id,
                        from: ext.config.start_height,
                        to,
                    },
                )?;
            }
        }

        for row in scheduler::take_due(&mut tx, height)? {
            inputs.push(StfInput::scheduled(row));
        }

        let mut rng = prng::seed_block(&mut tx, height, &data.block_hash)?;
        let mut success = Vec::new();
        let mut failed = Vec::new();
        for input in &inputs {
            let outcome = self
                .stf
                .apply(input, height, &mut rng, &tx)
                .map_err(|cause| EngineError::Stf { height, cause })?;
            match outcome {
                StfOutcome::Applied(updates) => {
                    for update in &updates {
                        match update {
                            Update::Schedule { height: at, input_data } => {
                                let at = if *at <= height {
                                    tracing::warn!(height, requested = *at, "schedule in the past moved to next block");
                                    height + 1
                                } else {
                                    *at
                                };
                                scheduler::schedule(&mut tx, at, input_data.clone(), Provenance::Stf { height })?;
                            }
                            other => tables::write(&mut tx, other)?,
                        }
                    }
                    success.push(input.hash);
                }
                StfOutcome::Rejected(reason) => {
                    tracing::debug!(height, input = %input.hash, %reason, "input rejected");
                    failed.push(input.hash);
                }
            }
        }

        let (applied, rejected) = (success.len(), failed.len());
        let header = progress::append_header(&mut tx, height, data.block_hash, success, failed)?;
        for (network, position) in &data.network_positions {
            cursor::set_network_position(&mut tx, network, *position)?;
        }
        progress::set_last_processed(&mut tx, height)?;
        tx.commit()?;

        let report = BlockReport {
            height,
            header_hash: header.hash,
            applied,
            rejected,
            registered: registered.len(),
        };
        self.adopt(registered);
        tracing::info!(
            height,
            datums = data.extension_datums.len(),
            applied,
            rejected,
            header = %header.hash,
            "block applied"
        );
        Ok(report)
    }

    /// Apply one presync batch and advance its extension cursor in the same transaction.
    pub fn process_presync(&mut self, batch: &PresyncChainData) -> Result<(), EngineError> {
        let mut tx = self.db.begin();
        let schedule_height = self.primary_start;
        // Children discovered here presync on their own cursor from the discovery position.
        let registered = self.apply_datums(
            &mut tx,
            &batch.datums,
            ProcessContext {
                in_presync: true,
                schedule_height,
            },
        )?;

        let mut cur = cursor::load(&tx, batch.extension_id)?
            .unwrap_or_else(|| ExtensionCursor::new(batch.extension_id));
        match &batch.paging_cursor {
            Some(next) => {
                cur.paging = Some(PagingState {
                    from: batch.from,
                    to: batch.to,
                    cursor: next.clone(),
                })
            }
            None => {
                cur.paging = None;
                cur.last_position = Some(batch.to);
            }
        }
        cur.finished = batch.finished;
        cursor::save(&mut tx, &cur)?;
        tx.commit()?;

        self.adopt(registered);
        tracing::debug!(
            network = %batch.network,
            extension_id = batch.extension_id,
            from = batch.from,
            to = batch.to,
            datums = batch.datums.len(),
            "presync batch applied"
        );
        if batch.finished {
            tracing::info!(network = %batch.network, extension_id = batch.extension_id, "presync finished");
        }
        Ok(())
    }
}
