//! Runtime: owns the funnel and the state machine and drives them one tick at a time.
//!
//! Every tick either applies one presync batch, applies one primary block, or reports why
//! it cannot. [Runtime::run] loops over ticks until the shutdown flag flips, sleeping
//! between idle ticks and backing off after failed ones. Fatal errors end the loop.

use crate::config::{ConfigError, EngineConfig, NodeConfig, ReconnectionConfig};
use crate::confirmation::ConfirmationPolicy;
use crate::engine::{BlockReport, StateMachine, StateTransition};
use crate::error::EngineError;
use crate::funnel::{Clock, Funnel};
use crate::primary::PrimaryChain;
use crate::reader::SourceRegistry;
use crate::store::{extensions, nonce, progress, Database, ReadOnlyDb};
use alloy::primitives::B256;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::sleep;

/// Latest committed height, published after every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub height: u64,
    pub header_hash: B256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    /// A network cannot resolve where its sync phase starts yet.
    PresyncWaiting,
    /// The next height (or data mapped onto it) is not confirmed.
    NotConfirmed,
    /// The configured stop height was reached.
    StopHeight,
}

/// Outcome of one [Runtime::tick].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Presync,
    Block(BlockReport),
    Idle(IdleReason),
}

pub struct Runtime<S> {
    db: Arc<Database>,
    funnel: Funnel,
    machine: StateMachine<S>,
    engine: EngineConfig,
    reconnection: ReconnectionConfig,
    wake: Arc<Notify>,
    progress_tx: watch::Sender<Option<Progress>>,
    blocks_since_gc: u64,
}

impl<S: StateTransition> Runtime<S> {
    /// Pin the configured extensions against `db` and wire funnel and state machine.
    /// Fails with [ConfigError::Mismatch] if the extension set changed after sync started.
    pub fn new(
        config: &NodeConfig,
        db: Arc<Database>,
        primary: Arc<dyn PrimaryChain>,
        registry: SourceRegistry,
        stf: S,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let active = extensions::pin(&db, &config.extensions)?;
        for ext in &active {
            if registry.get(ext.network()).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "extension {:?}: network {:?} has no source",
                    ext.name(),
                    ext.network()
                ))
                .into());
            }
        }

        let start = config.primary.start_height;
        let (funnel_tx, funnel_rx) = mpsc::unbounded_channel();
        let funnel = Funnel::new(
            db.read_only(),
            primary,
            ConfirmationPolicy::from_config(&config.primary.confirmation),
            start,
            registry,
            active.clone(),
            config.engine.presync_step,
            funnel_rx,
        );
        let machine = StateMachine::new(
            Arc::clone(&db),
            stf,
            start,
            config.engine.nonce_retention_blocks,
            &active,
            funnel_tx,
        );

        let reader = db.read_only();
        let current = match progress::last_processed(&reader)? {
            Some(height) => progress::header(&reader, height)?.map(|h| Progress {
                height,
                header_hash: h.hash,
            }),
            None => None,
        };
        if let Some(p) = &current {
            tracing::info!(height = p.height, "resuming after last processed height");
        }
        let (progress_tx, _) = watch::channel(current);

        Ok(Self {
            db,
            funnel,
            machine,
            engine: config.engine.clone(),
            reconnection: config.reconnection.clone(),
            wake: Arc::new(Notify::new()),
            progress_tx,
            blocks_since_gc: 0,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.funnel = self.funnel.with_clock(clock);
        self
    }

    /// Notified to cut an idle wait short (see [crate::head_watcher::HeadWatcher]).
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Progress>> {
        self.progress_tx.subscribe()
    }

    /// Read-only handle for downstream queries over derived tables.
    pub fn read_model(&self) -> ReadOnlyDb {
        self.db.read_only()
    }

    pub fn stf(&self) -> &S {
        self.machine.stf()
    }

    /// Apply at most one presync batch or one block.
    pub async fn tick(&mut self, stop_height: Option<u64>) -> Result<Tick, EngineError> {
        if let Some(batch) = self.funnel.read_presync().await? {
            self.machine.process_presync(&batch)?;
            self.db.flush().await?;
            return Ok(Tick::Presync);
        }
        if !self.funnel.presync_complete().await? {
            return Ok(Tick::Idle(IdleReason::PresyncWaiting));
        }

        let next = self.machine.next_height()?;
        if stop_height.is_some_and(|stop| next > stop) {
            return Ok(Tick::Idle(IdleReason::StopHeight));
        }
        let Some(data) = self.funnel.read_data(next).await? else {
            return Ok(Tick::Idle(IdleReason::NotConfirmed));
        };
        let report = self.machine.process_block(&data)?;
        self.db.flush().await?;
        self.progress_tx.send_replace(Some(Progress {
            height: report.height,
            header_hash: report.header_hash,
        }));
        self.collect_nonces(report.height).await?;
        Ok(Tick::Block(report))
    }

    /// Sweep expired nonce rows every `nonce_gc_interval` blocks, only once caught up.
    async fn collect_nonces(&mut self, height: u64) -> Result<(), EngineError> {
        self.blocks_since_gc += 1;
        if self.engine.nonce_gc_interval == 0 || self.blocks_since_gc < self.engine.nonce_gc_interval {
            return Ok(());
        }
        if !self.funnel.caught_up(height).await? {
            return Ok(());
        }
        self.blocks_since_gc = 0;
        let Some(cutoff) = height.checked_sub(self.engine.nonce_retention_blocks) else {
            return Ok(());
        };
        let removed = nonce::sweep(&self.db, cutoff)?;
        tracing::debug!(height, cutoff, removed, "swept expired nonces");
        Ok(())
    }

    /// Drive ticks until `shutdown` is true or its sender is dropped.
    ///
    /// `stop_height` overrides the configured one; past it the loop idles. In
    /// `server_only` mode no block is applied and only the read model is served.
    pub async fn run(
        &mut self,
        stop_height: Option<u64>,
        server_only: bool,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        if server_only {
            tracing::info!("server-only mode, not applying blocks");
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            return Ok(());
        }

        let stop_height = stop_height.or(self.engine.stop_height);
        let poll = self.engine.poll_interval();
        let mut attempt = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = match self.tick(stop_height).await {
                Ok(Tick::Presync) | Ok(Tick::Block(_)) => {
                    attempt = 0;
                    continue;
                }
                Ok(Tick::Idle(reason)) => {
                    attempt = 0;
                    tracing::trace!(?reason, "idle");
                    poll
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(reason = %e, "fatal engine error, halting");
                    return Err(e);
                }
                Err(e) => {
                    let base = self.reconnection.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(reason = %e, attempt, "tick failed, retrying...");
                    base + Duration::from_millis(rand::thread_rng().gen_range(0..500))
                }
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("engine loop stopped");
        Ok(())
    }
}
