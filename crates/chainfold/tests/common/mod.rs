//! Common helpers for integration tests: in-memory chains, scripted readers and STFs.

#![allow(dead_code)]

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use chainfold::config::{
    ConfirmationConfig, EngineConfig, ExtensionConfig, NetworkConfig, NodeConfig, PrimaryConfig,
    ReconnectionConfig, SlotConfig, PRIMARY_NETWORK,
};
use chainfold::confirmation::ConfirmationPolicy;
use chainfold::datum::{BlockInfo, ChainDataExtensionDatum, DatumPayload, SubmittedInput};
use chainfold::extension::{ChainDataExtension, ExtensionKind, KindTag};
use chainfold::funnel::Clock;
use chainfold::reader::utxo::{UtxoEvent, UtxoPage, UtxoSource};
use chainfold::reader::{ChainSource, ExtensionReader, Mapping, NetworkHandle, ReadBatch, ReadRange, ReaderError};
use chainfold::store::tables::Table;
use chainfold::{
    BlockRng, BlockTx, Database, EngineError, PrimaryChain, Runtime, SourceRegistry, StateTransition,
    StfInput, StfOutcome, Tick, Update,
};
use rand::Rng;
use serde_json::json;
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub fn input_contract() -> Address {
    Address::repeat_byte(0xaa)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("chainfold=debug"))
        .with_test_writer()
        .try_init();
}

/// Clock pinned far in the future so minimum-age checks always pass.
pub fn late_clock() -> Clock {
    Arc::new(|| 4_000_000_000)
}

/// Chain with block `h` at `genesis_time + h * block_time` and a movable tip.
pub struct FakeChain {
    genesis_time: u64,
    block_time: u64,
    tip: Mutex<u64>,
    inputs: Mutex<BTreeMap<u64, Vec<SubmittedInput>>>,
}

impl FakeChain {
    pub fn new(tip: u64, genesis_time: u64, block_time: u64) -> Arc<Self> {
        Arc::new(Self {
            genesis_time,
            block_time,
            tip: Mutex::new(tip),
            inputs: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn set_tip(&self, tip: u64) {
        *self.tip.lock().unwrap() = tip;
    }

    pub fn time_of(&self, height: u64) -> u64 {
        self.genesis_time + height * self.block_time
    }

    pub fn hash_of(height: u64) -> B256 {
        B256::from_slice(&Keccak256::digest(height.to_be_bytes()))
    }

    pub fn submit(&self, height: u64, user: Address, nonce: u64, data: &str) {
        let mut inputs = self.inputs.lock().unwrap();
        let list = inputs.entry(height).or_default();
        let log_index = list.len() as u64;
        list.push(SubmittedInput {
            user_address: user,
            nonce: U256::from(nonce),
            data: data.to_string(),
            tx_hash: Self::hash_of(height ^ 0xffff),
            log_index,
        });
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn tip(&self) -> Result<u64, ReaderError> {
        Ok(*self.tip.lock().unwrap())
    }

    async fn timestamp(&self, position: u64) -> Result<u64, ReaderError> {
        Ok(self.time_of(position))
    }
}

#[async_trait]
impl PrimaryChain for FakeChain {
    async fn block(&self, height: u64) -> Result<BlockInfo, ReaderError> {
        if height > *self.tip.lock().unwrap() {
            return Err(ReaderError::Rpc(format!("block {height} not found")));
        }
        Ok(BlockInfo {
            height,
            hash: Self::hash_of(height),
            timestamp: self.time_of(height),
        })
    }

    async fn submitted_inputs(&self, height: u64) -> Result<Vec<SubmittedInput>, ReaderError> {
        Ok(self.inputs.lock().unwrap().get(&height).cloned().unwrap_or_default())
    }
}

/// One recorded [ExtensionReader::read] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCall {
    pub extension_id: u32,
    pub from: u64,
    pub to: u64,
    pub paging: Option<String>,
}

/// Reader serving scripted payloads per extension id and position.
#[derive(Default)]
pub struct ScriptedReader {
    events: Mutex<BTreeMap<u32, BTreeMap<u64, Vec<DatumPayload>>>>,
    page_size: Option<usize>,
    calls: Mutex<Vec<ReadCall>>,
}

impl ScriptedReader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pages hold at most `page_size` datums; the paging cursor is the offset.
    pub fn paged(page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            page_size: Some(page_size),
            ..Self::default()
        })
    }

    pub fn emit(&self, extension_id: u32, position: u64, payload: DatumPayload) {
        self.events
            .lock()
            .unwrap()
            .entry(extension_id)
            .or_default()
            .entry(position)
            .or_default()
            .push(payload);
    }

    pub fn calls(&self) -> Vec<ReadCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, extension_id: u32) -> Vec<ReadCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.extension_id == extension_id)
            .collect()
    }
}

#[async_trait]
impl ExtensionReader for ScriptedReader {
    async fn read(
        &self,
        ext: &ChainDataExtension,
        range: ReadRange,
        paging: Option<&str>,
    ) -> Result<ReadBatch, ReaderError> {
        self.calls.lock().unwrap().push(ReadCall {
            extension_id: ext.id,
            from: range.from,
            to: range.to,
            paging: paging.map(str::to_string),
        });
        let all: Vec<ChainDataExtensionDatum> = self
            .events
            .lock()
            .unwrap()
            .get(&ext.id)
            .map(|by_pos| {
                by_pos
                    .range(range.from..=range.to)
                    .flat_map(|(pos, payloads)| {
                        payloads.iter().map(move |p| ChainDataExtensionDatum {
                            extension_id: ext.id,
                            block_number: *pos,
                            payload: p.clone(),
                            paging_cursor: paging.map(str::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let Some(size) = self.page_size else {
            return Ok(ReadBatch {
                datums: all,
                next_paging: None,
            });
        };
        let offset: usize = match paging {
            Some(p) => p.parse().map_err(|_| ReaderError::Decode(format!("bad paging {p}")))?,
            None => 0,
        };
        let end = (offset + size).min(all.len());
        let datums = all.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        Ok(ReadBatch {
            datums,
            next_paging: (end < all.len()).then(|| end.to_string()),
        })
    }
}

/// In-memory UTXO indexer with a fixed page size.
pub struct FakeUtxoSource {
    confirmed: Mutex<u64>,
    events: Mutex<Vec<UtxoEvent>>,
    page_size: usize,
    pub fetches: Mutex<Vec<(u64, u64, Option<String>)>>,
}

impl FakeUtxoSource {
    pub fn new(confirmed: u64, page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            confirmed: Mutex::new(confirmed),
            events: Mutex::new(Vec::new()),
            page_size,
            fetches: Mutex::new(Vec::new()),
        })
    }

    pub fn set_confirmed(&self, slot: u64) {
        *self.confirmed.lock().unwrap() = slot;
    }

    pub fn push(&self, slot: u64, payload: DatumPayload) {
        let mut events = self.events.lock().unwrap();
        events.push(UtxoEvent { slot, payload });
        events.sort_by_key(|e| e.slot);
    }
}

#[async_trait]
impl UtxoSource for FakeUtxoSource {
    async fn confirmed_slot(&self) -> Result<u64, ReaderError> {
        Ok(*self.confirmed.lock().unwrap())
    }

    async fn fetch(
        &self,
        _kind: &ExtensionKind,
        from_slot: u64,
        to_slot: u64,
        paging: Option<&str>,
    ) -> Result<UtxoPage, ReaderError> {
        self.fetches
            .lock()
            .unwrap()
            .push((from_slot, to_slot, paging.map(str::to_string)));
        let matching: Vec<UtxoEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.slot >= from_slot && e.slot <= to_slot)
            .cloned()
            .collect();
        let offset: usize = paging.and_then(|p| p.parse().ok()).unwrap_or(0);
        let end = (offset + self.page_size).min(matching.len());
        Ok(UtxoPage {
            events: matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default(),
            next: (end < matching.len()).then(|| end.to_string()),
        })
    }
}

pub fn node_config(start_height: u64, extensions: Vec<ExtensionConfig>) -> NodeConfig {
    NodeConfig {
        primary: PrimaryConfig {
            http_url: "http://127.0.0.1:1".into(),
            ws_url: None,
            input_contract: input_contract(),
            start_height,
            getlogs_max_range: 1000,
            confirmation: ConfirmationConfig {
                depth: 0,
                min_age_secs: 0,
            },
        },
        networks: BTreeMap::new(),
        extensions,
        engine: EngineConfig {
            poll_interval_ms: 10,
            presync_step: 1000,
            ..EngineConfig::default()
        },
        reconnection: ReconnectionConfig {
            initial_backoff_secs: 0,
            max_backoff_secs: 0,
        },
    }
}

pub fn evm_network() -> NetworkConfig {
    NetworkConfig::Evm {
        http_url: "http://127.0.0.1:1".into(),
        confirmation: ConfirmationConfig::default(),
        getlogs_max_range: 1000,
    }
}

pub fn utxo_network(slots: SlotConfig) -> NetworkConfig {
    NetworkConfig::Utxo {
        slots,
        confirmation: ConfirmationConfig {
            depth: 0,
            min_age_secs: 0,
        },
    }
}

pub fn erc20(name: &str, contract: Address, start_height: u64) -> ExtensionConfig {
    ExtensionConfig {
        name: name.into(),
        network: PRIMARY_NETWORK.into(),
        start_height,
        stop_height: None,
        scheduled_prefix: None,
        kind: ExtensionKind::Erc20Transfer { contract },
    }
}

pub fn transfer(from: Address, to: Address, value: u64) -> DatumPayload {
    DatumPayload::FungibleTransfer {
        from,
        to,
        value: U256::from(value),
        tx_hash: B256::repeat_byte(0x11),
        log_index: 0,
    }
}

/// Registry with only the primary network, served by `reader` for every EVM kind.
pub fn primary_registry(chain: &Arc<FakeChain>, reader: &Arc<ScriptedReader>) -> SourceRegistry {
    let chain: Arc<dyn ChainSource> = Arc::clone(chain) as Arc<dyn ChainSource>;
    SourceRegistry::new().with(
        NetworkHandle::new(PRIMARY_NETWORK, chain, Mapping::Identity, ConfirmationPolicy::new(0, 0))
            .with_reader(&KindTag::EVM, Arc::clone(reader) as Arc<dyn ExtensionReader>),
    )
}

pub fn temp_db() -> Arc<Database> {
    Arc::new(Database::temporary().unwrap())
}

pub fn runtime<S: StateTransition>(
    config: &NodeConfig,
    db: &Arc<Database>,
    chain: &Arc<FakeChain>,
    registry: SourceRegistry,
    stf: S,
) -> Result<Runtime<S>, EngineError> {
    let primary: Arc<dyn PrimaryChain> = Arc::clone(chain) as Arc<dyn PrimaryChain>;
    Ok(Runtime::new(config, Arc::clone(db), primary, registry, stf)?.with_clock(late_clock()))
}

/// Tick until idle, failing the test on errors or a runaway loop.
pub async fn drive<S: StateTransition>(runtime: &mut Runtime<S>) -> Vec<Tick> {
    let mut ticks = Vec::new();
    for _ in 0..10_000 {
        let tick = runtime.tick(None).await.unwrap();
        let idle = matches!(tick, Tick::Idle(_));
        ticks.push(tick);
        if idle {
            return ticks;
        }
    }
    panic!("runtime never went idle");
}

/// STF that stores every input under `app/inputs` with a PRNG draw and remembers what it saw.
#[derive(Default)]
pub struct Recorder {
    pub seen: Vec<(u64, String)>,
}

impl StateTransition for Recorder {
    fn apply(
        &mut self,
        input: &StfInput,
        block_height: u64,
        rng: &mut BlockRng,
        _tx: &BlockTx,
    ) -> anyhow::Result<StfOutcome> {
        self.seen.push((block_height, input.data.clone()));
        let draw: u64 = rng.gen();
        Ok(StfOutcome::Applied(vec![Update::put(
            Table::app("inputs"),
            format!("{block_height:020}/{}", input.hash),
            json!({ "data": input.data, "draw": draw.to_string() }),
        )]))
    }
}
