//! Networks the funnel reads from: chain handle, readers per kind, height mapping, policy.

use super::evm::{ContractStateReader, EvmLogReader};
use super::rpc::EvmRpc;
use super::utxo::{UtxoChain, UtxoReader, UtxoSource};
use super::{ChainSource, ExtensionReader, ReaderError};
use crate::config::{ConfigError, NetworkConfig, NodeConfig, SlotConfig, PRIMARY_NETWORK};
use crate::confirmation::ConfirmationPolicy;
use crate::error::EngineError;
use crate::extension::KindTag;
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a network's positions line up with primary heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// The primary chain itself: position == height.
    Identity,
    /// EVM chain: height H covers blocks with timestamp <= ts(H) not covered before.
    Timestamp,
    /// Slot chain: height H covers slots up to `slot_at(ts(H))`.
    Slot(SlotConfig),
}

pub struct NetworkHandle {
    pub name: String,
    pub chain: Arc<dyn ChainSource>,
    pub mapping: Mapping,
    pub policy: ConfirmationPolicy,
    readers: BTreeMap<KindTag, Arc<dyn ExtensionReader>>,
}

impl NetworkHandle {
    pub fn new(
        name: impl Into<String>,
        chain: Arc<dyn ChainSource>,
        mapping: Mapping,
        policy: ConfirmationPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            chain,
            mapping,
            policy,
            readers: BTreeMap::new(),
        }
    }

    /// Serve `tags` with `reader`.
    pub fn with_reader(mut self, tags: &[KindTag], reader: Arc<dyn ExtensionReader>) -> Self {
        for tag in tags {
            self.readers.insert(*tag, Arc::clone(&reader));
        }
        self
    }

    pub fn reader(&self, tag: KindTag) -> Result<&Arc<dyn ExtensionReader>, ReaderError> {
        self.readers
            .get(&tag)
            .ok_or_else(|| ReaderError::Unsupported(format!("{tag} on network {}", self.name)))
    }
}

/// All readable networks by name, including [PRIMARY_NETWORK].
#[derive(Default)]
pub struct SourceRegistry {
    networks: BTreeMap<String, NetworkHandle>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: NetworkHandle) {
        self.networks.insert(handle.name.clone(), handle);
    }

    pub fn with(mut self, handle: NetworkHandle) -> Self {
        self.insert(handle);
        self
    }

    pub fn get(&self, name: &str) -> Option<&NetworkHandle> {
        self.networks.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.networks.keys().map(String::as_str)
    }

    /// Build every configured network. UTXO networks need a source supplied by the caller,
    /// keyed by network name.
    pub fn from_config(
        config: &NodeConfig,
        primary_rpc: Arc<EvmRpc>,
        utxo_sources: &BTreeMap<String, Arc<dyn UtxoSource>>,
    ) -> Result<Self, EngineError> {
        let timeout = config.engine.reader_timeout();
        let mut registry = SourceRegistry::new();
        registry.insert(evm_handle(
            PRIMARY_NETWORK,
            primary_rpc,
            Mapping::Identity,
            ConfirmationPolicy::from_config(&config.primary.confirmation),
            config.primary.getlogs_max_range,
        ));
        for (name, network) in &config.networks {
            let handle = match network {
                NetworkConfig::Evm {
                    http_url,
                    confirmation,
                    getlogs_max_range,
                } => evm_handle(
                    name,
                    Arc::new(EvmRpc::new(http_url.clone(), timeout)?),
                    Mapping::Timestamp,
                    ConfirmationPolicy::from_config(confirmation),
                    *getlogs_max_range,
                ),
                NetworkConfig::Utxo {
                    slots,
                    confirmation,
                } => {
                    let source = utxo_sources.get(name).ok_or_else(|| {
                        ConfigError::Invalid(format!("no UTXO source supplied for network {name:?}"))
                    })?;
                    let chain: Arc<dyn ChainSource> =
                        Arc::new(UtxoChain::new(Arc::clone(source), *slots, timeout));
                    NetworkHandle::new(
                        name.clone(),
                        chain,
                        Mapping::Slot(*slots),
                        ConfirmationPolicy::from_config(confirmation),
                    )
                    .with_reader(
                        &KindTag::UTXO,
                        Arc::new(UtxoReader::new(Arc::clone(source), timeout)),
                    )
                }
            };
            registry.insert(handle);
        }
        Ok(registry)
    }
}

fn evm_handle(
    name: &str,
    rpc: Arc<EvmRpc>,
    mapping: Mapping,
    policy: ConfirmationPolicy,
    max_range: u64,
) -> NetworkHandle {
    let logs: Arc<dyn ExtensionReader> = Arc::new(EvmLogReader::new(Arc::clone(&rpc), max_range));
    let chain: Arc<dyn ChainSource> = rpc.clone();
    NetworkHandle::new(name, chain, mapping, policy)
        .with_reader(
            &[
                KindTag::Erc20Transfer,
                KindTag::Erc721,
                KindTag::Erc6551Registry,
                KindTag::GenericLog,
                KindTag::DynamicPrimitive,
            ],
            logs,
        )
        .with_reader(&[KindTag::ContractState], Arc::new(ContractStateReader::new(rpc)))
}
