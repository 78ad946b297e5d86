//! Node configuration.
//!
//! Loaded once at startup from a JSON file. The extension list is hash-pinned on first
//! sync (see [crate::store::extensions]); the remaining sections are tunables.

use crate::extension::{ExtensionKind, SourceFamily};
use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Network name reserved for the primary chain.
pub const PRIMARY_NETWORK: &str = "primary";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("extension config mismatch: {0}")]
    Mismatch(String),
}

/// Full node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub primary: PrimaryConfig,
    /// Secondary networks by name. The primary chain is always available as [PRIMARY_NETWORK].
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
    /// Extensions in registration order. Order is part of the deterministic merge.
    #[serde(default)]
    pub extensions: Vec<ExtensionConfig>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
}

/// Primary chain: where submitted inputs come from and which heights the engine walks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryConfig {
    /// HTTP RPC URL (eth_getLogs, eth_blockNumber, eth_getBlockByNumber).
    pub http_url: String,
    /// Optional WebSocket URL; when set, newHeads wakes the idle loop.
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Contract emitting `InputSubmitted` logs.
    pub input_contract: Address,
    /// First primary height the state machine applies.
    pub start_height: u64,
    #[serde(default = "default_getlogs_max_range")]
    pub getlogs_max_range: u64,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
}

/// A secondary network read by extensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NetworkConfig {
    /// EVM chain mapped onto primary heights by block timestamp.
    #[serde(rename_all = "camelCase")]
    Evm {
        http_url: String,
        #[serde(default)]
        confirmation: ConfirmationConfig,
        #[serde(default = "default_getlogs_max_range")]
        getlogs_max_range: u64,
    },
    /// Slot-based UTXO chain mapped onto primary heights through [SlotConfig].
    #[serde(rename_all = "camelCase")]
    Utxo {
        slots: SlotConfig,
        #[serde(default)]
        confirmation: ConfirmationConfig,
    },
}

impl NetworkConfig {
    pub fn family(&self) -> SourceFamily {
        match self {
            NetworkConfig::Evm { .. } => SourceFamily::Evm,
            NetworkConfig::Utxo { .. } => SourceFamily::Utxo,
        }
    }

    pub fn confirmation(&self) -> &ConfirmationConfig {
        match self {
            NetworkConfig::Evm { confirmation, .. } | NetworkConfig::Utxo { confirmation, .. } => {
                confirmation
            }
        }
    }
}

/// Slot arithmetic for slot-based chains: `slot = zero_slot + (t - zero_time) / slot_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotConfig {
    /// Unix time (seconds) of `zero_slot`.
    pub zero_time: u64,
    pub zero_slot: u64,
    pub slot_length_secs: u64,
}

impl SlotConfig {
    /// Last slot that started at or before `timestamp`.
    pub fn slot_at(&self, timestamp: u64) -> u64 {
        let elapsed = timestamp.saturating_sub(self.zero_time);
        self.zero_slot + elapsed / self.slot_length_secs.max(1)
    }

    /// Start time of `slot`.
    pub fn time_of(&self, slot: u64) -> u64 {
        self.zero_time + slot.saturating_sub(self.zero_slot) * self.slot_length_secs
    }
}

/// How far behind the tip a network must stay before a position is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationConfig {
    #[serde(default = "default_confirmation_depth")]
    pub depth: u64,
    /// Minimum seconds since the position's timestamp.
    #[serde(default)]
    pub min_age_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            depth: default_confirmation_depth(),
            min_age_secs: 0,
        }
    }
}

/// One configured chain data extension, before pinning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionConfig {
    /// Display name; unique within the deployment.
    pub name: String,
    #[serde(default = "default_network")]
    pub network: String,
    /// First source position (block or slot) read for this extension.
    pub start_height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_height: Option<u64>,
    /// When set, every datum also schedules `"{prefix}|{payload json}"` as an STF input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_prefix: Option<String>,
    #[serde(flatten)]
    pub kind: ExtensionKind,
}

/// Engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Idle poll interval when the next height is not yet confirmed.
    pub poll_interval_ms: u64,
    /// Timeout for every external call.
    pub reader_timeout_secs: u64,
    /// Max source positions per presync batch.
    pub presync_step: u64,
    /// Nonce rows older than this many blocks are swept.
    pub nonce_retention_blocks: u64,
    /// Sweep every N blocks (only once caught up).
    pub nonce_gc_interval: u64,
    /// Stop applying blocks after this height (the loop idles).
    pub stop_height: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            reader_timeout_secs: 10,
            presync_step: 1000,
            nonce_retention_blocks: 10_000,
            nonce_gc_interval: 500,
            stop_height: None,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reader_timeout(&self) -> Duration {
        Duration::from_secs(self.reader_timeout_secs)
    }
}

/// Retry backoff (initial and max seconds) for failed reads and failed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionConfig {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}

impl ReconnectionConfig {
    /// Exponential delay for the given retry attempt, capped at `max_backoff_secs`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        let secs = self
            .initial_backoff_secs
            .saturating_mul(factor)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

fn default_getlogs_max_range() -> u64 {
    1000
}

fn default_confirmation_depth() -> u64 {
    6
}

fn default_network() -> String {
    PRIMARY_NETWORK.to_string()
}

impl NodeConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Family of a network name, or None if it is not configured.
    pub fn network_family(&self, network: &str) -> Option<SourceFamily> {
        if network == PRIMARY_NETWORK {
            return Some(SourceFamily::Evm);
        }
        self.networks.get(network).map(NetworkConfig::family)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary.getlogs_max_range == 0 {
            return Err(ConfigError::Invalid("primary.getlogsMaxRange must be > 0".into()));
        }
        if self.networks.contains_key(PRIMARY_NETWORK) {
            return Err(ConfigError::Invalid(format!(
                "network name {PRIMARY_NETWORK:?} is reserved"
            )));
        }
        for (name, network) in &self.networks {
            match network {
                NetworkConfig::Evm {
                    getlogs_max_range, ..
                } if *getlogs_max_range == 0 => {
                    return Err(ConfigError::Invalid(format!(
                        "network {name}: getlogsMaxRange must be > 0"
                    )));
                }
                NetworkConfig::Utxo { slots, .. } if slots.slot_length_secs == 0 => {
                    return Err(ConfigError::Invalid(format!(
                        "network {name}: slotLengthSecs must be > 0"
                    )));
                }
                _ => {}
            }
        }
        if self.engine.presync_step == 0 {
            return Err(ConfigError::Invalid("engine.presyncStep must be > 0".into()));
        }
        let mut names = BTreeSet::new();
        for ext in &self.extensions {
            if !names.insert(ext.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate extension name {:?}",
                    ext.name
                )));
            }
            let family = self.network_family(&ext.network).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "extension {:?}: unknown network {:?}",
                    ext.name, ext.network
                ))
            })?;
            if ext.kind.family() != family {
                return Err(ConfigError::Invalid(format!(
                    "extension {:?}: {} cannot read a {:?} network",
                    ext.name,
                    ext.kind.tag(),
                    family
                )));
            }
            if let Some(stop) = ext.stop_height {
                if stop < ext.start_height {
                    return Err(ConfigError::Invalid(format!(
                        "extension {:?}: stopHeight before startHeight",
                        ext.name
                    )));
                }
            }
        }
        Ok(())
    }
}
