//! Chain data extension model: configured kinds, pinned extensions, content hashes.

use crate::config::{ConfigError, ExtensionConfig};
use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Which reader family serves a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceFamily {
    Evm,
    Utxo,
}

/// Extension type plus its source identifiers. Serialized with a `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExtensionKind {
    /// ERC-20 style `Transfer(address,address,uint256)`.
    #[serde(rename_all = "camelCase")]
    Erc20Transfer { contract: Address },
    /// ERC-721 `Transfer` with indexed token id; mint when `from` is zero.
    #[serde(rename_all = "camelCase")]
    Erc721 { contract: Address },
    /// ERC-6551 registry `ERC6551AccountCreated`.
    #[serde(rename_all = "camelCase")]
    Erc6551Registry {
        contract: Address,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        implementation: Option<Address>,
    },
    /// Any event by signature, stored raw.
    #[serde(rename_all = "camelCase")]
    GenericLog {
        contract: Address,
        event_signature: String,
    },
    /// `eth_call` result at a height.
    #[serde(rename_all = "camelCase")]
    ContractState { contract: Address, calldata: String },
    /// Factory event announcing a new contract; each one registers a new extension.
    #[serde(rename_all = "camelCase")]
    DynamicPrimitive {
        contract: Address,
        event_signature: String,
        /// Topic holding the new address; None reads the first data word.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address_topic: Option<usize>,
        target: DynamicTarget,
    },
    #[serde(rename_all = "camelCase")]
    UtxoDelegation {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pools: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    UtxoAsset {
        policy_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        asset_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MintBurn { policy_ids: Vec<String> },
}

/// Kind registered for each address announced by a [ExtensionKind::DynamicPrimitive].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DynamicTarget {
    Erc20Transfer,
    Erc721,
    #[serde(rename_all = "camelCase")]
    GenericLog { event_signature: String },
}

impl DynamicTarget {
    pub fn instantiate(&self, contract: Address) -> ExtensionKind {
        match self {
            DynamicTarget::Erc20Transfer => ExtensionKind::Erc20Transfer { contract },
            DynamicTarget::Erc721 => ExtensionKind::Erc721 { contract },
            DynamicTarget::GenericLog { event_signature } => ExtensionKind::GenericLog {
                contract,
                event_signature: event_signature.clone(),
            },
        }
    }
}

/// Dispatch key for readers and processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KindTag {
    Erc20Transfer,
    Erc721,
    Erc6551Registry,
    GenericLog,
    ContractState,
    DynamicPrimitive,
    UtxoDelegation,
    UtxoAsset,
    MintBurn,
}

impl KindTag {
    pub const EVM: [KindTag; 6] = [
        KindTag::Erc20Transfer,
        KindTag::Erc721,
        KindTag::Erc6551Registry,
        KindTag::GenericLog,
        KindTag::ContractState,
        KindTag::DynamicPrimitive,
    ];
    pub const UTXO: [KindTag; 3] = [KindTag::UtxoDelegation, KindTag::UtxoAsset, KindTag::MintBurn];

    pub fn as_str(&self) -> &'static str {
        match self {
            KindTag::Erc20Transfer => "erc20-transfer",
            KindTag::Erc721 => "erc721",
            KindTag::Erc6551Registry => "erc6551-registry",
            KindTag::GenericLog => "generic-log",
            KindTag::ContractState => "contract-state",
            KindTag::DynamicPrimitive => "dynamic-primitive",
            KindTag::UtxoDelegation => "utxo-delegation",
            KindTag::UtxoAsset => "utxo-asset",
            KindTag::MintBurn => "mint-burn",
        }
    }
}

impl fmt::Display for KindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ExtensionKind {
    pub fn tag(&self) -> KindTag {
        match self {
            ExtensionKind::Erc20Transfer { .. } => KindTag::Erc20Transfer,
            ExtensionKind::Erc721 { .. } => KindTag::Erc721,
            ExtensionKind::Erc6551Registry { .. } => KindTag::Erc6551Registry,
            ExtensionKind::GenericLog { .. } => KindTag::GenericLog,
            ExtensionKind::ContractState { .. } => KindTag::ContractState,
            ExtensionKind::DynamicPrimitive { .. } => KindTag::DynamicPrimitive,
            ExtensionKind::UtxoDelegation { .. } => KindTag::UtxoDelegation,
            ExtensionKind::UtxoAsset { .. } => KindTag::UtxoAsset,
            ExtensionKind::MintBurn { .. } => KindTag::MintBurn,
        }
    }

    pub fn family(&self) -> SourceFamily {
        match self.tag() {
            KindTag::UtxoDelegation | KindTag::UtxoAsset | KindTag::MintBurn => SourceFamily::Utxo,
            _ => SourceFamily::Evm,
        }
    }

    /// Contract whose logs are read, for EVM kinds.
    pub fn contract(&self) -> Option<Address> {
        match self {
            ExtensionKind::Erc20Transfer { contract }
            | ExtensionKind::Erc721 { contract }
            | ExtensionKind::Erc6551Registry { contract, .. }
            | ExtensionKind::GenericLog { contract, .. }
            | ExtensionKind::ContractState { contract, .. }
            | ExtensionKind::DynamicPrimitive { contract, .. } => Some(*contract),
            _ => None,
        }
    }
}

/// An extension pinned for this deployment. The config never changes once pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDataExtension {
    /// Registration index; the merge order within a block.
    pub id: u32,
    pub config: ExtensionConfig,
    pub content_hash: B256,
    /// Registered at runtime by a dynamic primitive rather than loaded from config.
    pub dynamic: bool,
}

impl ChainDataExtension {
    pub fn new(id: u32, config: ExtensionConfig, dynamic: bool) -> Result<Self, ConfigError> {
        let content_hash = content_hash(&config)?;
        Ok(Self {
            id,
            config,
            content_hash,
            dynamic,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn network(&self) -> &str {
        &self.config.network
    }

    pub fn tag(&self) -> KindTag {
        self.config.kind.tag()
    }

    /// Clip an inclusive source range to this extension's [start, stop]. None if disjoint.
    pub fn clip(&self, from: u64, to: u64) -> Option<(u64, u64)> {
        let from = from.max(self.config.start_height);
        let to = match self.config.stop_height {
            Some(stop) => to.min(stop),
            None => to,
        };
        (from <= to).then_some((from, to))
    }
}

/// Keccak-256 of the canonical JSON encoding of an extension config.
pub fn content_hash(config: &ExtensionConfig) -> Result<B256, ConfigError> {
    // serde_json of a derived struct is field-ordered; Vec-backed, never a HashMap.
    let bytes = serde_json::to_vec(config)
        .map_err(|e| ConfigError::Invalid(format!("extension {:?} cannot be encoded: {e}", config.name)))?;
    Ok(B256::from_slice(&Keccak256::digest(&bytes)))
}
