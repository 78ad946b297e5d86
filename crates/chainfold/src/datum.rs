//! Per-block data handed from the funnel to the state machine.

use alloy::primitives::{Address, B256, U256};
use serde::Serialize;
use std::collections::BTreeMap;

/// Typed payload of one extension datum. The variant is the extension type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DatumPayload {
    #[serde(rename_all = "camelCase")]
    FungibleTransfer {
        from: Address,
        to: Address,
        value: U256,
        tx_hash: B256,
        log_index: u64,
    },
    #[serde(rename_all = "camelCase")]
    NftTransfer {
        from: Address,
        to: Address,
        token_id: U256,
        tx_hash: B256,
        log_index: u64,
    },
    #[serde(rename_all = "camelCase")]
    BoundAccount {
        account: Address,
        implementation: Address,
        salt: B256,
        chain_id: U256,
        token_contract: Address,
        token_id: U256,
    },
    #[serde(rename_all = "camelCase")]
    GenericLog {
        address: Address,
        topics: Vec<B256>,
        data: String,
        tx_hash: B256,
        log_index: u64,
    },
    #[serde(rename_all = "camelCase")]
    ContractState { result: String },
    #[serde(rename_all = "camelCase")]
    DynamicPrimitive {
        contract: Address,
        tx_hash: B256,
        log_index: u64,
    },
    #[serde(rename_all = "camelCase")]
    Delegation {
        address: String,
        pool: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UtxoAsset {
        tx_id: String,
        output_index: u32,
        address: String,
        policy_id: String,
        asset_name: String,
        amount: u64,
        /// Set when this event spends the output.
        spent_in: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MintBurn {
        tx_id: String,
        /// Index of this mint or burn among the ones in `tx_id`.
        event_index: u32,
        policy_id: String,
        /// Asset name to signed quantity (negative is burn).
        assets: BTreeMap<String, i64>,
        metadata: Option<String>,
    },
}

/// One datum emitted by an extension reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDataExtensionDatum {
    pub extension_id: u32,
    /// Position in the extension's own network (block number or slot).
    pub block_number: u64,
    pub payload: DatumPayload,
    /// Paging cursor of the page this datum came from, for paginated sources.
    pub paging_cursor: Option<String>,
}

/// An input submitted on the primary chain, already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedInput {
    pub user_address: Address,
    pub nonce: U256,
    pub data: String,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// Everything the state machine needs for one primary height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainData {
    pub block_height: u64,
    pub block_hash: B256,
    pub timestamp: u64,
    pub submitted_inputs: Vec<SubmittedInput>,
    /// Registration order, then source order.
    pub extension_datums: Vec<ChainDataExtensionDatum>,
    /// First source position of each secondary network not covered once this height is applied.
    pub network_positions: BTreeMap<String, u64>,
    /// Extensions whose pending backfill is included in `extension_datums`.
    pub backfilled: Vec<u32>,
}

/// One presync batch for a single extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresyncChainData {
    pub network: String,
    pub extension_id: u32,
    /// Inclusive source range covered by this batch.
    pub from: u64,
    pub to: u64,
    pub datums: Vec<ChainDataExtensionDatum>,
    /// Paging cursor to resume from; None once the range is exhausted.
    pub paging_cursor: Option<String>,
    /// The extension's presync range is fully covered.
    pub finished: bool,
}

/// Header of a primary block (or any EVM block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub height: u64,
    pub hash: B256,
    pub timestamp: u64,
}
