//! Readers for EVM-family extensions: log-based primitives and contract-state snapshots.

use super::abi::{
    decode_bound_account, decode_dynamic, decode_fungible_transfer, decode_generic,
    decode_nft_transfer, event_topic, parse_hex_bytes, LogRecord, ACCOUNT_CREATED_EVENT,
    TRANSFER_EVENT,
};
use super::rpc::EvmRpc;
use super::{ExtensionReader, ReadBatch, ReadRange, ReaderError};
use crate::datum::{ChainDataExtensionDatum, DatumPayload};
use crate::extension::{ChainDataExtension, ExtensionKind};
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use std::sync::Arc;

/// Log-based primitives: ERC-20, ERC-721, ERC-6551 registry, generic logs, dynamic primitives.
pub struct EvmLogReader {
    rpc: Arc<EvmRpc>,
    max_range: u64,
}

impl EvmLogReader {
    pub fn new(rpc: Arc<EvmRpc>, max_range: u64) -> Self {
        Self { rpc, max_range }
    }
}

type Decoder = Box<dyn Fn(&LogRecord) -> Result<DatumPayload, ReaderError> + Send + Sync>;

/// Contract, topic0 and decoder for a log-based kind.
fn log_plan(kind: &ExtensionKind) -> Result<(Address, B256, Decoder), ReaderError> {
    Ok(match kind {
        ExtensionKind::Erc20Transfer { contract } => (
            *contract,
            event_topic(TRANSFER_EVENT),
            Box::new(decode_fungible_transfer) as Decoder,
        ),
        ExtensionKind::Erc721 { contract } => (
            *contract,
            event_topic(TRANSFER_EVENT),
            Box::new(decode_nft_transfer) as Decoder,
        ),
        ExtensionKind::Erc6551Registry {
            contract,
            implementation,
        } => {
            let implementation = *implementation;
            (
                *contract,
                event_topic(ACCOUNT_CREATED_EVENT),
                Box::new(move |log: &LogRecord| -> Result<DatumPayload, ReaderError> {
                    let payload = decode_bound_account(log)?;
                    match (&payload, implementation) {
                        (DatumPayload::BoundAccount { implementation: got, .. }, Some(want))
                            if *got != want =>
                        {
                            Err(ReaderError::Decode("implementation filtered".into()))
                        }
                        _ => Ok(payload),
                    }
                }) as Decoder,
            )
        }
        ExtensionKind::GenericLog {
            contract,
            event_signature,
        } => (
            *contract,
            event_topic(event_signature),
            Box::new(|log: &LogRecord| Ok::<_, ReaderError>(decode_generic(log))) as Decoder,
        ),
        ExtensionKind::DynamicPrimitive {
            contract,
            event_signature,
            address_topic,
            ..
        } => {
            let address_topic = *address_topic;
            (
                *contract,
                event_topic(event_signature),
                Box::new(move |log: &LogRecord| decode_dynamic(log, address_topic)) as Decoder,
            )
        }
        other => {
            return Err(ReaderError::Unsupported(format!(
                "{} on an EVM log reader",
                other.tag()
            )))
        }
    })
}

#[async_trait]
impl ExtensionReader for EvmLogReader {
    async fn read(
        &self,
        ext: &ChainDataExtension,
        range: ReadRange,
        _paging: Option<&str>,
    ) -> Result<ReadBatch, ReaderError> {
        let (contract, topic0, decode) = log_plan(&ext.config.kind)?;
        let logs = self
            .rpc
            .get_logs(&contract, &topic0, range.from, range.to, self.max_range)
            .await?;
        let mut datums = Vec::with_capacity(logs.len());
        for log in &logs {
            // Logs sharing topic0 but not the expected shape (e.g. ERC-721 on an ERC-20 filter)
            // are skipped the same way on every node.
            match decode(log) {
                Ok(payload) => datums.push(ChainDataExtensionDatum {
                    extension_id: ext.id,
                    block_number: log.block_number,
                    payload,
                    paging_cursor: None,
                }),
                Err(e) => tracing::debug!(
                    extension = ext.name(),
                    block = log.block_number,
                    log_index = log.log_index,
                    reason = %e,
                    "log skipped"
                ),
            }
        }
        if !datums.is_empty() {
            tracing::debug!(
                extension = ext.name(),
                count = datums.len(),
                from = range.from,
                to = range.to,
                "decoded datums"
            );
        }
        Ok(ReadBatch {
            datums,
            next_paging: None,
        })
    }
}

/// `eth_call` snapshot at the end of the range (one datum per read).
pub struct ContractStateReader {
    rpc: Arc<EvmRpc>,
}

impl ContractStateReader {
    pub fn new(rpc: Arc<EvmRpc>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl ExtensionReader for ContractStateReader {
    async fn read(
        &self,
        ext: &ChainDataExtension,
        range: ReadRange,
        _paging: Option<&str>,
    ) -> Result<ReadBatch, ReaderError> {
        let ExtensionKind::ContractState { contract, calldata } = &ext.config.kind else {
            return Err(ReaderError::Unsupported(format!(
                "{} on a contract-state reader",
                ext.tag()
            )));
        };
        let calldata = parse_hex_bytes(calldata)?;
        let result = self.rpc.call_at(contract, &calldata, range.to).await?;
        Ok(ReadBatch {
            datums: vec![ChainDataExtensionDatum {
                extension_id: ext.id,
                block_number: range.to,
                payload: DatumPayload::ContractState {
                    result: format!("0x{}", hex::encode(result)),
                },
                paging_cursor: None,
            }],
            next_paging: None,
        })
    }
}
