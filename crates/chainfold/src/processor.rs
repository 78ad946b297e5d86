//! Datum processors: turn one extension datum into payload-table updates.
//!
//! Dispatch is by payload variant. Processors only read through the block transaction;
//! the engine applies their updates in order before the next datum is processed.

use crate::config::ExtensionConfig;
use crate::datum::{ChainDataExtensionDatum, DatumPayload};
use crate::extension::{ChainDataExtension, ExtensionKind};
use crate::reader::abi::hex_prefixed;
use crate::store::tables::{address_key, balance, CdeTable, Table, Update};
use crate::store::{ReadTx, StoreError};
use alloy::primitives::{Address, I256, U256};
use serde_json::json;

/// Where the datum is being applied.
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext {
    pub in_presync: bool,
    /// Height scheduled inputs produced by this datum land on.
    pub schedule_height: u64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProcessorOutput {
    pub updates: Vec<Update>,
    /// Extensions to register (dynamic primitives).
    pub register: Vec<ExtensionConfig>,
}

pub fn process(
    datum: &ChainDataExtensionDatum,
    ext: &ChainDataExtension,
    ctx: &ProcessContext,
    reader: &impl ReadTx,
) -> Result<ProcessorOutput, StoreError> {
    let id = ext.id;
    let mut out = ProcessorOutput::default();
    match &datum.payload {
        DatumPayload::FungibleTransfer {
            from, to, value, ..
        } => {
            // Zero address is the mint/burn side and has no balance row.
            if from != to {
                let amount = I256::try_from(*value).unwrap_or(I256::MAX);
                if *from != Address::ZERO {
                    let next = balance(reader, id, from)?.saturating_sub(amount);
                    out.updates.push(balance_update(id, from, next));
                }
                if *to != Address::ZERO {
                    let next = balance(reader, id, to)?.saturating_add(amount);
                    out.updates.push(balance_update(id, to, next));
                }
            }
        }
        DatumPayload::NftTransfer { to, token_id, .. } => {
            let table = Table::cde(CdeTable::NftOwners, id);
            let key = token_key(token_id);
            if *to == Address::ZERO {
                out.updates.push(Update::delete(table, key));
            } else {
                out.updates.push(Update::put(
                    table,
                    key,
                    json!({ "owner": address_key(to), "block": datum.block_number }),
                ));
            }
        }
        DatumPayload::BoundAccount {
            account,
            implementation,
            salt,
            chain_id,
            token_contract,
            token_id,
        } => out.updates.push(Update::put(
            Table::cde(CdeTable::BoundAccounts, id),
            address_key(account),
            json!({
                "implementation": address_key(implementation),
                "salt": hex_prefixed(salt.as_slice()),
                "chainId": chain_id.to_string(),
                "tokenContract": address_key(token_contract),
                "tokenId": token_id.to_string(),
                "block": datum.block_number,
            }),
        )),
        DatumPayload::GenericLog {
            address,
            topics,
            data,
            tx_hash,
            log_index,
        } => out.updates.push(Update::put(
            Table::cde(CdeTable::EventLog, id),
            format!("{:020}/{:010}", datum.block_number, log_index),
            json!({
                "address": address_key(address),
                "topics": topics.iter().map(|t| hex_prefixed(t.as_slice())).collect::<Vec<_>>(),
                "data": data,
                "txHash": hex_prefixed(tx_hash.as_slice()),
            }),
        )),
        DatumPayload::ContractState { result } => {
            let table = Table::cde(CdeTable::ContractState, id);
            let row = json!({ "block": datum.block_number, "result": result });
            out.updates.push(Update::put(
                table.clone(),
                format!("{:020}", datum.block_number),
                row.clone(),
            ));
            out.updates.push(Update::put(table, "latest", row));
        }
        DatumPayload::DynamicPrimitive { contract, .. } => {
            if let ExtensionKind::DynamicPrimitive { target, .. } = &ext.config.kind {
                // The child starts at the position its factory saw it created.
                out.updates.push(Update::put(
                    Table::cde(CdeTable::DynamicRegistrations, id),
                    address_key(contract),
                    json!({ "block": datum.block_number, "startHeight": datum.block_number }),
                ));
                out.register.push(ExtensionConfig {
                    name: format!("{}/{}", ext.name(), address_key(contract)),
                    network: ext.network().to_string(),
                    start_height: datum.block_number,
                    stop_height: ext.config.stop_height,
                    scheduled_prefix: ext.config.scheduled_prefix.clone(),
                    kind: target.instantiate(*contract),
                });
            }
        }
        DatumPayload::Delegation { address, pool } => {
            let table = Table::cde(CdeTable::Delegations, id);
            match pool {
                Some(pool) => out.updates.push(Update::put(
                    table,
                    address.clone(),
                    json!({ "pool": pool, "position": datum.block_number }),
                )),
                None => out.updates.push(Update::delete(table, address.clone())),
            }
        }
        DatumPayload::UtxoAsset {
            tx_id,
            output_index,
            address,
            policy_id,
            asset_name,
            amount,
            spent_in,
        } => {
            let table = Table::cde(CdeTable::UtxoAssets, id);
            let key = format!("{tx_id}#{output_index}");
            match spent_in {
                Some(_) => out.updates.push(Update::delete(table, key)),
                None => out.updates.push(Update::put(
                    table,
                    key,
                    json!({
                        "address": address,
                        "policyId": policy_id,
                        "assetName": asset_name,
                        "amount": amount,
                        "position": datum.block_number,
                    }),
                )),
            }
        }
        DatumPayload::MintBurn {
            tx_id,
            event_index,
            policy_id,
            assets,
            metadata,
        } => out.updates.push(Update::put(
            Table::cde(CdeTable::MintBurnLog, id),
            format!("{:020}/{tx_id}/{event_index:05}", datum.block_number),
            json!({ "policyId": policy_id, "assets": assets, "metadata": metadata }),
        )),
    }

    if let Some(prefix) = &ext.config.scheduled_prefix {
        let payload = serde_json::to_string(&datum.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        out.updates.push(Update::Schedule {
            height: ctx.schedule_height,
            input_data: format!("{prefix}|{payload}"),
        });
    }

    if ctx.in_presync {
        tracing::trace!(extension = ext.name(), position = datum.block_number, "presync datum processed");
    }
    Ok(out)
}

fn balance_update(extension_id: u32, account: &Address, value: I256) -> Update {
    Update::put(
        Table::cde(CdeTable::FungibleBalances, extension_id),
        address_key(account),
        json!({ "balance": value.to_string() }),
    )
}

/// Decimal value of a token id, as used for ownership keys.
pub fn token_key(token_id: &U256) -> String {
    token_id.to_string()
}
