//! Derived tables: application rows written by the state transition and per-extension
//! payload tables written by datum processors.

use super::{BlockTx, ReadTx, StoreError};
use alloy::primitives::{Address, I256, U256};
use serde_json::Value;
use std::fmt;

/// Payload table of one extension type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CdeTable {
    FungibleBalances,
    NftOwners,
    BoundAccounts,
    EventLog,
    ContractState,
    DynamicRegistrations,
    Delegations,
    UtxoAssets,
    MintBurnLog,
}

impl CdeTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            CdeTable::FungibleBalances => "fungible_balances",
            CdeTable::NftOwners => "nft_owners",
            CdeTable::BoundAccounts => "bound_accounts",
            CdeTable::EventLog => "event_log",
            CdeTable::ContractState => "contract_state",
            CdeTable::DynamicRegistrations => "dynamic_registrations",
            CdeTable::Delegations => "delegations",
            CdeTable::UtxoAssets => "utxo_assets",
            CdeTable::MintBurnLog => "mint_burn_log",
        }
    }
}

/// Where a row lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Table {
    /// Application table owned by the state transition.
    App(String),
    /// Payload table of one extension.
    Cde { table: CdeTable, extension_id: u32 },
}

impl Table {
    pub fn app(name: impl Into<String>) -> Self {
        Table::App(name.into())
    }

    pub fn cde(table: CdeTable, extension_id: u32) -> Self {
        Table::Cde {
            table,
            extension_id,
        }
    }

    /// Key prefix of every row in this table.
    pub fn prefix(&self) -> String {
        match self {
            Table::App(name) => format!("app/{name}/"),
            Table::Cde {
                table,
                extension_id,
            } => format!("cde/{}/{extension_id:010}/", table.as_str()),
        }
    }

    pub fn row_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::App(name) => write!(f, "app:{name}"),
            Table::Cde {
                table,
                extension_id,
            } => write!(f, "{}:{extension_id}", table.as_str()),
        }
    }
}

/// One relational change, applied in order inside the block transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Put {
        table: Table,
        key: String,
        value: Value,
    },
    Delete {
        table: Table,
        key: String,
    },
    /// Queue `input_data` as an input at a later primary height.
    Schedule { height: u64, input_data: String },
}

impl Update {
    pub fn put(table: Table, key: impl Into<String>, value: Value) -> Self {
        Update::Put {
            table,
            key: key.into(),
            value,
        }
    }

    pub fn delete(table: Table, key: impl Into<String>) -> Self {
        Update::Delete {
            table,
            key: key.into(),
        }
    }
}

/// Write a Put or Delete. Schedule updates go through [super::scheduler] and are ignored here.
pub fn write(tx: &mut BlockTx, update: &Update) -> Result<(), StoreError> {
    match update {
        Update::Put { table, key, value } => tx.put(&table.row_key(key), value),
        Update::Delete { table, key } => {
            tx.delete(&table.row_key(key));
            Ok(())
        }
        Update::Schedule { .. } => Ok(()),
    }
}

pub fn row(reader: &impl ReadTx, table: &Table, key: &str) -> Result<Option<Value>, StoreError> {
    reader.get(&table.row_key(key))
}

/// Every row of a table as (row key, value), in key order.
pub fn rows(reader: &impl ReadTx, table: &Table) -> Result<Vec<(String, Value)>, StoreError> {
    let prefix = table.prefix();
    Ok(reader
        .scan::<Value>(&prefix)?
        .into_iter()
        .map(|(k, v)| (k[prefix.len()..].to_string(), v))
        .collect())
}

/// Row key of an account in balance and ownership tables.
pub fn address_key(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// Signed balance of `address` in a fungible extension; zero when absent.
pub fn balance(reader: &impl ReadTx, extension_id: u32, address: &Address) -> Result<I256, StoreError> {
    let table = Table::cde(CdeTable::FungibleBalances, extension_id);
    let key = address_key(address);
    match row(reader, &table, &key)? {
        None => Ok(I256::ZERO),
        Some(value) => {
            let raw = value
                .get("balance")
                .and_then(Value::as_str)
                .ok_or_else(|| StoreError::Corrupted {
                    key: table.row_key(&key),
                    reason: "missing balance".into(),
                })?;
            I256::from_dec_str(raw).map_err(|e| StoreError::Corrupted {
                key: table.row_key(&key),
                reason: e.to_string(),
            })
        }
    }
}

/// Current owner of an NFT, or None if unminted or burned.
pub fn nft_owner(reader: &impl ReadTx, extension_id: u32, token_id: &U256) -> Result<Option<String>, StoreError> {
    let table = Table::cde(CdeTable::NftOwners, extension_id);
    Ok(row(reader, &table, &token_id.to_string())?
        .and_then(|v| v.get("owner").and_then(Value::as_str).map(str::to_string)))
}
