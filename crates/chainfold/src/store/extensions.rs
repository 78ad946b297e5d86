//! Pinned extension set.
//!
//! The configured extensions are hashed and persisted before the first read. Once any
//! cursor or progress row exists the persisted set is authoritative: a differing
//! configuration is a fatal [ConfigError::Mismatch]. Dynamically registered extensions are
//! appended with fresh ids and never take part in the comparison.

use super::{cursor, progress, BlockTx, Database, ReadTx, StoreError};
use crate::config::{ConfigError, ExtensionConfig};
use crate::error::EngineError;
use crate::extension::ChainDataExtension;
use serde::{Deserialize, Serialize};

const PREFIX: &str = "ext/";

#[derive(Serialize, Deserialize)]
struct ExtensionRow {
    id: u32,
    config_json: String,
    content_hash: String,
    dynamic: bool,
}

fn key(id: u32) -> String {
    format!("{PREFIX}{id:010}")
}

fn to_row(ext: &ChainDataExtension) -> Result<ExtensionRow, StoreError> {
    Ok(ExtensionRow {
        id: ext.id,
        config_json: serde_json::to_string(&ext.config)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        content_hash: hex::encode(ext.content_hash.as_slice()),
        dynamic: ext.dynamic,
    })
}

fn from_row(key: &str, row: ExtensionRow) -> Result<ChainDataExtension, StoreError> {
    let config: ExtensionConfig =
        serde_json::from_str(&row.config_json).map_err(|e| StoreError::Corrupted {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
    let ext = ChainDataExtension::new(row.id, config, row.dynamic).map_err(|e| StoreError::Corrupted {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    if hex::encode(ext.content_hash.as_slice()) != row.content_hash {
        return Err(StoreError::Corrupted {
            key: key.to_string(),
            reason: "content hash does not match stored config".into(),
        });
    }
    Ok(ext)
}

fn store(tx: &mut BlockTx, ext: &ChainDataExtension) -> Result<(), StoreError> {
    tx.put(&key(ext.id), &to_row(ext)?)
}

/// Every persisted extension, static and dynamic, in id order.
pub fn load_all(reader: &impl ReadTx) -> Result<Vec<ChainDataExtension>, StoreError> {
    reader
        .scan::<ExtensionRow>(PREFIX)?
        .into_iter()
        .map(|(k, row)| from_row(&k, row))
        .collect()
}

/// Whether reading has started: any progress or cursor row exists.
pub fn sync_begun(reader: &impl ReadTx) -> Result<bool, StoreError> {
    Ok(progress::last_processed(reader)?.is_some() || cursor::any(reader)?)
}

fn describe_mismatch(persisted: &[ChainDataExtension], wanted: &[ChainDataExtension]) -> String {
    if persisted.len() != wanted.len() {
        return format!(
            "{} extensions pinned, {} configured",
            persisted.len(),
            wanted.len()
        );
    }
    persisted
        .iter()
        .zip(wanted)
        .find(|(p, w)| p.content_hash != w.content_hash)
        .map(|(p, w)| {
            format!(
                "extension #{} changed ({:?} pinned, {:?} configured)",
                p.id,
                p.name(),
                w.name()
            )
        })
        .unwrap_or_else(|| "extension set differs".into())
}

/// Validate `configs` against the pinned set and return the active extensions.
pub fn pin(db: &Database, configs: &[ExtensionConfig]) -> Result<Vec<ChainDataExtension>, EngineError> {
    let reader = db.read_only();
    let persisted = load_all(&reader)?;
    let (pinned, dynamic): (Vec<_>, Vec<_>) = persisted.into_iter().partition(|e| !e.dynamic);
    let wanted: Vec<ChainDataExtension> = configs
        .iter()
        .enumerate()
        .map(|(i, c)| ChainDataExtension::new(i as u32, c.clone(), false))
        .collect::<Result<_, _>>()?;

    let same = pinned.len() == wanted.len()
        && pinned
            .iter()
            .zip(&wanted)
            .all(|(p, w)| p.id == w.id && p.content_hash == w.content_hash);
    if same {
        tracing::debug!(count = pinned.len(), dynamic = dynamic.len(), "extension set matches pin");
        return Ok(pinned.into_iter().chain(dynamic).collect());
    }

    if sync_begun(&reader)? {
        let detail = describe_mismatch(&pinned, &wanted);
        tracing::error!(%detail, "configured extensions differ from the pinned set after sync started");
        return Err(ConfigError::Mismatch(detail).into());
    }

    let mut tx = db.begin();
    for ext in pinned.iter().chain(&dynamic) {
        tx.delete(&key(ext.id));
    }
    for ext in &wanted {
        store(&mut tx, ext)?;
    }
    tx.commit()?;
    tracing::info!(
        count = wanted.len(),
        replaced = !pinned.is_empty(),
        "pinned extension set"
    );
    Ok(wanted)
}

/// Register a dynamic extension inside the current block. Returns None if an extension
/// with the same content hash already exists.
pub fn register_dynamic(
    tx: &mut BlockTx,
    config: ExtensionConfig,
) -> Result<Option<ChainDataExtension>, EngineError> {
    let existing = load_all(&*tx)?;
    let next_id = existing.iter().map(|e| e.id + 1).max().unwrap_or(0);
    let ext = ChainDataExtension::new(next_id, config, true)?;
    if existing.iter().any(|e| e.content_hash == ext.content_hash) {
        return Ok(None);
    }
    store(tx, &ext)?;
    Ok(Some(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PRIMARY_NETWORK;
    use crate::extension::ExtensionKind;
    use alloy::primitives::Address;

    fn erc20(name: &str, byte: u8) -> ExtensionConfig {
        ExtensionConfig {
            name: name.into(),
            network: PRIMARY_NETWORK.into(),
            start_height: 10,
            stop_height: None,
            scheduled_prefix: None,
            kind: ExtensionKind::Erc20Transfer {
                contract: Address::repeat_byte(byte),
            },
        }
    }

    #[test]
    fn replaces_freely_before_sync() {
        let db = Database::temporary().unwrap();
        let first = pin(&db, &[erc20("a", 1)]).unwrap();
        assert_eq!(first.len(), 1);
        let second = pin(&db, &[erc20("a", 2), erc20("b", 3)]).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(load_all(&db.read_only()).unwrap(), second);
    }

    #[test]
    fn mismatch_after_progress_is_fatal() {
        let db = Database::temporary().unwrap();
        pin(&db, &[erc20("a", 1)]).unwrap();
        let mut tx = db.begin();
        progress::set_last_processed(&mut tx, 200).unwrap();
        tx.commit().unwrap();

        assert!(pin(&db, &[erc20("a", 1)]).is_ok());
        let err = pin(&db, &[erc20("a", 9)]).unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::Mismatch(_))));
        assert!(err.is_fatal());
        assert!(pin(&db, &[]).is_err());
    }

    #[test]
    fn dynamic_extensions_get_fresh_ids_and_survive_pinning() {
        let db = Database::temporary().unwrap();
        pin(&db, &[erc20("a", 1)]).unwrap();
        let mut tx = db.begin();
        let added = register_dynamic(&mut tx, erc20("child", 5)).unwrap().unwrap();
        assert_eq!(added.id, 1);
        assert!(register_dynamic(&mut tx, erc20("child", 5)).unwrap().is_none());
        progress::set_last_processed(&mut tx, 1).unwrap();
        tx.commit().unwrap();

        let active = pin(&db, &[erc20("a", 1)]).unwrap();
        assert_eq!(active.len(), 2);
        assert!(active[1].dynamic);
    }
}
