//! Persistent state on sled.
//!
//! One tree holds every table under a key prefix. A block's writes are staged in a
//! [BlockTx] overlay and land with a single atomic `apply_batch`; dropping the overlay is
//! the rollback. Read-model code gets a [ReadOnlyDb], which has no write methods at all.
//!
//! Rows are CBOR (ciborium). Row types only hold strings and integers so the encoding is
//! identical on every node.

pub mod cursor;
pub mod extensions;
pub mod nonce;
pub mod progress;
pub mod scheduler;
pub mod tables;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const TREE_NAME: &str = "chainfold";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupted row {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

pub fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> Result<T, StoreError> {
    ciborium::de::from_reader(bytes).map_err(|e| StoreError::Corrupted {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: e.to_string(),
    })
}

/// Read access shared by the block overlay and the read-only handle.
pub trait ReadTx {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// All rows under `prefix`, in key order.
    fn scan_prefix_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(key.as_bytes(), &bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>, StoreError> {
        self.scan_prefix_raw(prefix.as_bytes())?
            .into_iter()
            .map(|(k, v)| {
                let value = decode(&k, &v)?;
                Ok((String::from_utf8_lossy(&k).into_owned(), value))
            })
            .collect()
    }
}

/// Owner of the sled database. Cloning shares the same handle.
#[derive(Clone)]
pub struct Database {
    db: sled::Db,
    tree: sled::Tree,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("rows", &self.tree.len())
            .finish_non_exhaustive()
    }
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { db, tree })
    }

    pub fn read_only(&self) -> ReadOnlyDb {
        ReadOnlyDb {
            tree: self.tree.clone(),
        }
    }

    /// Open the write overlay for one block (or one presync batch).
    pub fn begin(&self) -> BlockTx {
        BlockTx {
            tree: self.tree.clone(),
            writes: BTreeMap::new(),
        }
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.tree
    }
}

/// Read-only view for read-model queries.
#[derive(Clone)]
pub struct ReadOnlyDb {
    tree: sled::Tree,
}

impl ReadTx for ReadOnlyDb {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn scan_prefix_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.tree
            .scan_prefix(prefix)
            .map(|row| {
                let (k, v) = row?;
                Ok((k.to_vec(), v.to_vec()))
            })
            .collect()
    }
}

/// Staged writes for one block. Reads see the staged writes first.
pub struct BlockTx {
    tree: sled::Tree,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl BlockTx {
    pub fn put_raw(&mut self, key: &str, value: Vec<u8>) {
        self.writes.insert(key.as_bytes().to_vec(), Some(value));
    }

    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        self.put_raw(key, encode(value)?);
        Ok(())
    }

    pub fn delete(&mut self, key: &str) {
        self.writes.insert(key.as_bytes().to_vec(), None);
    }

    /// Number of staged writes (puts and deletes).
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply every staged write atomically.
    pub fn commit(self) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for (key, value) in self.writes {
            match value {
                Some(v) => batch.insert(key, v),
                None => batch.remove(key),
            }
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }
}

impl ReadTx for BlockTx {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.writes.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.tree.get(key)?.map(|v| v.to_vec())),
        }
    }

    fn scan_prefix_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut merged = BTreeMap::new();
        for row in self.tree.scan_prefix(prefix) {
            let (k, v) = row?;
            merged.insert(k.to_vec(), v.to_vec());
        }
        let staged = self
            .writes
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix));
        for (k, v) in staged {
            match v {
                Some(v) => merged.insert(k.clone(), v.clone()),
                None => merged.remove(k),
            };
        }
        Ok(merged.into_iter().collect())
    }
}
