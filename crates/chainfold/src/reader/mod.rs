//! Extension readers: stateless adapters fetching datums for one extension over a range.
//!
//! Readers never write anything. Every external call goes through [with_timeout]; a
//! timeout or transport failure surfaces as a retryable [ReaderError].

pub mod abi;
pub mod evm;
pub mod registry;
pub mod rpc;
pub mod utxo;

use crate::datum::ChainDataExtensionDatum;
use crate::extension::ChainDataExtension;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use registry::{Mapping, NetworkHandle, SourceRegistry};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("no reader for {0}")]
    Unsupported(String),
}

impl ReaderError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReaderError::Timeout(_) | ReaderError::Transport(_) | ReaderError::Rpc(_)
        )
    }
}

impl From<reqwest::Error> for ReaderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ReaderError::Timeout("HTTP request")
        } else {
            ReaderError::Transport(e.to_string())
        }
    }
}

/// Run `fut` under `limit`; elapsed time becomes [ReaderError::Timeout].
pub async fn with_timeout<T, F>(limit: Duration, what: &'static str, fut: F) -> Result<T, ReaderError>
where
    F: Future<Output = Result<T, ReaderError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ReaderError::Timeout(what)),
    }
}

/// Inclusive source range (block numbers or slots).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRange {
    pub from: u64,
    pub to: u64,
}

impl ReadRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn single(at: u64) -> Self {
        Self { from: at, to: at }
    }
}

/// Result of one read call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadBatch {
    pub datums: Vec<ChainDataExtensionDatum>,
    /// Set by paginated sources when more pages remain for the same range.
    pub next_paging: Option<String>,
}

/// Fetches datums for one extension. One implementation per extension type family.
#[async_trait]
pub trait ExtensionReader: Send + Sync {
    async fn read(
        &self,
        ext: &ChainDataExtension,
        range: ReadRange,
        paging: Option<&str>,
    ) -> Result<ReadBatch, ReaderError>;

    /// Read a range, following pagination to the end.
    async fn read_all(
        &self,
        ext: &ChainDataExtension,
        range: ReadRange,
    ) -> Result<Vec<ChainDataExtensionDatum>, ReaderError> {
        let mut out = Vec::new();
        let mut paging: Option<String> = None;
        loop {
            let batch = self.read(ext, range, paging.as_deref()).await?;
            out.extend(batch.datums);
            match batch.next_paging {
                Some(next) => paging = Some(next),
                None => return Ok(out),
            }
        }
    }
}

/// Position and timestamp source for a network (its tip drives confirmation).
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Latest known position (block number or slot).
    async fn tip(&self) -> Result<u64, ReaderError>;
    /// Unix timestamp (seconds) of a position.
    async fn timestamp(&self, position: u64) -> Result<u64, ReaderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_timeout_maps_elapsed() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ReaderError>(1u64)
        };
        let err = with_timeout(Duration::from_millis(10), "slow call", slow)
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Timeout("slow call")));
        assert!(err.is_transient());
    }

    #[test]
    fn decode_errors_are_not_transient() {
        assert!(!ReaderError::Decode("x".into()).is_transient());
    }
}
