use crate::config::ConfigError;
use crate::reader::ReaderError;
use crate::store::StoreError;
use thiserror::Error;

/// Anything that stops a tick. [EngineError::is_fatal] separates halt from retry.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The state transition returned an error; the block was rolled back.
    #[error("state transition failed at height {height}: {cause:#}")]
    Stf { height: u64, cause: anyhow::Error },
    #[error("invalid engine state: {0}")]
    InvalidState(String),
}

impl EngineError {
    /// Fatal errors halt the process; everything else is retried after a backoff.
    ///
    /// A source that cannot serve a kind, or answers in a shape that does not decode,
    /// fails the same way on every retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Config(_)
                | EngineError::InvalidState(_)
                | EngineError::Store(StoreError::Corrupted { .. })
                | EngineError::Reader(ReaderError::Unsupported(_) | ReaderError::Decode(_))
        )
    }
}
