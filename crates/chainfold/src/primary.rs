//! Primary chain: block headers and submitted inputs for the heights the engine applies.

use crate::datum::{BlockInfo, SubmittedInput};
use crate::reader::abi::{decode_input_submitted, event_topic, INPUT_SUBMITTED_EVENT};
use crate::reader::rpc::EvmRpc;
use crate::reader::{ChainSource, ReaderError};
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use std::sync::Arc;

/// Source of primary blocks. Its [ChainSource::tip] drives the primary confirmation policy.
#[async_trait]
pub trait PrimaryChain: ChainSource {
    async fn block(&self, height: u64) -> Result<BlockInfo, ReaderError>;

    /// Decoded inputs submitted at `height`, in log order. Malformed ones are already dropped.
    async fn submitted_inputs(&self, height: u64) -> Result<Vec<SubmittedInput>, ReaderError>;
}

/// Primary chain over EVM JSON-RPC; inputs are `InputSubmitted` logs of one contract.
pub struct EvmPrimaryChain {
    rpc: Arc<EvmRpc>,
    input_contract: Address,
    topic0: B256,
}

impl EvmPrimaryChain {
    pub fn new(rpc: Arc<EvmRpc>, input_contract: Address) -> Self {
        Self {
            rpc,
            input_contract,
            topic0: event_topic(INPUT_SUBMITTED_EVENT),
        }
    }

    pub fn rpc(&self) -> &Arc<EvmRpc> {
        &self.rpc
    }
}

#[async_trait]
impl ChainSource for EvmPrimaryChain {
    async fn tip(&self) -> Result<u64, ReaderError> {
        self.rpc.block_number().await
    }

    async fn timestamp(&self, position: u64) -> Result<u64, ReaderError> {
        Ok(self.rpc.block(position).await?.timestamp)
    }
}

#[async_trait]
impl PrimaryChain for EvmPrimaryChain {
    async fn block(&self, height: u64) -> Result<BlockInfo, ReaderError> {
        self.rpc.block(height).await
    }

    async fn submitted_inputs(&self, height: u64) -> Result<Vec<SubmittedInput>, ReaderError> {
        let logs = self
            .rpc
            .get_logs(&self.input_contract, &self.topic0, height, height, 1)
            .await?;
        let mut inputs = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_input_submitted(log) {
                Ok(input) => inputs.push(input),
                Err(e) => tracing::warn!(
                    height,
                    tx_hash = %log.tx_hash,
                    log_index = log.log_index,
                    reason = %e,
                    "dropping malformed submitted input"
                ),
            }
        }
        Ok(inputs)
    }
}
