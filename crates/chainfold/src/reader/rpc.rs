//! Minimal EVM JSON-RPC client over HTTP.
//!
//! eth_blockNumber, eth_getBlockByNumber, eth_getLogs (chunked, with an address-only
//! fallback for nodes that reject topic filters) and eth_call at a height.

use super::abi::{parse_b256, parse_hex_bytes, parse_hex_u64, str_field, LogRecord};
use super::{with_timeout, ChainSource, ReaderError};
use crate::datum::BlockInfo;
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn build_logs_filter(address: &Address, topic0: Option<&B256>, from_block: u64, to_block: u64) -> Value {
    let mut filter = json!({
        "address": format!("0x{}", hex::encode(address.as_slice())),
        "fromBlock": format!("0x{:x}", from_block),
        "toBlock": format!("0x{:x}", to_block),
    });
    // Single-topic filter: [topic0] only (some nodes reject [topic0, null, null, null]).
    if let Some(t0) = topic0 {
        filter["topics"] = json!([format!("0x{}", hex::encode(t0.as_slice()))]);
    }
    filter
}

/// HTTP JSON-RPC client for one EVM network.
pub struct EvmRpc {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EvmRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmRpc").field("url", &self.url).finish_non_exhaustive()
    }
}

impl EvmRpc {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ReaderError> {
        // No system proxy (avoids SCDynamicStore panic in sandbox/CI).
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value, ReaderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        with_timeout(self.timeout, method, async {
            let resp = self.client.post(&self.url).json(&body).send().await?;
            let resp = resp.error_for_status()?;
            let json: Value = resp.json().await?;
            if let Some(err) = json.get("error") {
                return Err(ReaderError::Rpc(err.to_string()));
            }
            json.get("result")
                .cloned()
                .ok_or_else(|| ReaderError::Decode(format!("{method}: missing result")))
        })
        .await
    }

    pub async fn block_number(&self) -> Result<u64, ReaderError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let s = result
            .as_str()
            .ok_or_else(|| ReaderError::Decode("blockNumber not string".into()))?;
        parse_hex_u64(s)
    }

    pub async fn block(&self, height: u64) -> Result<BlockInfo, ReaderError> {
        let result = self
            .call(
                "eth_getBlockByNumber",
                json!([format!("0x{:x}", height), false]),
            )
            .await?;
        if result.is_null() {
            return Err(ReaderError::Rpc(format!("block {height} not found")));
        }
        Ok(BlockInfo {
            height: parse_hex_u64(str_field(&result, "number")?)?,
            hash: parse_b256(str_field(&result, "hash")?)?,
            timestamp: parse_hex_u64(str_field(&result, "timestamp")?)?,
        })
    }

    async fn get_logs_once(&self, filter: Value) -> Result<Vec<Value>, ReaderError> {
        let result = self.call("eth_getLogs", json!([filter])).await?;
        let arr = result
            .as_array()
            .ok_or_else(|| ReaderError::Decode("getLogs not array".into()))?;
        Ok(arr.clone())
    }

    /// Logs of `address` with `topic0` in `[from, to]`, at most `max_range` blocks per request,
    /// ordered by (block_number, log_index).
    pub async fn get_logs(
        &self,
        address: &Address,
        topic0: &B256,
        from: u64,
        to: u64,
        max_range: u64,
    ) -> Result<Vec<LogRecord>, ReaderError> {
        let mut out = Vec::new();
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(max_range.max(1) - 1).min(to);
            let logs = match self
                .get_logs_once(build_logs_filter(address, Some(topic0), start, end))
                .await
            {
                Ok(logs) => logs,
                Err(e) if rejects_topic_filter(&e) => {
                    tracing::debug!(reason = %e, "eth_getLogs with topic filter failed, trying address-only");
                    self.get_logs_once(build_logs_filter(address, None, start, end))
                        .await?
                }
                Err(e) => return Err(e),
            };
            for raw in &logs {
                let record = LogRecord::from_json(raw)?;
                // Address-only fallback (or nodes ignoring the topic filter) return everything.
                if record.address == *address && record.topics.first() == Some(topic0) {
                    out.push(record);
                }
            }
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        out.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(out)
    }

    /// eth_call against `to` at block `height`.
    pub async fn call_at(&self, to: &Address, calldata: &[u8], height: u64) -> Result<Vec<u8>, ReaderError> {
        let params = json!([{
            "to": format!("0x{}", hex::encode(to.as_slice())),
            "data": format!("0x{}", hex::encode(calldata)),
        }, format!("0x{:x}", height)]);
        let result = self.call("eth_call", params).await?;
        let s = result
            .as_str()
            .ok_or_else(|| ReaderError::Decode("eth_call result not string".into()))?;
        parse_hex_bytes(s)
    }
}

#[async_trait]
impl ChainSource for EvmRpc {
    async fn tip(&self) -> Result<u64, ReaderError> {
        self.block_number().await
    }

    async fn timestamp(&self, position: u64) -> Result<u64, ReaderError> {
        Ok(self.block(position).await?.timestamp)
    }
}

/// Nodes such as Anvil refuse some topic filters outright; only then is address-only tried.
fn rejects_topic_filter(e: &ReaderError) -> bool {
    match e {
        ReaderError::Rpc(msg) => msg.contains("data did not match") || msg.contains("variant"),
        _ => false,
    }
}
