//! Wakes the idle engine loop when the primary chain announces a new head.
//!
//! Optional: the runtime polls on its own. The watcher only shortens the wait.

use crate::config::ReconnectionConfig;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Follows `newHeads` over WebSocket and pings [Notify] on every head.
pub struct HeadWatcher {
    ws_url: String,
    reconnection: ReconnectionConfig,
    notify: Arc<Notify>,
}

impl HeadWatcher {
    pub fn new(ws_url: impl Into<String>, reconnection: ReconnectionConfig, notify: Arc<Notify>) -> Self {
        Self {
            ws_url: ws_url.into(),
            reconnection,
            notify,
        }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped). Call from a spawned task.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let outcome = tokio::select! {
                r = self.run_once() => r,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            };
            let delay = match outcome {
                Ok(()) => {
                    attempt = 0;
                    Duration::from_secs(self.reconnection.initial_backoff_secs)
                }
                Err(e) => {
                    tracing::warn!(reason = %e, "head watcher failed, reconnecting...");
                    let base = self.reconnection.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    base + Duration::from_millis(rand::thread_rng().gen_range(0..500))
                }
            };
            tokio::select! {
                _ = sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_once(&self) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.ws_url).await.context("WS connect")?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let sub_req = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"]
        });
        ws_sender
            .send(Message::Text(serde_json::to_string(&sub_req)?))
            .await
            .map_err(|e| anyhow::anyhow!("send subscribe: {}", e))?;

        match timeout(Duration::from_secs(10), ws_receiver.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let v: Value = serde_json::from_str(&text).context("parse sub response")?;
                if let Some(err) = v.get("error") {
                    anyhow::bail!("subscribe error: {}", err);
                }
                let id = v["result"].as_str().ok_or_else(|| anyhow::anyhow!("no result"))?;
                tracing::info!(url = %self.ws_url, subscription = id, "watching primary heads");
            }
            Ok(Some(Ok(_))) => anyhow::bail!("unexpected message"),
            Ok(Some(Err(e))) => return Err(anyhow::anyhow!("ws: {}", e)),
            Ok(None) => anyhow::bail!("ws closed"),
            Err(_) => anyhow::bail!("subscribe timeout"),
        }

        while let Some(msg) = ws_receiver.next().await {
            let text = match msg.map_err(|e| anyhow::anyhow!("ws: {}", e))? {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let v: Value = serde_json::from_str(&text).context("parse ws message")?;
            if v.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
                continue;
            }
            let number = v
                .pointer("/params/result/number")
                .and_then(|n| n.as_str())
                .and_then(|n| u64::from_str_radix(n.trim_start_matches("0x"), 16).ok());
            tracing::trace!(?number, "new primary head");
            self.notify.notify_one();
        }
        Ok(())
    }
}
