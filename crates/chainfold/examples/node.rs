//! Example: run the engine against a JSON config with a trivial state transition that
//! stores every input it sees.
//!
//! Usage: cargo run -p chainfold --example node -- --config node.json --db ./state [--stop-height N] [--server-only]

use anyhow::Context;
use chainfold::reader::rpc::EvmRpc;
use chainfold::{
    BlockRng, BlockTx, Database, EvmPrimaryChain, HeadWatcher, NodeConfig, Runtime, SourceRegistry,
    StfInput, StfOutcome, Table, Update,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn echo(input: &StfInput, height: u64, _rng: &mut BlockRng, _tx: &BlockTx) -> anyhow::Result<StfOutcome> {
    Ok(StfOutcome::Applied(vec![Update::put(
        Table::app("inputs"),
        format!("{height:020}/{}", input.hash),
        json!({ "data": input.data }),
    )]))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config_path = String::new();
    let mut db_path = String::new();
    let mut stop_height = None;
    let mut server_only = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config_path = args.get(i).cloned().unwrap_or_default();
            }
            "--db" => {
                i += 1;
                db_path = args.get(i).cloned().unwrap_or_default();
            }
            "--stop-height" => {
                i += 1;
                let raw = args.get(i).cloned().unwrap_or_default();
                stop_height = Some(raw.parse::<u64>().context("--stop-height")?);
            }
            "--server-only" => server_only = true,
            _ => {}
        }
        i += 1;
    }
    if config_path.is_empty() || db_path.is_empty() {
        eprintln!("Usage: node --config FILE --db DIR [--stop-height N] [--server-only]");
        std::process::exit(1);
    }

    let config = NodeConfig::load(&config_path)?;
    let db = Arc::new(Database::open(&db_path)?);
    let rpc = Arc::new(EvmRpc::new(
        config.primary.http_url.clone(),
        config.engine.reader_timeout(),
    )?);
    let primary = Arc::new(EvmPrimaryChain::new(Arc::clone(&rpc), config.primary.input_contract));
    // UTXO networks need an embedder-supplied source; none are wired here.
    let registry = SourceRegistry::from_config(&config, rpc, &BTreeMap::new())?;
    let mut runtime = Runtime::new(&config, db, primary, registry, echo)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Some(ws_url) = config.primary.ws_url.clone() {
        let watcher = HeadWatcher::new(ws_url, config.reconnection.clone(), runtime.wake_handle());
        tokio::spawn(watcher.run(shutdown_rx.clone()));
    }

    let mut progress = runtime.subscribe();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            if let Some(p) = *progress.borrow() {
                println!("height={} header=0x{}", p.height, hex::encode(p.header_hash));
            }
        }
    });
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    runtime.run(stop_height, server_only, shutdown_rx).await?;
    Ok(())
}
