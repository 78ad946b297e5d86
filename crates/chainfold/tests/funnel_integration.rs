//! Presync, multi-network mapping and dynamic registration.

mod common;

use alloy::primitives::{Address, B256};
use chainfold::config::{SlotConfig, PRIMARY_NETWORK};
use chainfold::confirmation::ConfirmationPolicy;
use chainfold::datum::DatumPayload;
use chainfold::extension::{DynamicTarget, ExtensionKind, KindTag};
use chainfold::reader::rpc::EvmRpc;
use chainfold::reader::utxo::UtxoSource;
use chainfold::reader::{ChainSource, ExtensionReader, Mapping, NetworkHandle};
use chainfold::store::tables::{self, CdeTable, Table};
use chainfold::store::{cursor, progress};
use chainfold::{IdleReason, SourceRegistry, Tick};
use common::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn user(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

fn count(ticks: &[Tick], presync: bool) -> usize {
    ticks
        .iter()
        .filter(|t| match t {
            Tick::Presync => presync,
            Tick::Block(_) => !presync,
            Tick::Idle(_) => false,
        })
        .count()
}

#[tokio::test]
async fn presync_covers_start_to_primary_start_once() {
    init_tracing();
    let (a, b, c) = (user(0xa1), user(0xb2), user(0xc3));
    let chain = FakeChain::new(103, 1_000, 12);
    let reader = ScriptedReader::new();
    reader.emit(0, 92, transfer(a, b, 5));
    reader.emit(0, 99, transfer(b, c, 2));
    reader.emit(0, 101, transfer(a, c, 1));

    let mut ext = erc20("gold", user(0xbb), 90);
    ext.scheduled_prefix = Some("gold".into());
    let mut config = node_config(100, vec![ext]);
    config.engine.presync_step = 4;
    let db = temp_db();
    let mut rt = runtime(&config, &db, &chain, primary_registry(&chain, &reader), Recorder::default()).unwrap();
    let ticks = drive(&mut rt).await;

    assert_eq!(count(&ticks, true), 3);
    assert_eq!(count(&ticks, false), 4);
    let ranges: Vec<(u64, u64)> = reader.calls_for(0).iter().map(|c| (c.from, c.to)).collect();
    assert_eq!(&ranges[..3], &[(90, 93), (94, 97), (98, 99)]);
    assert_eq!(&ranges[3..], &[(100, 100), (101, 101), (102, 102), (103, 103)]);

    let model = rt.read_model();
    let cur = cursor::load(&model, 0).unwrap().unwrap();
    assert!(cur.finished);
    assert_eq!(cur.last_position, Some(99));
    assert!(cur.paging.is_none());

    assert_eq!(tables::balance(&model, 0, &a).unwrap().to_string(), "-6");
    assert_eq!(tables::balance(&model, 0, &b).unwrap().to_string(), "3");
    assert_eq!(tables::balance(&model, 0, &c).unwrap().to_string(), "3");

    // Presync datums surface as scheduled inputs at the primary start.
    let scheduled: Vec<u64> = rt
        .stf()
        .seen
        .iter()
        .filter(|(_, d)| d.starts_with("gold|"))
        .map(|(h, _)| *h)
        .collect();
    assert_eq!(scheduled, vec![100, 100, 101]);

    // Later heights never go back to presync ranges.
    chain.set_tip(105);
    drive(&mut rt).await;
    assert!(reader.calls_for(0)[3..].iter().all(|c| c.from >= 100));
    assert_eq!(reader.calls_for(0).len(), 9);
}

#[tokio::test]
async fn paged_presync_persists_its_cursor() {
    init_tracing();
    let chain = FakeChain::new(12, 1_000, 12);
    let reader = ScriptedReader::paged(1);
    reader.emit(0, 3, transfer(user(1), user(2), 1));
    reader.emit(0, 4, transfer(user(1), user(2), 1));
    reader.emit(0, 8, transfer(user(1), user(2), 1));
    let config = node_config(10, vec![erc20("gold", user(0xbb), 0)]);
    let db = temp_db();
    let mut rt = runtime(&config, &db, &chain, primary_registry(&chain, &reader), Recorder::default()).unwrap();

    assert_eq!(rt.tick(None).await.unwrap(), Tick::Presync);
    let cur = cursor::load(&rt.read_model(), 0).unwrap().unwrap();
    let paging = cur.paging.expect("first page leaves a paging cursor");
    assert_eq!((paging.from, paging.to, paging.cursor.as_str()), (0, 9, "1"));
    assert!(!cur.finished);

    let ticks = drive(&mut rt).await;
    assert_eq!(count(&ticks, true), 2);
    let pages: Vec<Option<String>> = reader.calls_for(0).iter().take(3).map(|c| c.paging.clone()).collect();
    assert_eq!(pages, vec![None, Some("1".into()), Some("2".into())]);
    assert_eq!(tables::balance(&rt.read_model(), 0, &user(2)).unwrap().to_string(), "3");
}

fn factory(network: &str, start_height: u64) -> chainfold::ExtensionConfig {
    chainfold::ExtensionConfig {
        name: "factory".into(),
        network: network.into(),
        start_height,
        stop_height: None,
        scheduled_prefix: None,
        kind: ExtensionKind::DynamicPrimitive {
            contract: user(0xfa),
            event_signature: "Created(address)".into(),
            address_topic: Some(1),
            target: DynamicTarget::Erc20Transfer,
        },
    }
}

fn created(child: Address) -> DatumPayload {
    DatumPayload::DynamicPrimitive {
        contract: child,
        tx_hash: B256::repeat_byte(3),
        log_index: 0,
    }
}

#[tokio::test]
async fn dynamic_primitive_registers_extension_at_discovery_block() {
    init_tracing();
    let child = user(0x77);
    let (a, b) = (user(0xa1), user(0xb2));
    let chain = FakeChain::new(106, 1_000, 12);
    let reader = ScriptedReader::new();
    reader.emit(0, 103, created(child));
    // Later in the discovery block, then in a later block.
    reader.emit(1, 103, transfer(a, b, 9));
    reader.emit(1, 105, transfer(a, b, 4));

    let config = node_config(100, vec![factory(PRIMARY_NETWORK, 100)]);
    let db = temp_db();
    let mut rt = runtime(&config, &db, &chain, primary_registry(&chain, &reader), Recorder::default()).unwrap();
    let ticks = drive(&mut rt).await;

    let registered: Vec<u64> = ticks
        .iter()
        .filter_map(|t| match t {
            Tick::Block(r) if r.registered > 0 => Some(r.height),
            _ => None,
        })
        .collect();
    assert_eq!(registered, vec![103]);

    let model = rt.read_model();
    let row = tables::row(
        &model,
        &Table::cde(CdeTable::DynamicRegistrations, 0),
        &tables::address_key(&child),
    )
    .unwrap()
    .unwrap();
    assert_eq!(row["startHeight"], 103);
    assert_eq!(tables::balance(&model, 1, &b).unwrap().to_string(), "13");
    let child_reads: Vec<(u64, u64)> = reader.calls_for(1).iter().map(|c| (c.from, c.to)).collect();
    assert_eq!(child_reads, vec![(103, 103), (104, 104), (105, 105), (106, 106)]);
    assert!(cursor::backfills(&model).unwrap().is_empty());

    let pinned = chainfold::store::extensions::load_all(&model).unwrap();
    assert_eq!(pinned.len(), 2);
    assert!(pinned[1].dynamic);
    assert_eq!(pinned[1].config.start_height, 103);
}

#[tokio::test]
async fn child_found_in_presync_presyncs_from_its_discovery_block() {
    init_tracing();
    let child = user(0x77);
    let (a, b) = (user(0xa1), user(0xb2));
    let chain = FakeChain::new(102, 1_000, 12);
    let reader = ScriptedReader::new();
    reader.emit(0, 92, created(child));
    reader.emit(1, 95, transfer(a, b, 9));
    reader.emit(1, 101, transfer(a, b, 4));

    let mut config = node_config(100, vec![factory(PRIMARY_NETWORK, 90)]);
    config.engine.presync_step = 10;
    let db = temp_db();
    let mut rt = runtime(&config, &db, &chain, primary_registry(&chain, &reader), Recorder::default()).unwrap();
    let ticks = drive(&mut rt).await;
    assert_eq!(count(&ticks, true), 2);
    assert_eq!(count(&ticks, false), 3);

    let model = rt.read_model();
    let pinned = chainfold::store::extensions::load_all(&model).unwrap();
    assert_eq!(pinned[1].config.start_height, 92);
    let child_reads: Vec<(u64, u64)> = reader.calls_for(1).iter().map(|c| (c.from, c.to)).collect();
    assert_eq!(child_reads, vec![(92, 99), (100, 100), (101, 101), (102, 102)]);
    assert_eq!(tables::balance(&model, 1, &b).unwrap().to_string(), "13");
    assert!(cursor::load(&model, 1).unwrap().unwrap().finished);
}

/// Primary blocks every 10s from t=1000; side-chain blocks every 4s from t=1000.
fn timestamp_setup(side_tip: u64) -> (Arc<FakeChain>, Arc<FakeChain>, Arc<ScriptedReader>, SourceRegistry) {
    let primary = FakeChain::new(12, 1_000, 10);
    let side = FakeChain::new(side_tip, 1_000, 4);
    let reader = ScriptedReader::new();
    let registry = primary_registry(&primary, &reader).with(
        NetworkHandle::new(
            "side",
            Arc::clone(&side) as Arc<dyn ChainSource>,
            Mapping::Timestamp,
            ConfirmationPolicy::new(0, 0),
        )
        .with_reader(&KindTag::EVM, Arc::clone(&reader) as Arc<dyn ExtensionReader>),
    );
    (primary, side, reader, registry)
}

fn side_config() -> chainfold::NodeConfig {
    let mut ext = erc20("bridge", user(0xbb), 0);
    ext.network = "side".into();
    let mut config = node_config(10, vec![ext]);
    config.networks.insert("side".into(), evm_network());
    config
}

#[tokio::test]
async fn timestamp_mapping_assigns_side_blocks_to_primary_heights() {
    init_tracing();
    let (primary, _side, reader, registry) = timestamp_setup(1_000);
    reader.emit(0, 5, transfer(user(1), user(2), 1));
    reader.emit(0, 24, transfer(user(1), user(2), 2));
    reader.emit(0, 27, transfer(user(1), user(2), 4));
    let db = temp_db();
    let mut rt = runtime(&side_config(), &db, &primary, registry, Recorder::default()).unwrap();
    drive(&mut rt).await;

    // ts(9) = 1090 puts side blocks 0..=22 in presync; each height then covers
    // the side blocks with timestamps up to its own.
    let ranges: Vec<(u64, u64)> = reader.calls_for(0).iter().map(|c| (c.from, c.to)).collect();
    assert_eq!(ranges, vec![(0, 22), (23, 25), (26, 27), (28, 30)]);
    let model = rt.read_model();
    assert_eq!(cursor::network_position(&model, "side").unwrap(), Some(31));
    assert_eq!(tables::balance(&model, 0, &user(2)).unwrap().to_string(), "7");
}

#[tokio::test]
async fn unconfirmed_side_chain_holds_the_primary_height() {
    init_tracing();
    let (primary, side, _reader, registry) = timestamp_setup(25);
    let db = temp_db();
    let mut rt = runtime(&side_config(), &db, &primary, registry, Recorder::default()).unwrap();

    assert_eq!(rt.tick(None).await.unwrap(), Tick::Presync);
    // Side block 25 has ts == ts(10); without a newer confirmed block the range may still grow.
    assert_eq!(rt.tick(None).await.unwrap(), Tick::Idle(IdleReason::NotConfirmed));
    assert_eq!(progress::last_processed(&rt.read_model()).unwrap(), None);

    side.set_tip(26);
    assert!(matches!(rt.tick(None).await.unwrap(), Tick::Block(r) if r.height == 10));
}

#[tokio::test]
async fn slot_mapping_reads_paginated_utxo_source() {
    init_tracing();
    let slots = SlotConfig {
        zero_time: 0,
        zero_slot: 0,
        slot_length_secs: 1,
    };
    let delegation = |address: &str, pool: Option<&str>| DatumPayload::Delegation {
        address: address.into(),
        pool: pool.map(str::to_string),
    };
    let source = FakeUtxoSource::new(2_000, 1);
    source.push(1085, delegation("stake1", Some("pool-a")));
    source.push(1088, delegation("stake2", Some("pool-x")));
    source.push(1095, delegation("stake1", None));
    source.push(1105, delegation("stake3", Some("pool-b")));

    let mut ext = erc20("stake", user(0), 1080);
    ext.network = "cardano".into();
    ext.kind = ExtensionKind::UtxoDelegation { pools: vec![] };
    let mut config = node_config(10, vec![ext]);
    config.networks.insert("cardano".into(), utxo_network(slots));

    let primary = FakeChain::new(11, 1_000, 10);
    let rpc = Arc::new(EvmRpc::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap());
    let mut sources: BTreeMap<String, Arc<dyn UtxoSource>> = BTreeMap::new();
    sources.insert("cardano".into(), Arc::clone(&source) as Arc<dyn UtxoSource>);
    let registry = SourceRegistry::from_config(&config, rpc, &sources).unwrap();
    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["cardano", PRIMARY_NETWORK]);

    let db = temp_db();
    let mut rt = runtime(&config, &db, &primary, registry, Recorder::default()).unwrap();
    let ticks = drive(&mut rt).await;
    assert_eq!(count(&ticks, true), 2);
    assert_eq!(count(&ticks, false), 2);

    let fetches = source.fetches.lock().unwrap().clone();
    assert_eq!(
        fetches,
        vec![
            (1080, 1090, None),
            (1080, 1090, Some("1".to_string())),
            (1091, 1100, None),
            (1101, 1110, None),
        ]
    );

    let model = rt.read_model();
    let table = Table::cde(CdeTable::Delegations, 0);
    let rows = tables::rows(&model, &table).unwrap();
    let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["stake2", "stake3"]);
    assert_eq!(rows[1].1["pool"], "pool-b");
    assert_eq!(cursor::network_position(&model, "cardano").unwrap(), Some(1111));
    let cur = cursor::load(&model, 0).unwrap().unwrap();
    assert_eq!((cur.finished, cur.last_position), (true, Some(1090)));
}

#[tokio::test]
async fn child_found_on_side_chain_reads_rest_of_mapped_range() {
    init_tracing();
    let child = user(0x77);
    let (a, b) = (user(0xa1), user(0xb2));
    let (primary, _side, reader, registry) = timestamp_setup(1_000);
    // Height 10 covers side blocks 23..=25, height 11 covers 26..=27.
    reader.emit(0, 23, created(child));
    reader.emit(1, 24, transfer(a, b, 9));
    reader.emit(1, 27, transfer(a, b, 4));

    let mut config = node_config(10, vec![factory("side", 0)]);
    config.networks.insert("side".into(), evm_network());
    let db = temp_db();
    let mut rt = runtime(&config, &db, &primary, registry, Recorder::default()).unwrap();
    drive(&mut rt).await;

    let model = rt.read_model();
    let pinned = chainfold::store::extensions::load_all(&model).unwrap();
    assert_eq!((pinned[1].network(), pinned[1].config.start_height), ("side", 23));
    let child_reads: Vec<(u64, u64)> = reader.calls_for(1).iter().map(|c| (c.from, c.to)).collect();
    assert_eq!(child_reads, vec![(23, 25), (26, 27), (28, 30)]);
    assert_eq!(tables::balance(&model, 1, &b).unwrap().to_string(), "13");
    assert!(cursor::backfills(&model).unwrap().is_empty());
}
