//! Subscription Routing Integration Tests
//!
//! Deduplication, routing of data frames to symbol sets, rejection handling,
//! unsubscribe, and consumer fault isolation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use quote_stream_engine::domain::fanout::DeliveryPolicy;
use quote_stream_engine::{
    ConsumerError, Interval, StreamEngine, SubscriptionError, SubscriptionStatus, SymbolKey,
};
use serde_json::json;

use common::{MockServer, Recorder, ServerConn, eventually, mock_server, test_config};

async fn started_engine() -> (StreamEngine, MockServer, ServerConn) {
    let (connector, mut server) = mock_server();
    let engine = StreamEngine::new(test_config(), connector);
    let (started, conn) = tokio::join!(engine.start(), server.accept_ready());
    started.unwrap();
    (engine, server, conn)
}

#[tokio::test]
async fn duplicate_subscribe_shares_one_session() {
    let (engine, _server, mut conn) = started_engine().await;

    let first = engine
        .create_symbol_set("BTCUSD", "BINANCE", Interval::Minute1)
        .unwrap();
    let second = engine
        .create_symbol_set("BTCUSD", "BINANCE", Interval::Minute1)
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    conn.expect_session().await;
    conn.expect_silence(Duration::from_millis(100)).await;
    assert_eq!(engine.stats().symbol_sets, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn resolve_descriptor_names_exchange_and_symbol() {
    let (engine, _server, mut conn) = started_engine().await;

    engine
        .create_symbol_set("AAPL", "NASDAQ", Interval::Minute5)
        .unwrap();

    let create = conn.expect("chart_create_session").await;
    let session = create[0].as_str().unwrap().to_string();
    assert!(session.starts_with("cs_"));
    assert_eq!(session.len(), 15);

    let resolve = conn.expect("resolve_symbol").await;
    let descriptor = resolve[2].as_str().unwrap();
    let descriptor: serde_json::Value =
        serde_json::from_str(descriptor.strip_prefix('=').unwrap()).unwrap();
    assert_eq!(descriptor["symbol"], "NASDAQ:AAPL");

    let series = conn.expect("create_series").await;
    assert_eq!(series[4], "5");
    assert_eq!(series[5], 300);

    engine.shutdown().await;
}

#[tokio::test]
async fn data_is_routed_to_the_matching_symbol_set() {
    let (engine, _server, mut conn) = started_engine().await;

    let btc = engine
        .create_symbol_set("BTCUSD", "BINANCE", Interval::Minute1)
        .unwrap();
    let btc_session = conn.expect_session().await;
    let eth = engine
        .create_symbol_set("ETHUSD", "BINANCE", Interval::Minute1)
        .unwrap();
    let eth_session = conn.expect_session().await;

    let btc_rec = Arc::new(Recorder::default());
    let eth_rec = Arc::new(Recorder::default());
    btc.create_consumer(btc_rec.clone());
    eth.create_consumer(eth_rec.clone());

    conn.confirm(&btc_session);
    conn.send_bar(&btc_session, 1_700_000_000, 100.5);
    conn.send_bar(&eth_session, 1_700_000_000, 20.5);
    conn.send_bar(&btc_session, 1_700_000_060, 101.5);

    eventually("btc updates", || btc_rec.updates().len() == 2).await;
    eventually("eth updates", || eth_rec.updates().len() == 1).await;

    assert_eq!(btc_rec.closes(), vec!["100.5", "101.5"]);
    assert_eq!(eth_rec.closes(), vec!["20.5"]);
    assert_eq!(btc_rec.updates()[0].key, *btc.key());
    assert_eq!(btc.status(), SubscriptionStatus::Active);
    assert_eq!(eth.status(), SubscriptionStatus::Active, "data implies activation");

    engine.shutdown().await;
}

#[tokio::test]
async fn data_for_unknown_session_is_dropped_and_counted() {
    let (engine, _server, conn) = started_engine().await;

    let set = engine
        .create_symbol_set("BTCUSD", "BINANCE", Interval::Minute1)
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    set.create_consumer(recorder.clone());

    conn.send_bar("cs_nobodyhome", 1_700_000_000, 1.5);

    eventually("drop counted", || engine.stats().frames_dropped == 1).await;
    assert!(recorder.updates().is_empty());
    assert!(engine.state().is_connected());

    engine.shutdown().await;
}

#[tokio::test]
async fn symbol_error_fails_only_that_subscription() {
    let (engine, _server, mut conn) = started_engine().await;

    let bad = engine
        .create_symbol_set("NOPE", "NOWHERE", Interval::Daily)
        .unwrap();
    let bad_session = conn.expect_session().await;
    let good = engine
        .create_symbol_set("BTCUSD", "BINANCE", Interval::Minute1)
        .unwrap();
    let good_session = conn.expect_session().await;

    let bad_rec = Arc::new(Recorder::default());
    let good_rec = Arc::new(Recorder::default());
    bad.create_consumer(bad_rec.clone());
    good.create_consumer(good_rec.clone());

    conn.send_message(
        "symbol_error",
        &json!([bad_session, "sds_sym_1", "invalid symbol"]),
    );

    eventually("rejection delivered", || bad_rec.errors().len() == 1).await;
    match &bad_rec.errors()[0] {
        SubscriptionError::Rejected { key, reason } => {
            assert_eq!(key, bad.key());
            assert_eq!(reason, "invalid symbol");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(bad.status(), SubscriptionStatus::Failed);

    // Late data for the failed session goes nowhere.
    conn.send_bar(&bad_session, 1_700_000_000, 5.5);
    conn.send_bar(&good_session, 1_700_000_000, 6.5);
    eventually("good update", || good_rec.updates().len() == 1).await;
    assert!(bad_rec.updates().is_empty());
    assert!(good_rec.errors().is_empty());
    assert!(engine.state().is_connected());
    assert_eq!(engine.stats().rejections, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn resubscribing_a_failed_key_opens_a_new_session() {
    let (engine, _server, mut conn) = started_engine().await;

    let set = engine
        .create_symbol_set("NOPE", "NOWHERE", Interval::Daily)
        .unwrap();
    let first = conn.expect_session().await;
    conn.send_message("series_error", &json!([first, "sds_1", "no data"]));
    eventually("failed", || set.status() == SubscriptionStatus::Failed).await;

    let again = engine
        .create_symbol_set("NOPE", "NOWHERE", Interval::Daily)
        .unwrap();

    assert!(Arc::ptr_eq(&set, &again));
    // The rejected session is deleted before its replacement opens
    let delete = conn.expect("chart_delete_session").await;
    assert_eq!(delete[0], first.as_str());
    let second = conn.expect_session().await;
    assert_ne!(first, second);
    assert_eq!(again.status(), SubscriptionStatus::Pending);

    engine.shutdown().await;
}

#[tokio::test]
async fn removing_a_failed_set_deletes_the_rejected_session() {
    let (engine, _server, mut conn) = started_engine().await;

    let set = engine
        .create_symbol_set("NOPE", "NOWHERE", Interval::Daily)
        .unwrap();
    let session = conn.expect_session().await;
    conn.send_message("symbol_error", &json!([session, "sds_sym_1", "invalid symbol"]));
    eventually("failed", || set.status() == SubscriptionStatus::Failed).await;

    assert!(engine.remove_symbol_set(&set));
    let delete = conn.expect("chart_delete_session").await;
    assert_eq!(delete[0], session.as_str());
    assert_eq!(set.status(), SubscriptionStatus::Released);

    engine.shutdown().await;
}

#[tokio::test]
async fn last_remove_deletes_the_session_and_closes_consumers() {
    let (engine, _server, mut conn) = started_engine().await;

    let first = engine
        .create_symbol_set("BTCUSD", "BINANCE", Interval::Minute1)
        .unwrap();
    let second = engine
        .create_symbol_set("BTCUSD", "BINANCE", Interval::Minute1)
        .unwrap();
    let session = conn.expect_session().await;
    let recorder = Arc::new(Recorder::default());
    first.create_consumer(recorder.clone());

    assert!(engine.remove_symbol_set(&first));
    conn.expect_silence(Duration::from_millis(50)).await;
    assert!(!recorder.is_closed(), "one holder remains");

    assert!(engine.remove_symbol_set(&second));
    let delete = conn.expect("chart_delete_session").await;
    assert_eq!(delete[0], session.as_str());
    assert!(recorder.is_closed());
    assert_eq!(second.status(), SubscriptionStatus::Released);

    assert!(!engine.remove_symbol_set(&second), "already released");
    assert!(
        engine
            .symbol_set(&SymbolKey::new("BTCUSD", "BINANCE", Interval::Minute1))
            .is_none()
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn failing_consumer_does_not_block_delivery() {
    let (engine, _server, mut conn) = started_engine().await;
    let mut faults = engine.faults();

    let set = engine
        .create_symbol_set("BTCUSD", "BINANCE", Interval::Minute1)
        .unwrap();
    let session = conn.expect_session().await;

    let flaky = Arc::new(Recorder::failing_once());
    let steady = Arc::new(Recorder::default());
    let flaky_handle = set.create_consumer(flaky.clone());
    set.create_consumer(steady.clone());

    conn.send_bar(&session, 1_700_000_000, 10.5);
    conn.send_bar(&session, 1_700_000_060, 11.5);

    eventually("both updates to steady", || steady.updates().len() == 2).await;
    eventually("both updates to flaky", || flaky.updates().len() == 2).await;
    assert_eq!(steady.closes(), vec!["10.5", "11.5"]);

    let fault = tokio::time::timeout(Duration::from_secs(1), faults.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fault.consumer, flaky_handle);
    assert_eq!(fault.key, *set.key());
    assert!(matches!(*fault.error, ConsumerError::Failed(_)));
    assert_eq!(engine.stats().consumer_faults, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn panicking_consumer_is_isolated() {
    let (engine, _server, mut conn) = started_engine().await;

    let set = engine
        .create_symbol_set("BTCUSD", "BINANCE", Interval::Minute1)
        .unwrap();
    let session = conn.expect_session().await;

    set.create_consumer_fn(|_| panic!("consumer bug"));
    let steady = Arc::new(Recorder::default());
    set.create_consumer(steady.clone());

    conn.send_bar(&session, 1_700_000_000, 10.5);
    conn.send_bar(&session, 1_700_000_060, 11.5);

    eventually("steady updates", || steady.updates().len() == 2).await;
    eventually("faults counted", || engine.stats().consumer_faults == 2).await;
    assert!(engine.state().is_connected());

    engine.shutdown().await;
}

#[tokio::test]
async fn closed_bars_only_emits_each_bar_once_it_closes() {
    let (engine, _server, mut conn) = started_engine().await;

    let set = engine
        .create_symbol_set_with(
            SymbolKey::new("BTCUSD", "BINANCE", Interval::Minute1),
            DeliveryPolicy::ClosedBarsOnly,
        )
        .unwrap();
    let session = conn.expect_session().await;
    let recorder = Arc::new(Recorder::default());
    set.create_consumer(recorder.clone());

    conn.send_bar(&session, 1_700_000_000, 10.5);
    conn.send_bar(&session, 1_700_000_000, 10.75);
    conn.send_bar(&session, 1_700_000_060, 11.5);

    eventually("closed bar", || recorder.updates().len() == 1).await;
    conn.expect_silence(Duration::from_millis(50)).await;
    assert_eq!(recorder.closes(), vec!["10.75"]);

    engine.shutdown().await;
}
