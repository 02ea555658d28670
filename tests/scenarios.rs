//! End-to-end scenarios from the testable-properties section, driven
//! against a real HTTP server bound to an ephemeral port and an
//! in-memory `MockAdapter`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hivebot::connector::Connector;
use hivebot::exchange::mock::MockAdapter;
use hivebot::http::{self, AppState};
use hivebot::mirror::RemoteMirror;
use hivebot::reconciler::Reconciler;
use hivebot::registry::Registry;
use hivebot::store::ConfigStore;

use serde_json::json;

struct Harness {
    base_url: String,
    client: reqwest::Client,
    connector: Arc<Connector<MockAdapter>>,
    adapter: Arc<MockAdapter>,
    _shutdown_tx: tokio::sync::watch::Sender<bool>,
}

async fn spawn_harness() -> Harness {
    let mirror = RemoteMirror::disabled();
    let tmp = tempfile_path();
    let store = Arc::new(ConfigStore::open(tmp, mirror.clone()).await.unwrap());

    let adapter = Arc::new(MockAdapter::new());
    let connector = Arc::new(Connector::new(adapter.clone()));

    let registry = Arc::new(Registry::new("test-instance".to_string(), store, connector.clone(), mirror.clone()));
    let reconciler = Arc::new(Reconciler::new("test-instance".to_string(), connector.clone(), registry.clone(), mirror.clone()));

    let state = Arc::new(AppState {
        instance_id: "test-instance".to_string(),
        registry,
        reconciler,
        connector: connector.clone(),
        mirror,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let addr_for_server: SocketAddr = addr;
    tokio::spawn(http::serve(state, addr_for_server, shutdown_rx));

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        connector,
        adapter,
        _shutdown_tx: shutdown_tx,
    }
}

fn tempfile_path() -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("hive_test_{}_{}.json", std::process::id(), uuid::Uuid::new_v4()));
    p
}

fn pmm_body(name: &str, pairs: &[&str], refresh_ms: u64) -> serde_json::Value {
    json!({
        "name": name,
        "kind": "pure_market_making",
        "trading_pairs": pairs,
        "refresh_interval_ms": refresh_ms,
        "parameters": {
            "bid_spread": 0.002,
            "ask_spread": 0.002,
            "order_amount": 0.001,
            "order_levels": 1,
            "leverage": 1,
        },
        "enabled": true,
    })
}

#[tokio::test]
async fn scenario_1_hot_add() {
    let h = spawn_harness().await;

    let resp = h
        .client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("btc_mm", &["BTC-USD"], 200))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let list = h.client.get(format!("{}/api/strategies", h.base_url)).send().await.unwrap();
    let body: serde_json::Value = list.json().await.unwrap();
    let strategies = body["strategies"].as_array().unwrap();
    assert!(strategies.iter().any(|s| s["name"] == "btc_mm"));

    let status = h.client.get(format!("{}/api/status", h.base_url)).send().await.unwrap();
    let status: serde_json::Value = status.json().await.unwrap();
    assert_eq!(status["strategies"]["running"], 1);

    assert!(h.adapter.subscription_count(&hivebot::config::TradingPair::new("BTC-USD")));
}

#[tokio::test]
async fn scenario_2_hot_update_with_restart() {
    let h = spawn_harness().await;

    h.client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("btc_mm", &["BTC-USD"], 200))
        .send()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut updated = pmm_body("btc_mm", &["BTC-USD"], 200);
    updated["kind"] = json!("avellaneda_market_making");
    updated["parameters"] = json!({
        "order_amount": 0.001,
        "risk_aversion": 0.1,
        "order_book_depth": 5,
        "leverage": 1,
    });

    let resp = h
        .client
        .put(format!("{}/api/strategies/btc_mm", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&updated)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let open = h.connector.open_orders().await.unwrap();
    assert!(open.iter().all(|o| o.state.is_terminal() || !o.client_id.as_deref().unwrap_or("").starts_with("btc_mm-")));

    let list = h.client.get(format!("{}/api/strategies", h.base_url)).send().await.unwrap();
    let body: serde_json::Value = list.json().await.unwrap();
    let strategies = body["strategies"].as_array().unwrap();
    let btc = strategies.iter().find(|s| s["name"] == "btc_mm").unwrap();
    assert_eq!(btc["status"], "running");
}

#[tokio::test]
async fn scenario_3_delete_with_cleanup() {
    let h = spawn_harness().await;

    h.client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("btc_mm", &["BTC-USD"], 200))
        .send()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    // A position attributed to `btc_mm` must still be closeable: the
    // handler has to force-close it before the registry removes the
    // instance, or attribution would fall through to `Unknown`.
    h.adapter.set_position(hivebot::exchange::ExchangePosition {
        trading_pair: hivebot::config::TradingPair::new("BTC-USD"),
        side: hivebot::exchange::PositionSide::Long,
        size: 2.0,
        entry_price: 1.0,
        mark_price: 1.0,
        unrealized_pnl: 0.0,
        leverage: 1,
    });

    let resp = h
        .client
        .delete(format!(
            "{}/api/strategies/btc_mm?close_positions=true&cancel_orders=true",
            h.base_url
        ))
        .header("X-Wallet-Address", "0xabc")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["cleanup"]["positions_closed"], 1);

    assert!(!h.adapter.subscription_count(&hivebot::config::TradingPair::new("BTC-USD")));

    let list = h.client.get(format!("{}/api/strategies", h.base_url)).send().await.unwrap();
    let body: serde_json::Value = list.json().await.unwrap();
    assert!(body["strategies"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn scenario_3b_delete_without_cancel_preserves_orders() {
    let h = spawn_harness().await;

    h.client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("btc_mm", &["BTC-USD"], 120))
        .send()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let before = h.connector.open_orders().await.unwrap();
    assert_eq!(before.len(), 2);

    let resp = h
        .client
        .delete(format!("{}/api/strategies/btc_mm?cancel_orders=false", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["cleanup"]["orders_cancelled"], 0);

    let after = h.connector.open_orders().await.unwrap();
    assert_eq!(after.len(), 2, "cancel_orders=false must leave live orders untouched");
}

#[tokio::test]
async fn scenario_hot_reload_parameters_without_restart() {
    let h = spawn_harness().await;

    h.client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("btc_mm", &["BTC-USD"], 120))
        .send()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let open = h.connector.open_orders().await.unwrap();
    let initial_bid = open
        .iter()
        .find(|o| o.side == hivebot::exchange::Side::Buy)
        .expect("initial bid order")
        .price;
    assert!((initial_bid - 0.998).abs() < 1e-9);

    let mut updated = pmm_body("btc_mm", &["BTC-USD"], 120);
    updated["parameters"]["bid_spread"] = json!(0.05);
    updated["parameters"]["ask_spread"] = json!(0.05);

    let resp = h
        .client
        .put(format!("{}/api/strategies/btc_mm", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&updated)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    // No restart for a parameter-only change: the instance never leaves `running`.
    assert_eq!(body["status"], "running");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let open = h.connector.open_orders().await.unwrap();
    let new_bid = open
        .iter()
        .find(|o| o.side == hivebot::exchange::Side::Buy)
        .expect("requoted bid order")
        .price;
    assert!(
        (new_bid - 0.95).abs() < 1e-9,
        "live strategy should pick up the new bid_spread without a restart, got {new_bid}"
    );
}

#[tokio::test]
async fn scenario_4_adapter_outage_does_not_stop_strategy() {
    let h = spawn_harness().await;

    h.client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("btc_mm", &["BTC-USD"], 120))
        .send()
        .await
        .unwrap();

    h.adapter.reject_next_order();
    h.adapter.reject_next_order();
    h.adapter.reject_next_order();

    tokio::time::sleep(Duration::from_millis(700)).await;

    let list = h.client.get(format!("{}/api/strategies", h.base_url)).send().await.unwrap();
    let body: serde_json::Value = list.json().await.unwrap();
    let strategies = body["strategies"].as_array().unwrap();
    let btc = strategies.iter().find(|s| s["name"] == "btc_mm").unwrap();
    assert_ne!(btc["status"], "stopped");
    assert!(btc["failed_orders"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn scenario_5_overlapping_pair_subscriptions() {
    let h = spawn_harness().await;

    h.client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("btc_mm", &["BTC-USD"], 5000))
        .send()
        .await
        .unwrap();
    h.client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("btc_avellaneda", &["BTC-USD"], 5000))
        .send()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.adapter.subscription_count(&hivebot::config::TradingPair::new("BTC-USD")));

    h.client
        .delete(format!("{}/api/strategies/btc_mm?cancel_orders=true", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .send()
        .await
        .unwrap();
    assert!(h.adapter.subscription_count(&hivebot::config::TradingPair::new("BTC-USD")));

    h.client
        .delete(format!("{}/api/strategies/btc_avellaneda?cancel_orders=true", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .send()
        .await
        .unwrap();
    assert!(!h.adapter.subscription_count(&hivebot::config::TradingPair::new("BTC-USD")));
}

#[tokio::test]
async fn scenario_6_order_ownership() {
    let h = spawn_harness().await;

    h.client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("eth_mm", &["ETH-USD"], 150))
        .send()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let open = h.connector.open_orders().await.unwrap();
    let order = open
        .iter()
        .find(|o| o.client_id.as_deref().unwrap_or("").starts_with("eth_mm-eth_usd-"))
        .expect("eth_mm should have an open order");

    h.adapter.fill_order(&order.exchange_id, order.amount);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let list = h.client.get(format!("{}/api/strategies", h.base_url)).send().await.unwrap();
    let body: serde_json::Value = list.json().await.unwrap();
    let strategies = body["strategies"].as_array().unwrap();
    let eth = strategies.iter().find(|s| s["name"] == "eth_mm").unwrap();
    assert!(eth["successful_orders"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn boundary_refresh_interval_floor() {
    let h = spawn_harness().await;

    let resp = h
        .client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("floor_ok", &["BTC-USD"], 100))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = h
        .client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("floor_bad", &["BTC-USD"], 50))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn boundary_zero_pairs_rejected() {
    let h = spawn_harness().await;

    let empty: [&str; 0] = [];
    let resp = h
        .client
        .post(format!("{}/api/strategies", h.base_url))
        .header("X-Wallet-Address", "0xabc")
        .json(&pmm_body("no_pairs", &empty, 1000))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn missing_wallet_header_rejected() {
    let h = spawn_harness().await;

    let resp = h
        .client
        .post(format!("{}/api/strategies", h.base_url))
        .json(&pmm_body("no_wallet", &["BTC-USD"], 1000))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}
