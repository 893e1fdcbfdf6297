//! End-to-end flows: a coordinator wired to the in-memory bus and the
//! simulated gateway, driven by real wire messages.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use slicer::gateway::SimGateway;
use slicer::persistence::SnapshotStore;
use slicer::report::NoopReportSink;
use slicer::{AppConfig, Bus, Coordinator, InMemoryBus, Task};

static SEQ: AtomicU64 = AtomicU64::new(0);

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.timer_interval_secs = 1;
    let n = SEQ.fetch_add(1, Ordering::SeqCst);
    cfg.orders_dir = std::env::temp_dir()
        .join(format!("slicer-itest-{}-{n}", std::process::id()))
        .to_string_lossy()
        .into_owned();
    cfg
}

fn twap_task(task_id: &str) -> Task {
    let entry = json!({
        "algorithm": "TWAP",
        "exchange": "Binance",
        "account": "trader1",
        "symbol": ["BTCUSDT", "BTC", "USDT"],
        "direction": "Sell",
        "currency_type": "Base",
        "total_size": 10,
        "price_threshold": null,
        "execution_mode": "Passive",
        "exchange_fee": 0.001,
        "fixed_interval_ms": 500,
        "random_interval_ms": 0
    });
    let mut strategies = serde_json::Map::new();
    strategies.insert(task_id.to_string(), entry);
    let raw = json!({
        "task_id": task_id,
        "initial_balance": {
            "Binance|trader1": { "BTC": 100, "USDT": 0 }
        },
        "strategies": strategies,
        "start_time": "2019-06-28 00:00:00",
        "end_time": "2030-01-01 00:00:00",
        "coin_config": {
            "Binance": {
                "BTCUSDT": {
                    "base_min_order_size": 0.01,
                    "quote_min_order_size": 0,
                    "price_precision": 0.01,
                    "size_precision": 0.001
                }
            }
        },
        "trade_role": "Taker",
        "customer_id": "itest",
        "alarm": true,
        "test_mode": true
    });
    serde_json::from_value(raw).expect("task json")
}

fn orderbook_payload() -> String {
    let now = chrono::Local::now().format("%Y%m%d%H%M%S%3f").to_string();
    json!({
        "exchange": "Binance",
        "symbol": "BTCUSDT",
        "contract_type": "spot",
        "data_type": "orderbook",
        "metadata": {
            "bids": [[99.99, 5.0], [99.98, 8.0]],
            "asks": [[100.01, 5.0], [100.02, 8.0]],
            "timestamp": now
        },
        "timestamp": now
    })
    .to_string()
}

fn spawn_coordinator(cfg: &Arc<AppConfig>, bus: &Arc<dyn Bus>, task: Task) -> tokio::task::JoinHandle<()> {
    let coordinator = Coordinator::new(
        cfg.clone(),
        task,
        SnapshotStore::new(&cfg.orders_dir),
        Box::new(NoopReportSink),
        None,
    );
    let bus = bus.clone();
    tokio::spawn(async move {
        let _ = coordinator.run(bus).await;
    })
}

async fn expect_message<F>(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<slicer::BusMessage>,
    deadline: Duration,
    mut predicate: F,
) -> Option<Value>
where
    F: FnMut(&str, &Value) -> bool,
{
    let wait = async {
        while let Some(msg) = rx.recv().await {
            if let Ok(value) = serde_json::from_str::<Value>(&msg.payload) {
                if predicate(&msg.channel, &value) {
                    return Some(value);
                }
            }
        }
        None
    };
    timeout(deadline, wait).await.ok().flatten()
}

#[tokio::test]
async fn twap_places_orders_through_the_sim_gateway() {
    let cfg = Arc::new(test_config());
    let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());

    // observe the trade request channel before anything publishes
    let mut requests = bus
        .subscribe(&["TestTd:slicer_execution_request".to_string()])
        .await
        .unwrap();

    let gateway = SimGateway::new(cfg.clone());
    {
        let bus = bus.clone();
        tokio::spawn(async move {
            let _ = gateway.run(bus).await;
        });
    }
    let _coordinator = spawn_coordinator(&cfg, &bus, twap_task("TWAP_Binance_BTCUSDT_20190725152929"));

    // feed the book until the first slice goes out
    let feeder = {
        let bus = bus.clone();
        tokio::spawn(async move {
            for _ in 0..60 {
                let _ = bus
                    .publish("Md:Binance|BTCUSDT|spot|orderbook|20", orderbook_payload())
                    .await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
    };

    let placed = expect_message(&mut requests, Duration::from_secs(12), |_, value| {
        value.get("action").and_then(Value::as_str) == Some("place_order")
    })
    .await
    .expect("a place_order request should reach the gateway");
    assert_eq!(
        placed.pointer("/metadata/direction").and_then(Value::as_str),
        Some("Sell")
    );
    assert!(placed
        .get("ref_id")
        .and_then(Value::as_str)
        .map(|r| r.contains('_'))
        .unwrap_or(false));
    feeder.abort();
}

#[tokio::test]
async fn pause_and_resume_answer_with_correlated_responses() {
    let cfg = Arc::new(test_config());
    let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
    let mut responses = bus
        .subscribe(&[cfg.channels.task_command_response.clone()])
        .await
        .unwrap();

    let task_id = "TWAP_Binance_BTCUSDT_20190725152930";
    let _coordinator = spawn_coordinator(&cfg, &bus, twap_task(task_id));
    tokio::time::sleep(Duration::from_millis(300)).await;

    bus.publish(
        &cfg.channels.task_command,
        json!({ "type": "pause", "task_id": task_id, "client_id": 42 }).to_string(),
    )
    .await
    .unwrap();

    let paused = expect_message(&mut responses, Duration::from_secs(5), |_, value| {
        value.get("type").and_then(Value::as_str) == Some("pause")
    })
    .await
    .expect("pause should be answered");
    assert_eq!(paused.get("client_id"), Some(&json!(42)));
    assert_eq!(paused.get("result"), Some(&json!(true)));
    assert_eq!(paused.get("status").and_then(Value::as_str), Some("paused"));

    bus.publish(
        &cfg.channels.task_command,
        json!({ "type": "resume", "task_id": task_id, "client_id": 43 }).to_string(),
    )
    .await
    .unwrap();
    let resumed = expect_message(&mut responses, Duration::from_secs(5), |_, value| {
        value.get("type").and_then(Value::as_str) == Some("resume")
    })
    .await
    .expect("resume should be answered");
    assert_eq!(resumed.get("status").and_then(Value::as_str), Some("running"));

    // a command for some other task must not be answered
    bus.publish(
        &cfg.channels.task_command,
        json!({ "type": "pause", "task_id": "SOMEONE_ELSE", "client_id": 44 }).to_string(),
    )
    .await
    .unwrap();
    let foreign = expect_message(&mut responses, Duration::from_secs(2), |_, value| {
        value.get("client_id") == Some(&json!(44))
    })
    .await;
    assert!(foreign.is_none());
}

#[tokio::test]
async fn delete_without_open_orders_shuts_the_task_down() {
    let cfg = Arc::new(test_config());
    let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
    let mut responses = bus
        .subscribe(&[cfg.channels.task_command_response.clone()])
        .await
        .unwrap();

    let task_id = "TWAP_Binance_BTCUSDT_20190725152931";
    let coordinator = spawn_coordinator(&cfg, &bus, twap_task(task_id));
    tokio::time::sleep(Duration::from_millis(300)).await;

    bus.publish(
        &cfg.channels.task_command,
        json!({
            "type": "delete",
            "task_id": task_id,
            "client_id": 7,
            "force_delete": false
        })
        .to_string(),
    )
    .await
    .unwrap();

    let deleted = expect_message(&mut responses, Duration::from_secs(5), |_, value| {
        value.get("type").and_then(Value::as_str) == Some("delete")
    })
    .await
    .expect("delete should be answered");
    assert_eq!(deleted.get("result"), Some(&json!(true)));
    assert_eq!(deleted.get("status").and_then(Value::as_str), Some("deleted"));

    // the coordinator flushes and exits
    timeout(Duration::from_secs(5), coordinator)
        .await
        .expect("coordinator should exit after delete")
        .unwrap();

    // the order snapshot survives for the order query service
    let store = SnapshotStore::new(&cfg.orders_dir);
    assert!(store.exists(task_id));
}
