use modguard::core::bus::{self, BusConfig, DeliveryMode, DeliveryState, EventBus, Listener};
use modguard::core::descriptor::DescriptorStore;
use modguard::core::error::ModguardError;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

fn fixture_store(root: &Path) -> DescriptorStore {
    let orders = root.join("Orders");
    fs::create_dir_all(&orders).expect("orders dir");
    fs::write(
        orders.join("module.toml"),
        "[module]\nname = \"Orders\"\nexported_events = [\"OrderPlaced\"]\n",
    )
    .expect("orders descriptor");
    let shipping = root.join("Shipping");
    fs::create_dir_all(&shipping).expect("shipping dir");
    fs::write(
        shipping.join("module.toml"),
        "[module]\nname = \"Shipping\"\n",
    )
    .expect("shipping descriptor");
    let notifications = root.join("Notifications");
    fs::create_dir_all(&notifications).expect("notifications dir");
    fs::write(
        notifications.join("module.toml"),
        "[module]\nname = \"Notifications\"\n",
    )
    .expect("notifications descriptor");
    DescriptorStore::load(root).expect("store")
}

fn recording_listener(log: Arc<Mutex<Vec<String>>>, tag: &str) -> Listener {
    let tag = tag.to_string();
    Arc::new(move |event| {
        log.lock().unwrap().push(format!("{}:{}", tag, event.event_type));
        Ok(())
    })
}

fn fast_config(max_attempts: u32) -> BusConfig {
    BusConfig {
        max_attempts,
        lease_secs: 30,
        backoff_base_secs: 0,
    }
}

#[test]
fn publish_runs_inline_in_registration_order_and_persists_queued_rows() {
    let tmp = tempdir().expect("tempdir");
    let store = fixture_store(tmp.path());
    let bus = EventBus::open(tmp.path(), &store, fast_config(5)).expect("bus");

    let log = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("OrderPlaced", "Orders", "orders-audit", recording_listener(log.clone(), "first"))
        .expect("inline sub 1");
    bus.subscribe("OrderPlaced", "Orders", "orders-stats", recording_listener(log.clone(), "second"))
        .expect("inline sub 2");
    bus.subscribe("OrderPlaced", "Shipping", "shipping-planner", recording_listener(log.clone(), "queued"))
        .expect("queued sub 1");
    bus.subscribe("OrderPlaced", "Notifications", "notify-email", recording_listener(log.clone(), "queued2"))
        .expect("queued sub 2");

    let receipt = bus
        .publish("OrderPlaced", "Orders", serde_json::json!({"order": 7}), Some("corr-1"))
        .expect("publish");

    assert_eq!(receipt.inline_invoked, 2);
    assert!(receipt.inline_failures.is_empty());
    assert_eq!(receipt.queued, 2);

    // Inline listeners ran synchronously, in registration order; queued
    // listeners have not run yet.
    let seen = log.lock().unwrap().clone();
    assert_eq!(seen, vec!["first:OrderPlaced", "second:OrderPlaced"]);

    // Queued rows are durable before publish returned.
    let pending = bus::list_deliveries(tmp.path(), Some(DeliveryState::Pending)).expect("rows");
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|r| r.attempt_count == 0));
}

#[test]
fn one_inline_failure_does_not_block_sibling_listeners() {
    let tmp = tempdir().expect("tempdir");
    let store = fixture_store(tmp.path());
    let bus = EventBus::open(tmp.path(), &store, fast_config(5)).expect("bus");

    let log = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(
        "OrderPlaced",
        "Orders",
        "orders-broken",
        Arc::new(|_| Err("boom".to_string())),
    )
    .expect("failing sub");
    bus.subscribe("OrderPlaced", "Orders", "orders-ok", recording_listener(log.clone(), "ok"))
        .expect("healthy sub");

    let receipt = bus
        .publish("OrderPlaced", "Orders", serde_json::json!({}), None)
        .expect("publish");

    assert_eq!(receipt.inline_invoked, 2);
    assert_eq!(receipt.inline_failures.len(), 1);
    assert!(receipt.inline_failures[0].contains("orders-broken"));
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn delivery_mode_is_computed_from_module_identity() {
    let tmp = tempdir().expect("tempdir");
    let store = fixture_store(tmp.path());
    let bus = EventBus::open(tmp.path(), &store, fast_config(5)).expect("bus");

    let inline_id = bus
        .subscribe("OrderPlaced", "Orders", "orders-audit", Arc::new(|_| Ok(())))
        .expect("inline");
    let queued_id = bus
        .subscribe("OrderPlaced", "Shipping", "shipping-planner", Arc::new(|_| Ok(())))
        .expect("queued");

    assert_eq!(bus.delivery_mode(&inline_id), Some(DeliveryMode::Inline));
    assert_eq!(bus.delivery_mode(&queued_id), Some(DeliveryMode::Queued));
}

#[test]
fn subscribing_to_an_unexported_event_type_fails() {
    let tmp = tempdir().expect("tempdir");
    let store = fixture_store(tmp.path());
    let bus = EventBus::open(tmp.path(), &store, fast_config(5)).expect("bus");

    let err = bus
        .subscribe("GhostEvent", "Shipping", "x", Arc::new(|_| Ok(())))
        .expect_err("must fail");
    assert!(matches!(err, ModguardError::NotFound(_)));
}

#[test]
fn only_the_exporting_module_may_publish() {
    let tmp = tempdir().expect("tempdir");
    let store = fixture_store(tmp.path());
    let bus = EventBus::open(tmp.path(), &store, fast_config(5)).expect("bus");

    let err = bus
        .publish("OrderPlaced", "Shipping", serde_json::json!({}), None)
        .expect_err("must fail");
    assert!(matches!(err, ModguardError::ValidationError(_)));
}

#[test]
fn queued_delivery_retries_until_listener_succeeds() {
    let tmp = tempdir().expect("tempdir");
    let store = fixture_store(tmp.path());
    let bus = EventBus::open(tmp.path(), &store, fast_config(5)).expect("bus");

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_listener = calls.clone();
    bus.subscribe(
        "OrderPlaced",
        "Shipping",
        "shipping-planner",
        Arc::new(move |_| {
            let n = calls_in_listener.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("not ready".to_string())
            } else {
                Ok(())
            }
        }),
    )
    .expect("subscribe");

    bus.publish("OrderPlaced", "Orders", serde_json::json!({}), None)
        .expect("publish");

    assert_eq!(bus.drain("shipping-planner").expect("drain 1"), 0);
    assert_eq!(bus.drain("shipping-planner").expect("drain 2"), 0);
    assert_eq!(bus.drain("shipping-planner").expect("drain 3"), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let delivered = bus::list_deliveries(tmp.path(), Some(DeliveryState::Delivered)).expect("rows");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].attempt_count, 2);
}

#[test]
fn exhausted_attempts_dead_letter_and_only_requeue_revives() {
    let tmp = tempdir().expect("tempdir");
    let store = fixture_store(tmp.path());
    let bus = EventBus::open(tmp.path(), &store, fast_config(2)).expect("bus");

    bus.subscribe(
        "OrderPlaced",
        "Shipping",
        "shipping-planner",
        Arc::new(|_| Err("always down".to_string())),
    )
    .expect("subscribe");

    bus.publish("OrderPlaced", "Orders", serde_json::json!({}), None)
        .expect("publish");

    assert_eq!(bus.drain("shipping-planner").expect("drain 1"), 0);
    assert_eq!(bus.drain("shipping-planner").expect("drain 2"), 0);

    let dead = bus::list_deliveries(tmp.path(), Some(DeliveryState::DeadLettered)).expect("rows");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt_count, 2);

    // No further automatic attempts.
    assert!(bus.claim_next("shipping-planner").expect("claim").is_none());

    // Operator replay is the only path back to the queue.
    bus::requeue_delivery(tmp.path(), &dead[0].delivery_id).expect("requeue");
    let pending = bus::list_deliveries(tmp.path(), Some(DeliveryState::Pending)).expect("rows");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt_count, 0);
}

#[test]
fn successive_events_deliver_fifo_per_listener() {
    let tmp = tempdir().expect("tempdir");
    let store = fixture_store(tmp.path());
    let bus = EventBus::open(tmp.path(), &store, fast_config(5)).expect("bus");

    let log = Arc::new(Mutex::new(Vec::new()));
    let log_in_listener = log.clone();
    bus.subscribe(
        "OrderPlaced",
        "Shipping",
        "shipping-planner",
        Arc::new(move |event| {
            log_in_listener
                .lock()
                .unwrap()
                .push(event.payload["order"].as_i64().unwrap_or(-1));
            Ok(())
        }),
    )
    .expect("subscribe");

    for order in 1..=3 {
        bus.publish("OrderPlaced", "Orders", serde_json::json!({"order": order}), None)
            .expect("publish");
    }

    assert_eq!(bus.drain("shipping-planner").expect("drain"), 3);
    assert_eq!(log.lock().unwrap().clone(), vec![1, 2, 3]);
}

#[test]
fn expired_lease_returns_the_row_to_the_queue() {
    let tmp = tempdir().expect("tempdir");
    let store = fixture_store(tmp.path());
    let config = BusConfig {
        max_attempts: 5,
        lease_secs: 0,
        backoff_base_secs: 0,
    };
    let bus = EventBus::open(tmp.path(), &store, config).expect("bus");

    bus.subscribe("OrderPlaced", "Shipping", "shipping-planner", Arc::new(|_| Ok(())))
        .expect("subscribe");
    bus.publish("OrderPlaced", "Orders", serde_json::json!({}), None)
        .expect("publish");

    let first = bus.claim_next("shipping-planner").expect("claim").expect("row");
    assert_eq!(first.attempt_count, 0);

    // The zero-length lease has already expired; the next claim reaps the
    // stalled row and hands it out again with the lost attempt counted.
    let second = bus.claim_next("shipping-planner").expect("claim").expect("row");
    assert_eq!(second.delivery_id, first.delivery_id);
    assert_eq!(second.attempt_count, 1);

    bus.ack(&second.delivery_id).expect("ack");
    let delivered = bus::list_deliveries(tmp.path(), Some(DeliveryState::Delivered)).expect("rows");
    assert_eq!(delivered.len(), 1);
}

#[test]
fn queue_stats_counts_per_state() {
    let tmp = tempdir().expect("tempdir");
    let store = fixture_store(tmp.path());
    let bus = EventBus::open(tmp.path(), &store, fast_config(5)).expect("bus");

    bus.subscribe("OrderPlaced", "Shipping", "shipping-planner", Arc::new(|_| Ok(())))
        .expect("subscribe");
    bus.publish("OrderPlaced", "Orders", serde_json::json!({}), None)
        .expect("publish");

    let stats = bus::queue_stats(tmp.path()).expect("stats");
    assert_eq!(stats, vec![("pending".to_string(), 1)]);

    assert_eq!(bus.drain("shipping-planner").expect("drain"), 1);
    let stats = bus::queue_stats(tmp.path()).expect("stats");
    assert_eq!(stats, vec![("delivered".to_string(), 1)]);
}
