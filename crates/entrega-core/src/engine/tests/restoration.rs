use super::*;

use crate::testing::MockBroker;

/// Build a second engine over an existing store and broker, as a process
/// restart would.
async fn restarted_engine(
    store_path: &std::path::Path,
    broker: &Arc<MockBroker>,
) -> (Engine, Arc<ConfigStore>) {
    let mut config = EngineConfig::default();
    config.store.path = store_path.display().to_string();

    let store = Arc::new(ConfigStore::new(store_path));
    let webhook = Arc::new(WebhookSender::new(config.webhook.clone(), None));
    let timezone: Tz = "America/Sao_Paulo".parse().unwrap();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let engine = Engine::start(
        &config,
        timezone,
        Arc::clone(broker) as Arc<dyn BrokerClient>,
        Arc::clone(&store),
        webhook,
        events_tx,
        events_rx,
    );
    (engine, store)
}

#[tokio::test]
async fn restart_restores_persisted_consumers() {
    let h = harness().await;
    h.broker.add_queue("orders", 0);
    h.broker.add_queue("billing", 0);
    h.engine
        .start_consuming(start_request("orders", "https://hooks.example.com/orders"))
        .await
        .unwrap();
    h.engine
        .start_consuming(start_request("billing", "https://hooks.example.com/billing"))
        .await
        .unwrap();

    let store_path = h.store.path().to_path_buf();
    h.engine.shutdown().await.unwrap();

    let (engine, _store) = restarted_engine(&store_path, &h.broker).await;
    let report = engine.initialize().await.unwrap();
    assert!(report.broker_connected);
    assert_eq!(report.restore.restored, 2);
    assert_eq!(report.restore.failed, 0);

    let mut queues: Vec<String> = engine
        .active_queues()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.queue)
        .collect();
    queues.sort();
    assert_eq!(queues, ["billing", "orders"]);
}

#[tokio::test]
async fn restore_drops_configs_for_queues_that_no_longer_exist() {
    let h = harness().await;
    h.broker.add_queue("orders", 0);
    h.broker.add_queue("billing", 0);
    h.engine
        .start_consuming(start_request("orders", "https://hooks.example.com/orders"))
        .await
        .unwrap();
    h.engine
        .start_consuming(start_request("billing", "https://hooks.example.com/billing"))
        .await
        .unwrap();

    let store_path = h.store.path().to_path_buf();
    h.engine.shutdown().await.unwrap();
    // billing disappears while the process is down.
    h.broker.remove_queue("billing");

    let (engine, store) = restarted_engine(&store_path, &h.broker).await;
    let report = engine.initialize().await.unwrap();
    assert_eq!(report.restore.restored, 1);
    assert_eq!(report.restore.removed, vec!["billing".to_string()]);

    // The stale entry is gone for good.
    assert!(!store.has("billing").await.unwrap());
    assert!(store.has("orders").await.unwrap());
}

#[tokio::test]
async fn restore_skips_queues_already_being_consumed() {
    let h = harness().await;
    h.broker.add_queue("orders", 0);
    h.engine
        .start_consuming(start_request("orders", "https://hooks.example.com/orders"))
        .await
        .unwrap();

    let summary = h.engine.restore_persisted().await.unwrap();
    assert_eq!(summary.restored, 0);
    assert_eq!(summary.skipped, 1);
    // Still exactly one live subscription for the queue.
    assert_eq!(h.engine.active_queues().await.unwrap().len(), 1);
}
