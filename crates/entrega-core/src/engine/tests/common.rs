use super::*;

use std::sync::atomic::AtomicU32;

use chrono::Timelike;

use crate::amqp::Delivery;
use crate::config::{BusinessHours, DedupConfig, ReconnectConfig, WebhookConfig};
use crate::processor::MessageProcessor;
use crate::testing::{spawn_webhook, MockBroker};

/// A fully wired engine against in-memory collaborators: mock broker,
/// tempdir-backed store, loopback webhooks.
pub(crate) struct Harness {
    pub(crate) engine: Engine,
    pub(crate) broker: Arc<MockBroker>,
    pub(crate) store: Arc<ConfigStore>,
    pub(crate) events_tx: mpsc::UnboundedSender<BrokerEvent>,
    pub(crate) _dir: tempfile::TempDir,
}

pub(crate) async fn harness() -> Harness {
    harness_custom(300, None).await
}

pub(crate) async fn harness_custom(
    health_interval_secs: u64,
    finish_webhook: Option<String>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let mut config = EngineConfig::default();
    config.store.path = dir
        .path()
        .join("queue-configurations.json")
        .display()
        .to_string();
    config.engine.health_check_interval_secs = health_interval_secs;
    config.webhook = WebhookConfig {
        timeout_ms: 2_000,
        probe_timeout_ms: 1_000,
        attempts: 2,
        base_delay_ms: 10,
    };
    config.reconnect = ReconnectConfig {
        debounce_ms: 50,
        max_attempts: 10,
        base_delay_ms: 50,
        multiplier: 1.5,
        max_delay_ms: 1_000,
    };

    let broker = MockBroker::new();
    let store = Arc::new(ConfigStore::new(&config.store.path));
    let webhook = Arc::new(WebhookSender::new(config.webhook.clone(), finish_webhook));
    let timezone: Tz = "America/Sao_Paulo".parse().unwrap();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let engine = Engine::start(
        &config,
        timezone,
        Arc::clone(&broker) as Arc<dyn BrokerClient>,
        Arc::clone(&store),
        webhook,
        events_tx.clone(),
        events_rx,
    );
    engine.initialize().await.unwrap();

    Harness {
        engine,
        broker,
        store,
        events_tx,
        _dir: dir,
    }
}

/// Start request with the shortest intervals sanitisation allows and a
/// window covering the whole day.
pub(crate) fn start_request(queue: &str, webhook_url: &str) -> StartRequest {
    StartRequest {
        queue: queue.to_string(),
        webhook_url: webhook_url.to_string(),
        min_interval_ms: Some(1_000),
        max_interval_ms: Some(2_000),
        business_hours: Some(all_day()),
    }
}

pub(crate) fn all_day() -> BusinessHours {
    BusinessHours {
        start_hour: 0,
        end_hour: 24,
    }
}

/// A valid window that excludes the current hour in the engine timezone.
pub(crate) fn hours_excluding_now() -> BusinessHours {
    let tz: Tz = "America/Sao_Paulo".parse().unwrap();
    let hour = chrono::Utc::now().with_timezone(&tz).hour();
    if hour >= 12 {
        BusinessHours {
            start_hour: 1,
            end_hour: 2,
        }
    } else {
        BusinessHours {
            start_hour: 22,
            end_hour: 23,
        }
    }
}

/// Poll `cond` for up to ten seconds before failing the test.
pub(crate) async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Processor wired to a loopback webhook answering with `status` — for
/// pipeline tests that bypass engine pacing.
pub(crate) struct PipelineSetup {
    pub(crate) processor: MessageProcessor,
    pub(crate) broker: Arc<MockBroker>,
    pub(crate) dedup: Arc<DedupStore>,
    pub(crate) webhook_url: String,
    pub(crate) webhook_hits: Arc<AtomicU32>,
}

pub(crate) async fn pipeline_setup(status: u16) -> PipelineSetup {
    let broker = MockBroker::new();
    broker.set_connected(true);
    let (webhook_url, webhook_hits) = spawn_webhook(status).await;

    let dedup = Arc::new(DedupStore::new(DedupConfig::default()));
    let webhook = Arc::new(WebhookSender::new(
        WebhookConfig {
            timeout_ms: 2_000,
            probe_timeout_ms: 1_000,
            attempts: 3,
            base_delay_ms: 1,
        },
        None,
    ));
    let timezone: Tz = "America/Sao_Paulo".parse().unwrap();
    let processor = MessageProcessor::new(
        Arc::clone(&broker) as Arc<dyn BrokerClient>,
        Arc::clone(&dedup),
        webhook,
        timezone,
    );

    PipelineSetup {
        processor,
        broker,
        dedup,
        webhook_url,
        webhook_hits,
    }
}

pub(crate) fn snapshot_for(queue: &str, webhook_url: &str) -> ConsumerSnapshot {
    ConsumerSnapshot {
        queue: queue.to_string(),
        webhook_url: webhook_url.to_string(),
        min_interval_ms: 1_000,
        max_interval_ms: 2_000,
        business_hours: all_day(),
        paused: false,
    }
}

pub(crate) fn delivery(tag: u64, payload: &[u8]) -> Delivery {
    Delivery {
        delivery_tag: tag,
        payload: payload.to_vec(),
        redelivered: false,
    }
}
