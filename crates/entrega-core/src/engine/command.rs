use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::{BusinessHours, ConsumerConfig};
use crate::dedup::DedupStats;
use crate::error::{
    PauseError, QueueInfoError, ResumeError, StartError, StopError,
};
use crate::processor::{Disposition, ProcessorStats};
use crate::reconnect::{ReconnectEvent, ReconnectStatsSnapshot};
use crate::webhook::WebhookStats;

/// Interval defaults applied when a start request omits them.
pub const DEFAULT_MIN_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_MAX_INTERVAL_MS: u64 = 110_000;

/// A request to begin consuming a queue.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub queue: String,
    pub webhook_url: String,
    pub min_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub business_hours: Option<BusinessHours>,
}

/// Why a consumer is being torn down. Only manual stops remove the
/// persisted configuration; every other reason leaves it in place so a
/// restart restores the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    Shutdown,
    QueueDeletedExternally,
    ConsumerCancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Manual => "manual",
            StopReason::Shutdown => "shutdown",
            StopReason::QueueDeletedExternally => "queue_deleted_externally",
            StopReason::ConsumerCancelled => "consumer_cancelled",
        }
    }

    /// Whether this teardown also deletes the stored configuration.
    pub fn removes_persisted(&self) -> bool {
        matches!(
            self,
            StopReason::Manual | StopReason::QueueDeletedExternally | StopReason::ConsumerCancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSummary {
    pub queue: String,
    pub message_count: u64,
    pub reason: &'static str,
}

/// Per-queue row of the active-queues report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveQueueReport {
    pub queue: String,
    pub status: &'static str,
    pub message_count: u64,
    /// Broker-reported backlog, when the channel was ready to probe it.
    pub queue_depth: Option<u32>,
    /// Projection of when the backlog empties at the mean pacing interval.
    pub estimated_completion: Option<DateTime<Utc>>,
    pub webhook_url: String,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub business_hours: BusinessHours,
    pub consumer_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfoReport {
    pub message_count: u32,
    pub consumer_count: u32,
    pub is_active: bool,
    pub config: Option<ConsumerConfig>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub restored: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Stored queues that no longer exist at the broker, deleted after the
    /// restore loop.
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub broker_connected: bool,
    pub restore: RestoreSummary,
}

/// The full stats tree served by the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub initialized: bool,
    pub broker_connected: bool,
    pub active_queues: usize,
    pub queues: Vec<ActiveQueueReport>,
    pub processor: ProcessorStats,
    pub webhook: WebhookStats,
    pub dedup: DedupStats,
    pub reconnect: ReconnectStatsSnapshot,
}

/// Commands processed by the engine actor. Variants that expect a response
/// carry a oneshot reply sender; internal notifications from per-queue tasks
/// and the reconnection controller omit it.
pub enum EngineCommand {
    Initialize {
        reply: oneshot::Sender<InitReport>,
    },
    StartConsuming {
        request: StartRequest,
        reply: oneshot::Sender<Result<(), StartError>>,
    },
    PauseConsuming {
        queue: String,
        reply: oneshot::Sender<Result<(), PauseError>>,
    },
    ResumeConsuming {
        queue: String,
        reply: oneshot::Sender<Result<(), ResumeError>>,
    },
    StopConsuming {
        queue: String,
        reason: StopReason,
        reply: oneshot::Sender<Result<StopSummary, StopError>>,
    },
    QueueInfo {
        queue: String,
        reply: oneshot::Sender<Result<QueueInfoReport, QueueInfoError>>,
    },
    ActiveQueues {
        reply: oneshot::Sender<Vec<ActiveQueueReport>>,
    },
    RestorePersisted {
        reply: oneshot::Sender<RestoreSummary>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    ResetStats {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },

    // Internal notifications.
    /// A per-queue task finished one pipeline run.
    DeliveryProcessed {
        queue: String,
        disposition: Disposition,
    },
    /// A subscription's delivery channel closed without a local stop: the
    /// broker cancelled the consumer.
    SubscriptionClosed { queue: String },
    ReconnectOutcome(ReconnectEvent),
}
