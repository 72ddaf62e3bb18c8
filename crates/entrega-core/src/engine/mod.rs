mod actor;
mod command;
mod consumers;
mod health;
mod restore;

pub use command::{
    ActiveQueueReport, EngineCommand, EngineStats, InitReport, QueueInfoReport, RestoreSummary,
    StartRequest, StopReason, StopSummary, DEFAULT_MAX_INTERVAL_MS, DEFAULT_MIN_INTERVAL_MS,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::amqp::{BrokerClient, BrokerEvent, SubscriptionItem};
use crate::config::{
    validate_consumer_config, ConsumerConfig, ConsumerSnapshot, EngineConfig,
};
use crate::dedup::DedupStore;
use crate::error::{
    BrokerError, EngineError, PauseError, QueueInfoError, ResumeError, StartError, StopError,
};
use crate::processor::{Disposition, MessageProcessor};
use crate::reconnect::{ReconnectController, ReconnectEvent, ReconnectHandle, ReconnectStats};
use crate::store::ConfigStore;
use crate::webhook::WebhookSender;

use actor::EngineCore;
use consumers::QueueEntry;

/// Cloneable handle to the engine actor. All control operations are
/// commands with oneshot replies, processed sequentially by the actor.
#[derive(Clone)]
pub struct Engine {
    tx: mpsc::Sender<EngineCommand>,
}

impl Engine {
    /// Wire up and spawn the engine: dedup sweeper, reconnection
    /// controller, outcome bridge, and the actor itself.
    ///
    /// `events_tx`/`events_rx` are the two ends of the broker event bus;
    /// the caller creates the channel so it can hand `events_tx` to the
    /// broker client first.
    pub fn start(
        config: &EngineConfig,
        timezone: Tz,
        broker: Arc<dyn BrokerClient>,
        store: Arc<ConfigStore>,
        webhook: Arc<WebhookSender>,
        events_tx: mpsc::UnboundedSender<BrokerEvent>,
        events_rx: mpsc::UnboundedReceiver<BrokerEvent>,
    ) -> Engine {
        let dedup = Arc::new(DedupStore::new(config.dedup.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&dedup).run_sweeper(shutdown_rx.clone()));

        let reconnect_stats = Arc::new(ReconnectStats::default());
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let (controller, reconnect_handle) = ReconnectController::new(
            Arc::clone(&broker),
            config.reconnect.clone(),
            Arc::clone(&reconnect_stats),
            outcome_tx,
        );
        tokio::spawn(controller.run(events_rx, shutdown_rx));

        let processor = Arc::new(MessageProcessor::new(
            Arc::clone(&broker),
            Arc::clone(&dedup),
            Arc::clone(&webhook),
            timezone,
        ));

        let (tx, inbound) = mpsc::channel(config.engine.command_channel_capacity);

        // Bridge reconnection outcomes onto the command channel so the
        // actor re-establishes consumers after a successful reconnect.
        let bridge_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = outcome_rx.recv().await {
                if bridge_tx
                    .send(EngineCommand::ReconnectOutcome(event))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let actor = EngineCore {
            broker,
            store,
            webhook,
            dedup,
            processor,
            reconnect_stats,
            reconnect_handle,
            events_tx,
            inbound,
            self_tx: tx.clone(),
            entries: HashMap::new(),
            health_interval: Duration::from_secs(config.engine.health_check_interval_secs),
            shutdown_tx,
            initialized: false,
            running: true,
        };
        tokio::spawn(actor.run());

        Engine { tx }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelDisconnected)?;
        reply_rx.await.map_err(|_| EngineError::ReplyDropped)
    }

    /// Connect the broker, restore persisted consumers, start background
    /// monitoring. Call once at startup.
    pub async fn initialize(&self) -> Result<InitReport, EngineError> {
        self.call(|reply| EngineCommand::Initialize { reply }).await
    }

    pub async fn start_consuming(&self, request: StartRequest) -> Result<(), StartError> {
        self.call(|reply| EngineCommand::StartConsuming { request, reply })
            .await?
    }

    pub async fn pause_consuming(&self, queue: &str) -> Result<(), PauseError> {
        self.call(|reply| EngineCommand::PauseConsuming {
            queue: queue.to_string(),
            reply,
        })
        .await?
    }

    pub async fn resume_consuming(&self, queue: &str) -> Result<(), ResumeError> {
        self.call(|reply| EngineCommand::ResumeConsuming {
            queue: queue.to_string(),
            reply,
        })
        .await?
    }

    pub async fn stop_consuming(
        &self,
        queue: &str,
        reason: StopReason,
    ) -> Result<StopSummary, StopError> {
        self.call(|reply| EngineCommand::StopConsuming {
            queue: queue.to_string(),
            reason,
            reply,
        })
        .await?
    }

    pub async fn queue_info(&self, queue: &str) -> Result<QueueInfoReport, QueueInfoError> {
        self.call(|reply| EngineCommand::QueueInfo {
            queue: queue.to_string(),
            reply,
        })
        .await?
    }

    pub async fn active_queues(&self) -> Result<Vec<ActiveQueueReport>, EngineError> {
        self.call(|reply| EngineCommand::ActiveQueues { reply })
            .await
    }

    pub async fn restore_persisted(&self) -> Result<RestoreSummary, EngineError> {
        self.call(|reply| EngineCommand::RestorePersisted { reply })
            .await
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        self.call(|reply| EngineCommand::Stats { reply }).await
    }

    pub async fn reset_stats(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineCommand::ResetStats { reply }).await
    }

    /// Graceful shutdown: stops monitors and consumers, drains in-flight
    /// work, disconnects the broker. Callers should wrap this in an outer
    /// timeout and exit non-zero if it expires.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineCommand::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests;
