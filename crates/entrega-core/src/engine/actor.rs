use super::*;

use chrono::Utc;

/// The engine actor. Owns the active-queue table and all per-queue
/// configuration; every mutation flows through [`EngineCommand`]s processed
/// sequentially here, so no lock guards any of this state.
pub(super) struct EngineCore {
    pub(super) broker: Arc<dyn BrokerClient>,
    pub(super) store: Arc<ConfigStore>,
    pub(super) webhook: Arc<WebhookSender>,
    pub(super) dedup: Arc<DedupStore>,
    pub(super) processor: Arc<MessageProcessor>,
    pub(super) reconnect_stats: Arc<ReconnectStats>,
    pub(super) reconnect_handle: ReconnectHandle,
    /// Broker event bus; the engine feeds it from the health monitor.
    pub(super) events_tx: mpsc::UnboundedSender<BrokerEvent>,
    pub(super) inbound: mpsc::Receiver<EngineCommand>,
    /// Handed to per-queue tasks so they can report dispositions back.
    pub(super) self_tx: mpsc::Sender<EngineCommand>,
    pub(super) entries: HashMap<String, QueueEntry>,
    pub(super) health_interval: Duration,
    /// Flipped on shutdown; stops the dedup sweeper and the reconnection
    /// controller.
    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) initialized: bool,
    pub(super) running: bool,
}

impl EngineCore {
    /// Run the actor event loop until shutdown.
    pub(super) async fn run(mut self) {
        info!("engine started");
        let mut health = tokio::time::interval(self.health_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of an interval fires immediately; swallow it so the
        // initial sweep happens one full period after startup.
        health.tick().await;

        while self.running {
            tokio::select! {
                cmd = self.inbound.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        info!("engine command channel closed");
                        break;
                    }
                },
                _ = health.tick() => self.health_sweep().await,
            }
        }

        info!("engine stopped");
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Initialize { reply } => {
                let report = self.handle_initialize().await;
                let _ = reply.send(report);
            }
            EngineCommand::StartConsuming { request, reply } => {
                debug!(queue = %request.queue, "start command received");
                let result = self.handle_start(request).await;
                let _ = reply.send(result);
            }
            EngineCommand::PauseConsuming { queue, reply } => {
                let result = self.handle_pause(&queue);
                let _ = reply.send(result);
            }
            EngineCommand::ResumeConsuming { queue, reply } => {
                let result = self.handle_resume(&queue);
                let _ = reply.send(result);
            }
            EngineCommand::StopConsuming {
                queue,
                reason,
                reply,
            } => {
                debug!(%queue, reason = reason.as_str(), "stop command received");
                let result = self.handle_stop(&queue, reason).await;
                let _ = reply.send(result);
            }
            EngineCommand::QueueInfo { queue, reply } => {
                let result = self.handle_queue_info(&queue).await;
                let _ = reply.send(result);
            }
            EngineCommand::ActiveQueues { reply } => {
                let reports = self.handle_active_queues().await;
                let _ = reply.send(reports);
            }
            EngineCommand::RestorePersisted { reply } => {
                let summary = self.restore_persisted().await;
                let _ = reply.send(summary);
            }
            EngineCommand::Stats { reply } => {
                let _ = reply.send(self.handle_stats());
            }
            EngineCommand::ResetStats { reply } => {
                self.processor.reset_stats();
                self.webhook.reset_stats();
                info!("processor and webhook counters reset");
                let _ = reply.send(());
            }
            EngineCommand::Shutdown { reply } => {
                self.handle_shutdown().await;
                let _ = reply.send(());
            }
            EngineCommand::DeliveryProcessed { queue, disposition } => {
                self.handle_delivery_processed(&queue, disposition);
            }
            EngineCommand::SubscriptionClosed { queue } => {
                self.handle_subscription_closed(&queue).await;
            }
            EngineCommand::ReconnectOutcome(event) => {
                self.handle_reconnect_outcome(event).await;
            }
        }
    }

    /// Connect the broker, restore persisted consumers, mark the engine
    /// ready. A failed initial connect hands the retry ladder to the
    /// reconnection controller instead of failing startup.
    async fn handle_initialize(&mut self) -> InitReport {
        let broker_connected = match self.broker.connect().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "initial broker connect failed, scheduling reconnect");
                self.reconnect_handle
                    .force_reconnect("initial connect failed")
                    .await;
                false
            }
        };

        let restore = if broker_connected {
            self.restore_persisted().await
        } else {
            RestoreSummary::default()
        };

        self.initialized = true;
        InitReport {
            broker_connected,
            restore,
        }
    }

    async fn handle_reconnect_outcome(&mut self, event: ReconnectEvent) {
        match event {
            ReconnectEvent::Successful => {
                info!("broker reconnected");
                self.reestablish_consumers().await;
            }
            ReconnectEvent::Started { attempt, reason } => {
                debug!(attempt, reason, "reconnection attempt started");
            }
            ReconnectEvent::Failed { reason } => {
                warn!(reason, "reconnection attempt failed");
            }
            ReconnectEvent::MaxAttemptsReached => {
                error!("reconnection attempts exhausted; engine stays up for manual intervention");
            }
        }
    }

    async fn handle_queue_info(&self, queue: &str) -> Result<QueueInfoReport, QueueInfoError> {
        let snapshot = self.broker.check_queue(queue).await?;
        let entry = self.entries.get(queue);
        Ok(QueueInfoReport {
            message_count: snapshot.message_count,
            consumer_count: snapshot.consumer_count,
            is_active: entry.is_some(),
            config: entry.map(|e| e.config.clone()),
        })
    }

    async fn handle_active_queues(&self) -> Vec<ActiveQueueReport> {
        let probe = self.broker.is_channel_ready();
        let mut reports = Vec::with_capacity(self.entries.len());
        for entry in self.entries.values() {
            let depth = if probe {
                self.broker
                    .check_queue(&entry.config.queue)
                    .await
                    .ok()
                    .map(|s| s.message_count)
            } else {
                None
            };
            reports.push(Self::report_for(&entry.config, depth));
        }
        reports.sort_by(|a, b| a.queue.cmp(&b.queue));
        reports
    }

    pub(super) fn report_for(config: &ConsumerConfig, depth: Option<u32>) -> ActiveQueueReport {
        let mean_interval_ms = (config.min_interval_ms + config.max_interval_ms) / 2;
        let estimated_completion = depth.filter(|d| *d > 0).map(|d| {
            Utc::now() + chrono::Duration::milliseconds(d as i64 * mean_interval_ms as i64)
        });
        ActiveQueueReport {
            queue: config.queue.clone(),
            status: if config.paused { "paused" } else { "running" },
            message_count: config.message_count,
            queue_depth: depth,
            estimated_completion,
            webhook_url: config.webhook_url.clone(),
            min_interval_ms: config.min_interval_ms,
            max_interval_ms: config.max_interval_ms,
            business_hours: config.business_hours,
            consumer_tag: config.consumer_tag.clone(),
            created_at: config.created_at,
        }
    }

    fn handle_stats(&self) -> EngineStats {
        let queues = self
            .entries
            .values()
            .map(|entry| Self::report_for(&entry.config, None))
            .collect();
        EngineStats {
            initialized: self.initialized,
            broker_connected: self.broker.is_channel_ready(),
            active_queues: self.entries.len(),
            queues,
            processor: self.processor.stats(),
            webhook: self.webhook.stats(),
            dedup: self.dedup.stats(),
            reconnect: self.reconnect_stats.snapshot(),
        }
    }

    /// Graceful teardown: background tasks first, then every consumer with
    /// reason `shutdown` (persisted configs stay for the next start), then
    /// the dedup drain, then the broker connection.
    async fn handle_shutdown(&mut self) {
        info!("engine shutting down");
        self.running = false;
        let _ = self.shutdown_tx.send(true);

        let queues: Vec<String> = self.entries.keys().cloned().collect();
        for queue in queues {
            let _ = self.handle_stop(&queue, StopReason::Shutdown).await;
        }

        self.dedup.shutdown().await;
        self.broker.disconnect().await;
        info!("engine shutdown complete");
    }
}
