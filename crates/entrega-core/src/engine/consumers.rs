use super::*;

use rand::Rng;

/// Engine-side record of one live consumer.
pub(super) struct QueueEntry {
    pub(super) config: ConsumerConfig,
    /// Publishes config snapshots to the consumer task.
    pub(super) snapshot_tx: watch::Sender<ConsumerSnapshot>,
    pub(super) stop_tx: watch::Sender<bool>,
    pub(super) task: tokio::task::JoinHandle<()>,
}

/// Sample a pacing interval uniformly from `[min, max]` milliseconds.
pub(super) fn sample_interval(min_ms: u64, max_ms: u64) -> Duration {
    let (lo, hi) = if min_ms <= max_ms {
        (min_ms, max_ms)
    } else {
        (max_ms, min_ms)
    };
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

impl EngineCore {
    pub(super) async fn handle_start(&mut self, request: StartRequest) -> Result<(), StartError> {
        if self.entries.contains_key(&request.queue) {
            return Err(StartError::AlreadyConsuming(request.queue));
        }

        let min = request.min_interval_ms.unwrap_or(DEFAULT_MIN_INTERVAL_MS);
        let max = request.max_interval_ms.unwrap_or(DEFAULT_MAX_INTERVAL_MS);
        let hours = request.business_hours.unwrap_or_default();
        validate_consumer_config(&request.webhook_url, min, max, hours)?;
        let (min, max) = ConsumerConfig::sanitise_intervals(min, max);

        // The queue must pre-exist; the engine never declares queues.
        self.broker.check_queue(&request.queue).await?;

        let config = ConsumerConfig::new(request.queue, request.webhook_url, min, max, hours);
        self.install_consumer(config, true).await
    }

    /// Register the subscription and spawn the per-queue task. `persist`
    /// is false when re-establishing after a reconnect, where the stored
    /// entry is already current.
    pub(super) async fn install_consumer(
        &mut self,
        mut config: ConsumerConfig,
        persist: bool,
    ) -> Result<(), StartError> {
        let subscription = self.broker.consume(&config.queue).await?;
        config.consumer_tag = Some(subscription.consumer_tag.clone());

        if persist {
            if let Err(err) = self.store.save(&config.queue, &config).await {
                // Roll the subscription back so the broker does not hold a
                // consumer the engine has no record of.
                let _ = self
                    .broker
                    .cancel_consumer(&subscription.consumer_tag)
                    .await;
                return Err(err.into());
            }
        }

        let (snapshot_tx, snapshot_rx) = watch::channel(config.snapshot());
        let (stop_tx, stop_rx) = watch::channel(false);
        let next_interval = sample_interval(config.min_interval_ms, config.max_interval_ms);

        let task = tokio::spawn(run_consumer(ConsumerTask {
            queue: config.queue.clone(),
            deliveries: subscription.deliveries,
            snapshot_rx,
            stop_rx,
            broker: Arc::clone(&self.broker),
            processor: Arc::clone(&self.processor),
            engine_tx: self.self_tx.clone(),
            next_interval,
        }));

        info!(
            queue = %config.queue,
            min_interval_ms = config.min_interval_ms,
            max_interval_ms = config.max_interval_ms,
            consumer_tag = config.consumer_tag.as_deref().unwrap_or(""),
            "consumer started"
        );
        self.entries.insert(config.queue.clone(), QueueEntry {
            config,
            snapshot_tx,
            stop_tx,
            task,
        });
        Ok(())
    }

    pub(super) fn handle_pause(&mut self, queue: &str) -> Result<(), PauseError> {
        let entry = self
            .entries
            .get_mut(queue)
            .ok_or_else(|| PauseError::NotConsuming(queue.to_string()))?;
        if entry.config.paused {
            return Err(PauseError::AlreadyPaused(queue.to_string()));
        }
        entry.config.paused = true;
        let _ = entry.snapshot_tx.send(entry.config.snapshot());
        info!(queue, "consumer paused");
        Ok(())
    }

    pub(super) fn handle_resume(&mut self, queue: &str) -> Result<(), ResumeError> {
        let entry = self
            .entries
            .get_mut(queue)
            .ok_or_else(|| ResumeError::NotConsuming(queue.to_string()))?;
        if !entry.config.paused {
            return Err(ResumeError::NotPaused(queue.to_string()));
        }
        entry.config.paused = false;
        let _ = entry.snapshot_tx.send(entry.config.snapshot());
        info!(queue, "consumer resumed");
        Ok(())
    }

    /// Common teardown for every stop path. The reason decides whether the
    /// broker-side consumer is cancelled and whether the stored config is
    /// removed.
    pub(super) async fn handle_stop(
        &mut self,
        queue: &str,
        reason: StopReason,
    ) -> Result<StopSummary, StopError> {
        let entry = self
            .entries
            .remove(queue)
            .ok_or_else(|| StopError::NotConsuming(queue.to_string()))?;

        // The task observes the stop signal at its next suspension point;
        // an already-dispatched HTTP call is allowed to complete.
        let _ = entry.stop_tx.send(true);

        let cancel_at_broker = matches!(reason, StopReason::Manual | StopReason::Shutdown);
        if cancel_at_broker && self.broker.is_channel_ready() {
            if let Some(tag) = entry.config.consumer_tag.as_deref() {
                if let Err(err) = self.broker.cancel_consumer(tag).await {
                    warn!(queue, error = %err, "failed to cancel consumer at broker");
                }
            }
        }

        if reason.removes_persisted() {
            if let Err(err) = self.store.remove(queue).await {
                warn!(queue, error = %err, "failed to remove persisted config");
            }
        }

        let summary = StopSummary {
            queue: queue.to_string(),
            message_count: entry.config.message_count,
            reason: reason.as_str(),
        };

        let webhook = Arc::clone(&self.webhook);
        let last_payload = entry.config.last_payload.clone();
        let queue_name = queue.to_string();
        tokio::spawn(async move {
            webhook
                .notify_queue_finish(&queue_name, last_payload.as_ref(), reason.as_str())
                .await;
        });

        info!(queue, reason = reason.as_str(), "consumer stopped");
        Ok(summary)
    }

    pub(super) fn handle_delivery_processed(&mut self, queue: &str, disposition: Disposition) {
        let Some(entry) = self.entries.get_mut(queue) else {
            return;
        };
        entry.config.message_count += 1;
        if disposition.is_success() {
            if let Some(payload) = disposition.payload {
                entry.config.last_payload = Some(payload);
            }
        }
    }

    /// The broker cancelled a consumer out from under us (queue deleted,
    /// forced cancel). Drop the configuration entirely, including from the
    /// store — there is nothing left to resubscribe to.
    pub(super) async fn handle_subscription_closed(&mut self, queue: &str) {
        if !self.entries.contains_key(queue) {
            // Locally initiated teardown already removed the entry.
            return;
        }
        warn!(queue, "consumer cancelled by broker");
        let _ = self.handle_stop(queue, StopReason::ConsumerCancelled).await;
    }
}

/// Everything a per-queue consumer task owns.
pub(super) struct ConsumerTask {
    pub(super) queue: String,
    pub(super) deliveries: mpsc::Receiver<SubscriptionItem>,
    pub(super) snapshot_rx: watch::Receiver<ConsumerSnapshot>,
    pub(super) stop_rx: watch::Receiver<bool>,
    pub(super) broker: Arc<dyn BrokerClient>,
    pub(super) processor: Arc<MessageProcessor>,
    pub(super) engine_tx: mpsc::Sender<EngineCommand>,
    pub(super) next_interval: Duration,
}

/// Per-queue consumer loop: receive -> pace -> process -> report.
///
/// The pacing sleep runs before the pipeline, so the first delivery after
/// (re)subscribing waits a full random interval. Intentional: it bounds
/// throughput from the instant a consumer attaches to a deep queue.
pub(super) async fn run_consumer(mut task: ConsumerTask) {
    loop {
        tokio::select! {
            changed = task.stop_rx.changed() => {
                if changed.is_err() || *task.stop_rx.borrow() {
                    break;
                }
            }
            item = task.deliveries.recv() => {
                let delivery = match item {
                    Some(SubscriptionItem::Delivery(delivery)) => delivery,
                    Some(SubscriptionItem::Cancelled) => {
                        // The broker ended the subscription itself.
                        let _ = task
                            .engine_tx
                            .send(EngineCommand::SubscriptionClosed { queue: task.queue.clone() })
                            .await;
                        break;
                    }
                    None => {
                        // The channel died with the connection. Keep the
                        // configuration: the engine rebuilds this consumer
                        // after reconnection.
                        debug!(queue = %task.queue, "subscription lost, awaiting reconnect");
                        break;
                    }
                };

                let mut stopping = false;
                tokio::select! {
                    _ = tokio::time::sleep(task.next_interval) => {}
                    changed = task.stop_rx.changed() => {
                        if changed.is_err() || *task.stop_rx.borrow() {
                            stopping = true;
                        }
                    }
                }
                if stopping {
                    // Hand the paced delivery straight back to the broker.
                    let _ = task.broker.nack(delivery.delivery_tag, true).await;
                    break;
                }

                let snapshot = task.snapshot_rx.borrow().clone();
                let disposition = task.processor.process_message(&delivery, &snapshot).await;
                if disposition.is_success() {
                    task.next_interval =
                        sample_interval(snapshot.min_interval_ms, snapshot.max_interval_ms);
                }
                let _ = task
                    .engine_tx
                    .send(EngineCommand::DeliveryProcessed {
                        queue: task.queue.clone(),
                        disposition,
                    })
                    .await;
            }
        }
    }
    debug!(queue = %task.queue, "consumer task stopped");
}
