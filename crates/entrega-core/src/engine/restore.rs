use super::*;

impl EngineCore {
    /// Restore consumers from the persistence store. Queues already being
    /// consumed are skipped; queues that no longer exist at the broker are
    /// collected and removed from the store after the loop.
    pub(super) async fn restore_persisted(&mut self) -> RestoreSummary {
        let stored = match self.store.load_all().await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "failed to read persisted configs");
                return RestoreSummary::default();
            }
        };

        if stored.is_empty() {
            info!("no persisted consumers to restore");
            return RestoreSummary::default();
        }

        let mut summary = RestoreSummary::default();
        for (queue, persisted) in stored {
            if self.entries.contains_key(&queue) {
                summary.skipped += 1;
                continue;
            }

            let request = StartRequest {
                queue: queue.clone(),
                webhook_url: persisted.webhook_url,
                min_interval_ms: Some(persisted.min_interval_ms),
                max_interval_ms: Some(persisted.max_interval_ms),
                business_hours: Some(persisted.business_hours),
            };
            match self.handle_start(request).await {
                Ok(()) => summary.restored += 1,
                Err(StartError::QueueNotFound(_)) => {
                    warn!(queue, "persisted queue no longer exists, dropping config");
                    summary.removed.push(queue);
                }
                Err(err) => {
                    warn!(queue, error = %err, "failed to restore consumer");
                    summary.failed += 1;
                }
            }
        }

        for queue in &summary.removed {
            if let Err(err) = self.store.remove(queue).await {
                warn!(queue, error = %err, "failed to drop stale persisted config");
            }
        }

        info!(
            restored = summary.restored,
            failed = summary.failed,
            skipped = summary.skipped,
            removed = summary.removed.len(),
            "restore finished"
        );
        summary
    }

    /// Rebuild every consumer from the in-memory table after a reconnect.
    /// The old subscriptions died with the previous channel; each entry's
    /// config (including `paused`, `message_count` and `last_payload`) is
    /// carried onto the fresh subscription unchanged.
    pub(super) async fn reestablish_consumers(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        let entries = std::mem::take(&mut self.entries);
        info!(count = entries.len(), "re-establishing consumers after reconnect");

        for (queue, entry) in entries {
            let _ = entry.stop_tx.send(true);
            entry.task.abort();

            let mut config = entry.config;
            config.consumer_tag = None;

            match self.install_consumer(config, false).await {
                Ok(()) => debug!(queue, "consumer re-established"),
                Err(err) => {
                    // Left out of the in-memory table but kept in the store:
                    // the next restart (or restore call) retries it.
                    warn!(queue, error = %err, "failed to re-establish consumer");
                }
            }
        }
    }
}
