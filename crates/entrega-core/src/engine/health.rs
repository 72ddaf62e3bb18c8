use super::*;

use crate::amqp::classify::classify;

/// Message substrings that mean the queue itself is gone. Narrower than the
/// broker client's queue-scoped classification on purpose: a 403 on a live
/// queue is a permissions problem, not a deletion, and must never tear the
/// consumer down.
const NOT_FOUND_SUBSTRINGS: [&str; 2] = ["not_found", "does not exist"];

impl EngineCore {
    /// Periodic queue-health sweep: probe every active queue and react to
    /// what the broker reports.
    ///
    /// - queue missing: the external-deletion flow tears the consumer down
    /// - transport failure: emit `NeedsReconnection` and abort the sweep
    /// - anything else (access refused included): log and keep probing
    pub(super) async fn health_sweep(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        if !self.broker.is_channel_ready() {
            warn!("health check: channel not ready");
            let _ = self.events_tx.send(BrokerEvent::NeedsReconnection(
                "health check found channel closed".to_string(),
            ));
            return;
        }

        let queues: Vec<String> = self.entries.keys().cloned().collect();
        debug!(count = queues.len(), "running queue health sweep");

        for queue in queues {
            match self.broker.check_queue(&queue).await {
                Ok(_) => {}
                Err(BrokerError::NotConnected) => {
                    let _ = self.events_tx.send(BrokerEvent::NeedsReconnection(
                        "connection lost during health sweep".to_string(),
                    ));
                    return;
                }
                Err(BrokerError::QueueNotFound(_)) => {
                    self.handle_external_deletion(&queue).await;
                }
                Err(err) => {
                    let message = err.to_string().to_lowercase();
                    if NOT_FOUND_SUBSTRINGS.iter().any(|s| message.contains(s)) {
                        self.handle_external_deletion(&queue).await;
                    } else if classify(err.reply_code(), &message).triggers_reconnection() {
                        let _ = self
                            .events_tx
                            .send(BrokerEvent::NeedsReconnection(err.to_string()));
                        return;
                    } else {
                        warn!(queue, error = %err, "health check error");
                    }
                }
            }
        }
    }

    /// A queue disappeared at the broker. Remove its consumer and stored
    /// config, and fire the finish notification. The consumer tag is NOT
    /// cancelled: the subscription died with the queue, and a cancel on a
    /// dead consumer would only produce channel errors.
    pub(super) async fn handle_external_deletion(&mut self, queue: &str) {
        warn!(queue, "queue deleted externally");
        let _ = self
            .handle_stop(queue, StopReason::QueueDeletedExternally)
            .await;
    }
}
