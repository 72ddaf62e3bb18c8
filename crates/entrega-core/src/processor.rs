use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, warn};

use crate::amqp::{BrokerClient, Delivery};
use crate::config::ConsumerSnapshot;
use crate::dedup::{self, DedupStore, InFlightMeta};
use crate::webhook::WebhookSender;

/// The broker operation a pipeline run resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionAction {
    Ack,
    Nack,
    /// No broker operation was (or may be) performed.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionReason {
    Success,
    Duplicate,
    Paused,
    OutsideBusinessHours,
    ParseError,
    WebhookRetry,
    WebhookPermanentError,
    UnexpectedError,
}

/// Outcome of one pipeline run, reported back to the engine for per-queue
/// bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Disposition {
    pub action: DispositionAction,
    pub reason: DispositionReason,
    /// The forwarded payload, present only on `Success`; becomes the
    /// queue's `last_payload`.
    pub payload: Option<serde_json::Value>,
}

impl Disposition {
    fn ack(reason: DispositionReason) -> Self {
        Self {
            action: DispositionAction::Ack,
            reason,
            payload: None,
        }
    }

    fn nack(reason: DispositionReason) -> Self {
        Self {
            action: DispositionAction::Nack,
            reason,
            payload: None,
        }
    }

    fn skip(reason: DispositionReason) -> Self {
        Self {
            action: DispositionAction::Skip,
            reason,
            payload: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.reason == DispositionReason::Success
    }
}

/// Pipeline counters, reset together with the webhook sender's.
#[derive(Default)]
pub struct ProcessorCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    skipped: AtomicU64,
    outside_business_hours: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorStats {
    pub processed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub outside_business_hours: u64,
}

impl ProcessorCounters {
    pub fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            duplicates: self.duplicates.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            outside_business_hours: self.outside_business_hours.load(Ordering::SeqCst),
        }
    }

    pub fn reset(&self) {
        self.processed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.duplicates.store(0, Ordering::SeqCst);
        self.skipped.store(0, Ordering::SeqCst);
        self.outside_business_hours.store(0, Ordering::SeqCst);
    }
}

/// Per-message pipeline: dedup -> pause gate -> business-hours gate ->
/// payload parse -> webhook dispatch -> ack/nack.
///
/// The processor performs the broker operation itself and reports what it
/// did as a [`Disposition`]; the owning consumer task must not ack or nack
/// on top of it.
pub struct MessageProcessor {
    broker: Arc<dyn BrokerClient>,
    dedup: Arc<DedupStore>,
    webhook: Arc<WebhookSender>,
    timezone: Tz,
    counters: ProcessorCounters,
}

impl MessageProcessor {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        dedup: Arc<DedupStore>,
        webhook: Arc<WebhookSender>,
        timezone: Tz,
    ) -> Self {
        Self {
            broker,
            dedup,
            webhook,
            timezone,
            counters: ProcessorCounters::default(),
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        self.counters.snapshot()
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    pub async fn process_message(
        &self,
        delivery: &Delivery,
        config: &ConsumerSnapshot,
    ) -> Disposition {
        let id = dedup::fingerprint(delivery.delivery_tag, &delivery.payload);

        // Duplicate short-circuit. No ack and no nack here: the fingerprint
        // was recorded under an earlier delivery tag, and referencing it now
        // would hit the broker with a stale tag and poison the channel.
        if self.dedup.is_processed(&id) {
            debug!(queue = %config.queue, fingerprint = %id, "duplicate delivery skipped");
            self.counters.duplicates.fetch_add(1, Ordering::SeqCst);
            self.counters.skipped.fetch_add(1, Ordering::SeqCst);
            return Disposition::skip(DispositionReason::Duplicate);
        }

        if config.paused {
            return self.requeue(delivery, DispositionReason::Paused).await;
        }

        let hour = Utc::now().with_timezone(&self.timezone).hour();
        if !config.business_hours.contains(hour) {
            debug!(
                queue = %config.queue,
                hour,
                start = config.business_hours.start_hour,
                end = config.business_hours.end_hour,
                "outside business hours, requeueing"
            );
            self.counters
                .outside_business_hours
                .fetch_add(1, Ordering::SeqCst);
            return self
                .requeue(delivery, DispositionReason::OutsideBusinessHours)
                .await;
        }

        self.dedup.mark_processing(
            &id,
            InFlightMeta {
                delivery_tag: delivery.delivery_tag,
                webhook_url: config.webhook_url.clone(),
            },
        );
        let disposition = self.dispatch(delivery, config, &id).await;
        // Every exit path clears the in-flight entry.
        self.dedup.remove_processing(&id);

        // Counters key off the FINAL reason, in one place, so a settle path
        // that degrades (ack failure after a parse or webhook failure) still
        // counts each message exactly once.
        match disposition.reason {
            DispositionReason::Success => {
                self.counters.processed.fetch_add(1, Ordering::SeqCst);
            }
            DispositionReason::ParseError
            | DispositionReason::WebhookRetry
            | DispositionReason::WebhookPermanentError
            | DispositionReason::UnexpectedError => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        disposition
    }

    async fn dispatch(
        &self,
        delivery: &Delivery,
        config: &ConsumerSnapshot,
        id: &str,
    ) -> Disposition {
        let payload: serde_json::Value = match serde_json::from_slice(&delivery.payload) {
            Ok(payload) => payload,
            Err(err) => {
                // Terminal for this message: a payload that can never parse
                // must not block the queue, so it is acked and dropped.
                warn!(queue = %config.queue, error = %err, "payload is not valid JSON, dropping");
                return self
                    .settle(delivery, id, DispositionReason::ParseError)
                    .await;
            }
        };

        match self
            .webhook
            .send_with_retry(&config.webhook_url, &payload)
            .await
        {
            Ok(outcome) => {
                debug!(queue = %config.queue, status = outcome.status, "payload forwarded");
                let mut disposition = self
                    .settle(delivery, id, DispositionReason::Success)
                    .await;
                if disposition.is_success() {
                    disposition.payload = Some(payload);
                }
                disposition
            }
            Err(err) if err.is_retryable() => {
                warn!(queue = %config.queue, error = %err, "webhook unavailable, requeueing");
                self.requeue(delivery, DispositionReason::WebhookRetry).await
            }
            Err(err) => {
                // 4xx: the hook will never accept this payload. Ack and drop.
                warn!(queue = %config.queue, error = %err, "webhook rejected payload permanently");
                self.settle(delivery, id, DispositionReason::WebhookPermanentError)
                    .await
            }
        }
    }

    /// Ack the delivery and record its fingerprint. A failed ack falls
    /// through to the nack-with-requeue safety net.
    async fn settle(&self, delivery: &Delivery, id: &str, reason: DispositionReason) -> Disposition {
        match self.broker.ack(delivery.delivery_tag).await {
            Ok(()) => {
                self.dedup.mark_processed(id);
                Disposition::ack(reason)
            }
            Err(err) => {
                warn!(delivery_tag = delivery.delivery_tag, error = %err, "ack failed, requeueing");
                self.requeue(delivery, DispositionReason::UnexpectedError)
                    .await
            }
        }
    }

    async fn requeue(&self, delivery: &Delivery, reason: DispositionReason) -> Disposition {
        if let Err(err) = self.broker.nack(delivery.delivery_tag, true).await {
            warn!(delivery_tag = delivery.delivery_tag, error = %err, "nack failed");
        }
        Disposition::nack(reason)
    }
}
