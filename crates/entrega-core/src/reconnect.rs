use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::amqp::{BrokerClient, BrokerEvent};
use crate::config::ReconnectConfig;

/// Settle time between dropping dead handles and dialling the broker again.
const CLEANUP_SETTLE: Duration = Duration::from_secs(1);

/// Outcomes the controller reports to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    Started { attempt: u32, reason: String },
    /// The broker is connected again; the engine should re-establish all
    /// consumers from its in-memory table.
    Successful,
    Failed { reason: String },
    MaxAttemptsReached,
}

/// Shared counters surfaced on the stats tree.
#[derive(Default)]
pub struct ReconnectStats {
    attempts: AtomicU32,
    in_progress: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectStatsSnapshot {
    pub attempts: u32,
    pub in_progress: bool,
}

impl ReconnectStats {
    pub fn snapshot(&self) -> ReconnectStatsSnapshot {
        ReconnectStatsSnapshot {
            attempts: self.attempts.load(Ordering::SeqCst),
            in_progress: self.in_progress.load(Ordering::SeqCst),
        }
    }
}

/// Handle for driving an immediate reconnection attempt, bypassing the
/// backoff timer. The guard chain (debounce, attempt cap) still applies.
#[derive(Clone)]
pub struct ReconnectHandle {
    force_tx: mpsc::Sender<String>,
}

impl ReconnectHandle {
    pub async fn force_reconnect(&self, reason: impl Into<String>) {
        let _ = self.force_tx.send(reason.into()).await;
    }
}

enum Decision {
    Attempt,
    Skip(&'static str),
    Exhausted,
}

enum AttemptOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Backoff + debounce scheduler driving reconnects on broker failure.
///
/// Consumes [`BrokerEvent`]s; any failure-class event (re)arms the single
/// pending timer, so a storm of error events between two attempts collapses
/// into one scheduled attempt. The guard chain runs when the timer fires.
pub struct ReconnectController {
    broker: Arc<dyn BrokerClient>,
    config: ReconnectConfig,
    stats: Arc<ReconnectStats>,
    outcomes: mpsc::UnboundedSender<ReconnectEvent>,
    force_rx: mpsc::Receiver<String>,
    attempts: u32,
    in_progress: bool,
    last_attempt: Option<Instant>,
    shutting_down: bool,
}

impl ReconnectController {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        config: ReconnectConfig,
        stats: Arc<ReconnectStats>,
        outcomes: mpsc::UnboundedSender<ReconnectEvent>,
    ) -> (Self, ReconnectHandle) {
        let (force_tx, force_rx) = mpsc::channel(4);
        let controller = Self {
            broker,
            config,
            stats,
            outcomes,
            force_rx,
            attempts: 0,
            in_progress: false,
            last_attempt: None,
            shutting_down: false,
        };
        (controller, ReconnectHandle { force_tx })
    }

    /// Run until the shutdown signal flips or the event channel closes.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<BrokerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Deadline and reason of the single pending attempt, if any.
        let mut pending: Option<(Instant, String)> = None;

        loop {
            let deadline = pending.as_ref().map(|(deadline, _)| *deadline);
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconnection controller stopping");
                        self.shutting_down = true;
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        None => break,
                        Some(event) if event.triggers_reconnection() => {
                            self.schedule(event.reason().to_string(), &mut pending);
                        }
                        Some(_) => {}
                    }
                }
                reason = self.force_rx.recv() => {
                    if let Some(reason) = reason {
                        pending = None;
                        if matches!(self.attempt(reason).await, AttemptOutcome::Failed) {
                            self.schedule("retry-after-failure".to_string(), &mut pending);
                        }
                    }
                }
                _ = timer => {
                    if let Some((_, reason)) = pending.take() {
                        if matches!(self.attempt(reason).await, AttemptOutcome::Failed) {
                            self.schedule("retry-after-failure".to_string(), &mut pending);
                        }
                    }
                }
            }
        }
    }

    /// Guard chain deciding whether an attempt may run, in priority order.
    fn should_attempt(&self) -> Decision {
        if self.shutting_down {
            return Decision::Skip("shutting down");
        }
        if self.in_progress {
            return Decision::Skip("attempt in progress");
        }
        if self.broker.is_channel_ready() {
            return Decision::Skip("channel healthy");
        }
        if let Some(last) = self.last_attempt {
            if last.elapsed() < Duration::from_millis(self.config.debounce_ms) {
                return Decision::Skip("debounced");
            }
        }
        if self.attempts >= self.config.max_attempts {
            return Decision::Exhausted;
        }
        Decision::Attempt
    }

    /// Exponential backoff for the next attempt, capped at the ceiling.
    fn backoff_delay(&self) -> Duration {
        let exp = self.config.multiplier.powi(self.attempts as i32);
        let delay = (self.config.base_delay_ms as f64 * exp).round() as u64;
        Duration::from_millis(delay.min(self.config.max_delay_ms))
    }

    /// (Re)arm the pending timer. Always replaces an existing deadline —
    /// whether the attempt actually runs is decided when the timer fires.
    fn schedule(&mut self, reason: String, pending: &mut Option<(Instant, String)>) {
        if self.shutting_down {
            return;
        }
        let delay = self.backoff_delay();
        debug!(reason, delay_ms = delay.as_millis() as u64, "reconnection scheduled");
        *pending = Some((Instant::now() + delay, reason));
    }

    async fn attempt(&mut self, reason: String) -> AttemptOutcome {
        match self.should_attempt() {
            Decision::Attempt => {}
            Decision::Exhausted => {
                warn!(attempts = self.attempts, "reconnection attempts exhausted");
                let _ = self.outcomes.send(ReconnectEvent::MaxAttemptsReached);
                return AttemptOutcome::Skipped;
            }
            Decision::Skip(why) => {
                debug!(reason, why, "skipping reconnection attempt");
                return AttemptOutcome::Skipped;
            }
        }

        self.in_progress = true;
        self.attempts += 1;
        self.last_attempt = Some(Instant::now());
        self.stats.attempts.store(self.attempts, Ordering::SeqCst);
        self.stats.in_progress.store(true, Ordering::SeqCst);
        let _ = self.outcomes.send(ReconnectEvent::Started {
            attempt: self.attempts,
            reason: reason.clone(),
        });
        info!(attempt = self.attempts, reason, "reconnecting to broker");

        self.broker.cleanup().await;
        tokio::time::sleep(CLEANUP_SETTLE).await;

        let outcome = self.broker.connect().await;
        self.in_progress = false;
        self.stats.in_progress.store(false, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                info!("reconnection successful");
                self.attempts = 0;
                self.stats.attempts.store(0, Ordering::SeqCst);
                let _ = self.outcomes.send(ReconnectEvent::Successful);
                AttemptOutcome::Succeeded
            }
            Err(err) => {
                warn!(attempt = self.attempts, error = %err, "reconnection failed");
                let _ = self.outcomes.send(ReconnectEvent::Failed {
                    reason: err.to_string(),
                });
                AttemptOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::{QueueSnapshot, Subscription};
    use crate::error::{BrokerError, BrokerResult};
    use std::sync::atomic::AtomicU32 as StdAtomicU32;

    /// Broker stub: fails `fail_first` connect attempts, then succeeds.
    struct FlakyBroker {
        connect_calls: StdAtomicU32,
        fail_first: u32,
        ready: AtomicBool,
    }

    impl FlakyBroker {
        fn new(fail_first: u32) -> Self {
            Self {
                connect_calls: StdAtomicU32::new(0),
                fail_first,
                ready: AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl BrokerClient for FlakyBroker {
        async fn connect(&self) -> BrokerResult<()> {
            let call = self.connect_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(BrokerError::Io("ECONNREFUSED".to_string()))
            } else {
                self.ready.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        async fn disconnect(&self) {}

        async fn cleanup(&self) {
            self.ready.store(false, Ordering::SeqCst);
        }

        fn is_channel_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn check_queue(&self, _queue: &str) -> BrokerResult<QueueSnapshot> {
            Err(BrokerError::NotConnected)
        }

        async fn consume(&self, _queue: &str) -> BrokerResult<Subscription> {
            Err(BrokerError::NotConnected)
        }

        async fn cancel_consumer(&self, _tag: &str) -> BrokerResult<()> {
            Ok(())
        }

        async fn ack(&self, _tag: u64) -> BrokerResult<()> {
            Ok(())
        }

        async fn nack(&self, _tag: u64, _requeue: bool) -> BrokerResult<()> {
            Ok(())
        }
    }

    fn fast_config() -> ReconnectConfig {
        ReconnectConfig {
            debounce_ms: 50,
            max_attempts: 10,
            base_delay_ms: 100,
            multiplier: 1.5,
            max_delay_ms: 2_000,
        }
    }

    fn setup(
        broker: Arc<FlakyBroker>,
        config: ReconnectConfig,
    ) -> (
        ReconnectController,
        ReconnectHandle,
        mpsc::UnboundedReceiver<ReconnectEvent>,
        Arc<ReconnectStats>,
    ) {
        let stats = Arc::new(ReconnectStats::default());
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (controller, handle) =
            ReconnectController::new(broker, config, Arc::clone(&stats), outcome_tx);
        (controller, handle, outcome_rx, stats)
    }

    #[test]
    fn backoff_grows_and_caps() {
        let broker = Arc::new(FlakyBroker::new(0));
        let (mut controller, _handle, _rx, _stats) = setup(broker, fast_config());

        assert_eq!(controller.backoff_delay(), Duration::from_millis(100));
        controller.attempts = 1;
        assert_eq!(controller.backoff_delay(), Duration::from_millis(150));
        controller.attempts = 20;
        assert_eq!(controller.backoff_delay(), Duration::from_millis(2_000));
    }

    #[test]
    fn guards_run_in_priority_order() {
        let broker = Arc::new(FlakyBroker::new(0));
        let (mut controller, _handle, _rx, _stats) = setup(Arc::clone(&broker), fast_config());

        controller.shutting_down = true;
        assert!(matches!(controller.should_attempt(), Decision::Skip("shutting down")));
        controller.shutting_down = false;

        controller.in_progress = true;
        assert!(matches!(controller.should_attempt(), Decision::Skip("attempt in progress")));
        controller.in_progress = false;

        broker.ready.store(true, Ordering::SeqCst);
        assert!(matches!(controller.should_attempt(), Decision::Skip("channel healthy")));
        broker.ready.store(false, Ordering::SeqCst);

        controller.attempts = 10;
        assert!(matches!(controller.should_attempt(), Decision::Exhausted));
        controller.attempts = 0;

        assert!(matches!(controller.should_attempt(), Decision::Attempt));
    }

    #[tokio::test(start_paused = true)]
    async fn error_event_drives_successful_reconnect() {
        let broker = Arc::new(FlakyBroker::new(0));
        let (controller, _handle, mut outcomes, _stats) = setup(Arc::clone(&broker), fast_config());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(controller.run(event_rx, shutdown_rx));

        event_tx
            .send(BrokerEvent::ChannelError("socket closed".to_string()))
            .unwrap();

        assert!(matches!(
            outcomes.recv().await,
            Some(ReconnectEvent::Started { attempt: 1, .. })
        ));
        assert_eq!(outcomes.recv().await, Some(ReconnectEvent::Successful));
        assert_eq!(broker.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn event_storm_collapses_into_one_attempt() {
        let broker = Arc::new(FlakyBroker::new(0));
        let (controller, _handle, mut outcomes, _stats) = setup(Arc::clone(&broker), fast_config());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(controller.run(event_rx, shutdown_rx));

        for _ in 0..10 {
            event_tx
                .send(BrokerEvent::ConnectionError("ECONNRESET".to_string()))
                .unwrap();
        }

        assert!(matches!(
            outcomes.recv().await,
            Some(ReconnectEvent::Started { attempt: 1, .. })
        ));
        assert_eq!(outcomes.recv().await, Some(ReconnectEvent::Successful));
        assert_eq!(broker.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_reschedules_with_backoff() {
        let broker = Arc::new(FlakyBroker::new(2));
        let (controller, _handle, mut outcomes, _stats) = setup(Arc::clone(&broker), fast_config());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(controller.run(event_rx, shutdown_rx));

        event_tx
            .send(BrokerEvent::NeedsReconnection("channel closed".to_string()))
            .unwrap();

        let mut started = 0;
        loop {
            match outcomes.recv().await.unwrap() {
                ReconnectEvent::Started { .. } => started += 1,
                ReconnectEvent::Failed { .. } => {}
                ReconnectEvent::Successful => break,
                ReconnectEvent::MaxAttemptsReached => panic!("should not exhaust"),
            }
        }
        assert_eq!(started, 3);
        assert_eq!(broker.connect_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn force_reconnect_bypasses_pending_timer() {
        let broker = Arc::new(FlakyBroker::new(0));
        let (controller, handle, mut outcomes, _stats) = setup(Arc::clone(&broker), fast_config());

        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(controller.run(event_rx, shutdown_rx));

        handle.force_reconnect("startup connect failed").await;

        assert!(matches!(
            outcomes.recv().await,
            Some(ReconnectEvent::Started { attempt: 1, .. })
        ));
        assert_eq!(outcomes.recv().await, Some(ReconnectEvent::Successful));
    }
}
