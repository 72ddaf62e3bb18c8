use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::DedupConfig;

/// How many characters of the base64-encoded payload participate in the
/// fingerprint.
const FINGERPRINT_PREFIX_LEN: usize = 20;

/// Seconds to wait for in-flight entries to drain during shutdown.
const DRAIN_TIMEOUT_SECS: u64 = 30;

/// Compute the deduplication fingerprint for a delivery.
///
/// The fingerprint is deliberately tied to the delivery tag: a redelivered
/// message receives a new tag and therefore a new fingerprint, so requeued
/// messages are re-processed rather than suppressed. Empty payloads fall back
/// to a timestamp-based suffix.
pub fn fingerprint(delivery_tag: u64, payload: &[u8]) -> String {
    if payload.is_empty() {
        return format!("{}_{}", delivery_tag, Utc::now().timestamp_millis());
    }
    let encoded = BASE64.encode(payload);
    let prefix_len = encoded.len().min(FINGERPRINT_PREFIX_LEN);
    format!("{}_{}", delivery_tag, &encoded[..prefix_len])
}

/// Metadata recorded alongside an in-flight fingerprint.
#[derive(Debug, Clone)]
pub struct InFlightMeta {
    pub delivery_tag: u64,
    pub webhook_url: String,
}

struct InFlightEntry {
    started_at: Instant,
    #[allow(dead_code)]
    meta: InFlightMeta,
}

#[derive(Default)]
struct DedupState {
    /// Fingerprints of completed deliveries, in insertion order for eviction.
    processed: VecDeque<String>,
    processed_index: HashSet<String>,
    in_flight: HashMap<String, InFlightEntry>,
}

/// Counts exposed on the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct DedupStats {
    pub processed: usize,
    pub in_flight: usize,
    pub max_processed: usize,
}

/// Bounded memory of recently processed message fingerprints, plus the set of
/// fingerprints currently being processed.
///
/// The processed set short-circuits duplicate deliveries WITHOUT any broker
/// operation: an ack or nack on a previously seen fingerprint would reference
/// a stale delivery tag and provoke a channel-level error.
pub struct DedupStore {
    state: Mutex<DedupState>,
    config: DedupConfig,
}

impl DedupStore {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            state: Mutex::new(DedupState::default()),
            config,
        }
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.state.lock().processed_index.contains(id)
    }

    pub fn mark_processed(&self, id: &str) {
        let mut state = self.state.lock();
        if state.processed_index.insert(id.to_string()) {
            state.processed.push_back(id.to_string());
        }
    }

    pub fn is_processing(&self, id: &str) -> bool {
        self.state.lock().in_flight.contains_key(id)
    }

    pub fn mark_processing(&self, id: &str, meta: InFlightMeta) {
        self.state.lock().in_flight.insert(
            id.to_string(),
            InFlightEntry {
                started_at: Instant::now(),
                meta,
            },
        );
    }

    pub fn remove_processing(&self, id: &str) {
        self.state.lock().in_flight.remove(id);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.processed.clear();
        state.processed_index.clear();
        state.in_flight.clear();
    }

    pub fn stats(&self) -> DedupStats {
        let state = self.state.lock();
        DedupStats {
            processed: state.processed.len(),
            in_flight: state.in_flight.len(),
            max_processed: self.config.max_processed,
        }
    }

    /// One maintenance pass: evict oldest processed fingerprints beyond the
    /// bound, and drop in-flight entries older than the stale cutoff.
    pub fn sweep(&self) {
        let stale = Duration::from_millis(self.config.stale_ms);
        let mut state = self.state.lock();

        while state.processed.len() > self.config.max_processed {
            if let Some(oldest) = state.processed.pop_front() {
                state.processed_index.remove(&oldest);
            }
        }

        let before = state.in_flight.len();
        state
            .in_flight
            .retain(|_, entry| entry.started_at.elapsed() < stale);
        let dropped = before - state.in_flight.len();
        if dropped > 0 {
            warn!(dropped, "swept stale in-flight fingerprints");
        }
    }

    /// Run periodic sweeps until the shutdown signal flips.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.cleanup_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("dedup sweeper stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Wait up to 30 s for in-flight entries to drain, polling at 1 s, then
    /// forcibly clear everything.
    pub async fn shutdown(&self) {
        for _ in 0..DRAIN_TIMEOUT_SECS {
            let in_flight = self.state.lock().in_flight.len();
            if in_flight == 0 {
                break;
            }
            debug!(in_flight, "waiting for in-flight deliveries to drain");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let remaining = self.state.lock().in_flight.len();
        if remaining > 0 {
            warn!(remaining, "drain timeout expired, clearing in-flight entries");
        }
        self.clear();
        info!("dedup store shut down");
    }
}
