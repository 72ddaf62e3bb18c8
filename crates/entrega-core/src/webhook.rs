use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::WebhookConfig;
use crate::error::WebhookError;

/// Outcome of a single accepted webhook call.
#[derive(Debug, Clone, Copy)]
pub struct SendOutcome {
    pub status: u16,
    pub elapsed: Duration,
}

/// Result of a connectivity probe against a candidate webhook.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub success: bool,
    pub status: Option<u16>,
    pub elapsed_ms: u64,
}

/// Running dispatch counters.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStats {
    pub sent: u64,
    pub failed: u64,
    pub retries: u64,
    pub avg_response_ms: u64,
}

#[derive(Default)]
struct Counters {
    sent: u64,
    failed: u64,
    retries: u64,
    total_response_ms: u64,
    samples: u64,
}

/// HTTP forwarder for message payloads: one JSON POST per delivery, with
/// per-call timeout, exponential-backoff retry and status classification
/// (2xx/3xx success, 4xx terminal, 5xx/network/timeout retryable).
pub struct WebhookSender {
    client: reqwest::Client,
    config: WebhookConfig,
    /// Global target for consumer-termination notifications, if configured.
    finish_webhook: Option<String>,
    counters: Mutex<Counters>,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig, finish_webhook: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            finish_webhook,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Issue a single POST. A response arriving at all records a latency
    /// sample; only 2xx/3xx count as sent.
    pub async fn send(
        &self,
        url: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<SendOutcome, WebhookError> {
        let start = Instant::now();
        let response = self
            .client
            .post(url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await;

        let elapsed = start.elapsed();
        match response {
            Ok(resp) => {
                let status = resp.status();
                self.record_sample(elapsed);
                if status.is_success() || status.is_redirection() {
                    self.counters.lock().sent += 1;
                    Ok(SendOutcome {
                        status: status.as_u16(),
                        elapsed,
                    })
                } else if status.is_client_error() {
                    self.counters.lock().failed += 1;
                    Err(WebhookError::Terminal {
                        status: status.as_u16(),
                    })
                } else {
                    self.counters.lock().failed += 1;
                    Err(WebhookError::ServerError {
                        status: status.as_u16(),
                    })
                }
            }
            Err(err) => {
                self.counters.lock().failed += 1;
                if err.is_timeout() {
                    Err(WebhookError::Transport(format!(
                        "timeout after {} ms",
                        elapsed.as_millis()
                    )))
                } else {
                    Err(WebhookError::Transport(err.to_string()))
                }
            }
        }
    }

    /// Repeat `send` up to the configured attempt count with delay
    /// `base * 2^(attempt-1)`, aborting early on a terminal (4xx) outcome.
    pub async fn send_with_retry(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<SendOutcome, WebhookError> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let attempts = self.config.attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self.send(url, payload, timeout).await {
                Ok(outcome) => {
                    debug!(url, attempt, status = outcome.status, elapsed_ms = outcome.elapsed.as_millis() as u64, "webhook accepted payload");
                    return Ok(outcome);
                }
                Err(err) => {
                    let retryable = err.is_retryable() && attempt < attempts;
                    warn!(url, attempt, error = %err, retryable, "webhook attempt failed");
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    last_err = Some(err);
                    if attempt < attempts {
                        self.counters.lock().retries += 1;
                        let delay = self.config.base_delay_ms * 2u64.pow(attempt - 1);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| WebhookError::Transport("no attempts made".into())))
    }

    /// Probe a candidate webhook with a small well-known payload and a short
    /// timeout. Never counts toward the dispatch statistics' failure total.
    pub async fn test_webhook(&self, url: &str, timeout_ms: Option<u64>) -> ProbeReport {
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(self.config.probe_timeout_ms));
        let probe = json!({
            "test": true,
            "source": "entrega",
            "sent_at": chrono::Utc::now().to_rfc3339(),
        });

        let start = Instant::now();
        let result = self
            .client
            .post(url)
            .json(&probe)
            .timeout(timeout)
            .send()
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) => {
                let status = resp.status();
                ProbeReport {
                    success: status.is_success() || status.is_redirection(),
                    status: Some(status.as_u16()),
                    elapsed_ms,
                }
            }
            Err(_) => ProbeReport {
                success: false,
                status: None,
                elapsed_ms,
            },
        }
    }

    /// Best-effort notification that a consumer terminated. Failures are
    /// logged and never propagate to callers.
    pub async fn notify_queue_finish(
        &self,
        queue: &str,
        last_payload: Option<&serde_json::Value>,
        reason: &str,
    ) {
        let Some(url) = self.finish_webhook.as_deref() else {
            return;
        };

        let body = json!({
            "queue": queue,
            "reason": reason,
            "last_payload": last_payload,
            "finished_at": chrono::Utc::now().to_rfc3339(),
        });

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match self.client.post(url).json(&body).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                debug!(queue, reason, "finish notification delivered");
            }
            Ok(resp) => {
                warn!(queue, reason, status = resp.status().as_u16(), "finish notification rejected");
            }
            Err(err) => {
                warn!(queue, reason, error = %err, "finish notification failed");
            }
        }
    }

    pub fn stats(&self) -> WebhookStats {
        let counters = self.counters.lock();
        let avg_response_ms = if counters.samples > 0 {
            counters.total_response_ms / counters.samples
        } else {
            0
        };
        WebhookStats {
            sent: counters.sent,
            failed: counters.failed,
            retries: counters.retries,
            avg_response_ms,
        }
    }

    pub fn reset_stats(&self) {
        *self.counters.lock() = Counters::default();
    }

    fn record_sample(&self, elapsed: Duration) {
        let mut counters = self.counters.lock();
        counters.total_response_ms += elapsed.as_millis() as u64;
        counters.samples += 1;
    }
}
