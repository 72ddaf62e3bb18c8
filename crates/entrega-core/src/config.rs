use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive-exclusive daily window `[start_hour, end_hour)` evaluated in the
/// engine's configured timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl BusinessHours {
    pub const DEFAULT: BusinessHours = BusinessHours {
        start_hour: 8,
        end_hour: 21,
    };

    /// Whether the given local hour falls inside the window.
    pub fn contains(&self, hour: u32) -> bool {
        hour >= self.start_hour && hour < self.end_hour
    }
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Per-queue consumer configuration. One exists per active queue, keyed by
/// queue name, owned and mutated only by the engine actor. Serialises in
/// the control plane's casing; the persisted subset lives in the store's
/// own document type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    pub queue: String,
    pub webhook_url: String,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub business_hours: BusinessHours,
    pub paused: bool,
    /// Broker-assigned (or client-proposed, broker-acknowledged) subscription
    /// token. None while no subscription is live.
    pub consumer_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub message_count: u64,
    /// Last successfully forwarded payload, carried into the finish
    /// notification when the consumer terminates.
    pub last_payload: Option<serde_json::Value>,
}

/// Floor for `min_interval_ms` after sanitisation.
pub const MIN_INTERVAL_FLOOR_MS: u64 = 1_000;
/// Minimum gap enforced between `min` and `max` after sanitisation.
pub const MIN_INTERVAL_GAP_MS: u64 = 1_000;

impl ConsumerConfig {
    pub fn new(
        queue: impl Into<String>,
        webhook_url: impl Into<String>,
        min_interval_ms: u64,
        max_interval_ms: u64,
        business_hours: BusinessHours,
    ) -> Self {
        Self {
            queue: queue.into(),
            webhook_url: webhook_url.into(),
            min_interval_ms,
            max_interval_ms,
            business_hours,
            paused: false,
            consumer_tag: None,
            created_at: Utc::now(),
            message_count: 0,
            last_payload: None,
        }
    }

    /// Clamp the interval bounds: `min` is floored at 1000 ms and `max` is
    /// raised to at least `min + 1000` ms.
    pub fn sanitise_intervals(min_interval_ms: u64, max_interval_ms: u64) -> (u64, u64) {
        let min = min_interval_ms.max(MIN_INTERVAL_FLOOR_MS);
        let max = max_interval_ms.max(min + MIN_INTERVAL_GAP_MS);
        (min, max)
    }

    /// The read-only view a per-queue consumer task observes through its
    /// watch channel. Re-published by the engine on every config mutation.
    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            queue: self.queue.clone(),
            webhook_url: self.webhook_url.clone(),
            min_interval_ms: self.min_interval_ms,
            max_interval_ms: self.max_interval_ms,
            business_hours: self.business_hours,
            paused: self.paused,
        }
    }
}

/// Copy-on-read view of a [`ConsumerConfig`], published over a watch channel
/// so consumer tasks never hold references into engine-owned state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSnapshot {
    pub queue: String,
    pub webhook_url: String,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub business_hours: BusinessHours,
    pub paused: bool,
}

/// Reasons a consumer configuration failed validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("webhook url must be absolute http(s): {0}")]
    InvalidWebhookUrl(String),

    #[error("min interval {min} must be below max interval {max}")]
    InvalidIntervals { min: u64, max: u64 },

    #[error("business hours {start}..{end} out of range (0 <= start < end <= 24)")]
    InvalidBusinessHours { start: u32, end: u32 },
}

/// Validate a consumer configuration request. Interval bounds are checked
/// after sanitisation, matching what the engine will actually run with.
pub fn validate_consumer_config(
    webhook_url: &str,
    min_interval_ms: u64,
    max_interval_ms: u64,
    business_hours: BusinessHours,
) -> Result<(), ConfigValidationError> {
    if !webhook_url.starts_with("http://") && !webhook_url.starts_with("https://") {
        return Err(ConfigValidationError::InvalidWebhookUrl(
            webhook_url.to_string(),
        ));
    }

    let (min, max) = ConsumerConfig::sanitise_intervals(min_interval_ms, max_interval_ms);
    if min >= max {
        return Err(ConfigValidationError::InvalidIntervals { min, max });
    }

    let BusinessHours {
        start_hour,
        end_hour,
    } = business_hours;
    if end_hour > 24 || start_hour >= end_hour {
        return Err(ConfigValidationError::InvalidBusinessHours {
            start: start_hour,
            end: end_hour,
        });
    }

    Ok(())
}

/// Top-level engine configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub engine: EngineTuning,
    pub dedup: DedupConfig,
    pub webhook: WebhookConfig,
    pub reconnect: ReconnectConfig,
}

/// HTTP control-plane listen address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

/// Persistence store location.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

/// Engine-level tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineTuning {
    /// IANA timezone the business-hours gate evaluates in.
    pub timezone: String,
    /// Interval between queue-health sweeps.
    pub health_check_interval_secs: u64,
    /// Capacity of the engine command channel.
    pub command_channel_capacity: usize,
}

/// Deduplication store bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Maximum retained processed fingerprints; oldest are evicted on each
    /// cleanup tick.
    pub max_processed: usize,
    pub cleanup_interval_ms: u64,
    /// In-flight entries older than this are considered abandoned and swept.
    pub stale_ms: u64,
}

/// Webhook dispatch behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub attempts: u32,
    pub base_delay_ms: u64,
}

/// Reconnection backoff and debounce parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub debounce_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "./data/queue-configurations.json".to_string(),
        }
    }
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            timezone: "America/Sao_Paulo".to_string(),
            health_check_interval_secs: 300,
            command_channel_capacity: 1_024,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_processed: 10_000,
            cleanup_interval_ms: 60_000,
            stale_ms: 300_000,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            probe_timeout_ms: 5_000,
            attempts: 3,
            base_delay_ms: 1_000,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 3_000,
            max_attempts: 10,
            base_delay_ms: 5_000,
            multiplier: 1.5,
            max_delay_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:3000");
        assert_eq!(config.store.path, "./data/queue-configurations.json");
        assert_eq!(config.engine.timezone, "America/Sao_Paulo");
        assert_eq!(config.engine.health_check_interval_secs, 300);
        assert_eq!(config.dedup.max_processed, 10_000);
        assert_eq!(config.dedup.cleanup_interval_ms, 60_000);
        assert_eq!(config.dedup.stale_ms, 300_000);
        assert_eq!(config.webhook.timeout_ms, 10_000);
        assert_eq!(config.webhook.attempts, 3);
        assert_eq!(config.reconnect.debounce_ms, 3_000);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.reconnect.max_delay_ms, 60_000);
    }

    #[test]
    fn toml_parsing_with_overrides() {
        let toml_str = r#"
            [server]
            listen_addr = "127.0.0.1:9999"

            [engine]
            timezone = "UTC"
            health_check_interval_secs = 60

            [reconnect]
            max_attempts = 3
            multiplier = 2.0
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.engine.timezone, "UTC");
        assert_eq!(config.engine.health_check_interval_secs, 60);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.multiplier, 2.0);
        // Untouched sections keep their defaults
        assert_eq!(config.dedup.max_processed, 10_000);
        assert_eq!(config.webhook.timeout_ms, 10_000);
    }

    #[test]
    fn toml_parsing_empty_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.timezone, "America/Sao_Paulo");
        assert_eq!(config.reconnect.base_delay_ms, 5_000);
    }

    #[test]
    fn sanitise_floors_min_and_spreads_max() {
        assert_eq!(ConsumerConfig::sanitise_intervals(200, 500), (1_000, 2_000));
        assert_eq!(
            ConsumerConfig::sanitise_intervals(30_000, 110_000),
            (30_000, 110_000)
        );
        assert_eq!(
            ConsumerConfig::sanitise_intervals(5_000, 5_000),
            (5_000, 6_000)
        );
    }

    #[test]
    fn validation_rejects_bad_webhook_url() {
        let err = validate_consumer_config("ftp://host/hook", 30_000, 110_000, BusinessHours::DEFAULT)
            .unwrap_err();
        assert!(matches!(err, ConfigValidationError::InvalidWebhookUrl(_)));
    }

    #[test]
    fn validation_rejects_inverted_business_hours() {
        let err = validate_consumer_config(
            "https://host/hook",
            30_000,
            110_000,
            BusinessHours {
                start_hour: 21,
                end_hour: 8,
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigValidationError::InvalidBusinessHours { start: 21, end: 8 }
        ));
    }

    #[test]
    fn validation_accepts_full_day_window() {
        validate_consumer_config(
            "https://host/hook",
            30_000,
            110_000,
            BusinessHours {
                start_hour: 0,
                end_hour: 24,
            },
        )
        .unwrap();
    }

    #[test]
    fn business_hours_window_is_half_open() {
        let hours = BusinessHours {
            start_hour: 8,
            end_hour: 21,
        };
        assert!(!hours.contains(7));
        assert!(hours.contains(8));
        assert!(hours.contains(20));
        assert!(!hours.contains(21));
    }
}
