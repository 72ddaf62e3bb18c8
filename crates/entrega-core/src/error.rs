use crate::config::ConfigValidationError;

/// Low-level persistence errors (filesystem, serialization).
/// This is the error type for the config store — store operations can only
/// fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid store document: {0}")]
    InvalidDocument(String),
}

/// Broker transport and protocol errors, as surfaced by the AMQP client.
///
/// `code` carries the AMQP reply code when the broker library exposes one;
/// the error classifier prefers it over message substrings.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker not connected")]
    NotConnected,

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("access refused for queue: {0}")]
    AccessRefused(String),

    #[error("amqp error (code {code:?}): {message}")]
    Protocol { code: Option<u16>, message: String },

    #[error("broker io error: {0}")]
    Io(String),
}

impl BrokerError {
    /// AMQP reply code when one is known, for the error classifier.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            BrokerError::QueueNotFound(_) => Some(404),
            BrokerError::AccessRefused(_) => Some(403),
            BrokerError::Protocol { code, .. } => *code,
            _ => None,
        }
    }
}

/// Webhook dispatch failure, already categorised for the retry decision.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// 4xx response. The message is permanently undeliverable to this hook.
    #[error("webhook rejected payload with status {status}")]
    Terminal { status: u16 },

    /// 5xx response.
    #[error("webhook failed with status {status}")]
    ServerError { status: u16 },

    /// Timeout or connection-level failure.
    #[error("webhook transport error: {0}")]
    Transport(String),
}

impl WebhookError {
    /// Whether a retry (and ultimately a requeue) is warranted.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, WebhookError::Terminal { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Validation(#[from] ConfigValidationError),

    #[error("queue already being consumed: {0}")]
    AlreadyConsuming(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error(transparent)]
    Broker(BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<BrokerError> for StartError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::QueueNotFound(q) => StartError::QueueNotFound(q),
            other => StartError::Broker(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PauseError {
    #[error("queue not being consumed: {0}")]
    NotConsuming(String),

    #[error("queue already paused: {0}")]
    AlreadyPaused(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("queue not being consumed: {0}")]
    NotConsuming(String),

    #[error("queue not paused: {0}")]
    NotPaused(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("queue not being consumed: {0}")]
    NotConsuming(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueInfoError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error(transparent)]
    Broker(BrokerError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<BrokerError> for QueueInfoError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::QueueNotFound(q) => QueueInfoError::QueueNotFound(q),
            other => QueueInfoError::Broker(other),
        }
    }
}

/// Errors from the engine handle itself (actor unavailable or overloaded).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine command channel full")]
    ChannelFull,

    #[error("engine unavailable")]
    ChannelDisconnected,

    #[error("engine reply channel dropped")]
    ReplyDropped,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
