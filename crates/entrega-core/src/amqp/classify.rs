/// What a channel-operation error means for the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport-level breakage: schedule a reconnection.
    Reconnect,
    /// Scoped to a single queue (missing or access-refused): the connection
    /// is fine, handle at the queue level.
    QueueScoped,
    /// A stale delivery tag (double ack, post-reconnect ack). Swallow it —
    /// escalating would tear down a healthy connection.
    DeliveryTag,
    /// Anything else: log and carry on.
    Other,
}

/// AMQP reply codes that indicate connection-level failure.
const RECONNECT_CODES: [u16; 3] = [504, 505, 506];

/// AMQP reply codes scoped to a single queue.
const QUEUE_CODES: [u16; 2] = [404, 403];

/// Message substrings indicating transport breakage. Kept as a compatibility
/// fallback for broker libraries that stringify socket errors; reply codes
/// are preferred when available.
const RECONNECT_SUBSTRINGS: [&str; 6] = [
    "channel closed",
    "connection closed",
    "socket closed",
    "econnreset",
    "enotfound",
    "etimedout",
];

const QUEUE_SUBSTRINGS: [&str; 2] = ["not_found", "does not exist"];

/// Classify a broker error by AMQP reply code, falling back to message
/// substrings when no code is available.
pub fn classify(code: Option<u16>, message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    // Precedence matters: a 406 delivery-tag error also mentions the
    // channel, but must never trigger reconnection.
    if code == Some(406) && lower.contains("delivery tag") {
        return ErrorClass::DeliveryTag;
    }
    if lower.contains("unknown delivery tag") {
        return ErrorClass::DeliveryTag;
    }

    if let Some(code) = code {
        if RECONNECT_CODES.contains(&code) {
            return ErrorClass::Reconnect;
        }
        if QUEUE_CODES.contains(&code) {
            return ErrorClass::QueueScoped;
        }
    }

    if RECONNECT_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
        return ErrorClass::Reconnect;
    }
    if QUEUE_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
        return ErrorClass::QueueScoped;
    }

    ErrorClass::Other
}

impl ErrorClass {
    pub fn triggers_reconnection(&self) -> bool {
        matches!(self, ErrorClass::Reconnect)
    }
}
