pub mod classify;
mod client;
mod events;

pub use classify::{classify, ErrorClass};
pub use client::AmqpClient;
pub use events::BrokerEvent;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerResult;

/// A single message handed to a consumer task.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped monotonic identifier; the target of ack/nack.
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// Passive queue probe result.
#[derive(Debug, Clone, Copy)]
pub struct QueueSnapshot {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// One item on a subscription channel.
///
/// `Cancelled` is the counterpart of a null delivery in other client
/// libraries: the broker ended the subscription itself (queue deleted,
/// basic.cancel). A channel that closes WITHOUT the marker died with the
/// connection — the configuration must survive for re-establishment.
#[derive(Debug, Clone)]
pub enum SubscriptionItem {
    Delivery(Delivery),
    Cancelled,
}

/// A live subscription.
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: mpsc::Receiver<SubscriptionItem>,
}

/// Narrow interface to the message broker. The engine and its collaborators
/// only ever talk to the broker through this seam, which keeps the actor
/// testable against an in-memory implementation.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open the connection and channel. Idempotent: reconnecting replaces
    /// any previous handles.
    async fn connect(&self) -> BrokerResult<()>;

    /// Graceful close of channel and connection.
    async fn disconnect(&self);

    /// Drop broker handles without a graceful close. Used between
    /// reconnection attempts where the old connection is already dead.
    async fn cleanup(&self);

    fn is_channel_ready(&self) -> bool;

    async fn check_queue(&self, queue: &str) -> BrokerResult<QueueSnapshot>;

    /// Register a consumer with prefetch = 1 and start forwarding
    /// deliveries. The engine paces consumption, not the broker.
    async fn consume(&self, queue: &str) -> BrokerResult<Subscription>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> BrokerResult<()>;

    /// Acknowledge a delivery. MUST be a no-op when the channel is not
    /// ready, and MUST swallow "unknown delivery tag" precisely.
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    /// Negatively acknowledge a delivery, optionally requeueing it. Same
    /// not-ready and unknown-tag semantics as [`BrokerClient::ack`].
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;
}
