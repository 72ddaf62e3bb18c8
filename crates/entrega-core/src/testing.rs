//! In-memory collaborators for engine and pipeline tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::amqp::{BrokerClient, Delivery, QueueSnapshot, Subscription, SubscriptionItem};
use crate::error::{BrokerError, BrokerResult};

/// Scriptable in-memory broker. Tests declare queues, inject deliveries and
/// assert on the exact ack/nack/cancel traffic the engine produced.
#[derive(Default)]
pub struct MockBroker {
    connected: AtomicBool,
    fail_connects: AtomicU32,
    next_delivery_tag: AtomicU64,
    queues: Mutex<HashMap<String, QueueSnapshot>>,
    /// Queues whose probes answer ACCESS_REFUSED instead of a snapshot.
    denied: Mutex<HashSet<String>>,
    ack_failures: AtomicBool,
    delivery_txs: Mutex<HashMap<String, mpsc::Sender<SubscriptionItem>>>,
    pub acks: Mutex<Vec<u64>>,
    pub nacks: Mutex<Vec<(u64, bool)>>,
    pub cancelled: Mutex<Vec<String>>,
    consumer_seq: AtomicU64,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declare a queue with the given backlog depth.
    pub fn add_queue(&self, name: &str, message_count: u32) {
        self.queues.lock().insert(
            name.to_string(),
            QueueSnapshot {
                message_count,
                consumer_count: 0,
            },
        );
    }

    /// Delete the queue definition so health probes see NOT_FOUND. The
    /// delivery channel is left open so tests can exercise the health-sweep
    /// detection path in isolation; combine with [`cancel_subscription`]
    /// to model a broker that cancels consumers of a deleted queue.
    ///
    /// [`cancel_subscription`]: MockBroker::cancel_subscription
    pub fn remove_queue(&self, name: &str) {
        self.queues.lock().remove(name);
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Answer probes for this queue with ACCESS_REFUSED (the queue still
    /// exists and its subscription keeps working).
    pub fn deny_queue_access(&self, name: &str) {
        self.denied.lock().insert(name.to_string());
    }

    /// Make every subsequent ack fail at the channel level.
    pub fn fail_acks(&self) {
        self.ack_failures.store(true, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Inject a delivery into a live subscription, returning its tag.
    pub async fn deliver(&self, queue: &str, payload: &[u8]) -> u64 {
        let tag = self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.deliver_with_tag(queue, tag, payload).await;
        tag
    }

    pub async fn deliver_with_tag(&self, queue: &str, tag: u64, payload: &[u8]) {
        let tx = self
            .delivery_txs
            .lock()
            .get(queue)
            .cloned()
            .expect("no live subscription for queue");
        tx.send(SubscriptionItem::Delivery(Delivery {
            delivery_tag: tag,
            payload: payload.to_vec(),
            redelivered: false,
        }))
        .await
        .expect("subscription receiver dropped");
    }

    /// Simulate a broker-side consumer cancellation: the cancellation
    /// marker is delivered before the channel closes.
    pub fn cancel_subscription(&self, queue: &str) {
        if let Some(tx) = self.delivery_txs.lock().remove(queue) {
            let _ = tx.try_send(SubscriptionItem::Cancelled);
        }
    }

    /// Drop a subscription channel without the cancellation marker, the way
    /// a dying connection does.
    pub fn drop_subscription(&self, queue: &str) {
        self.delivery_txs.lock().remove(queue);
    }

    pub fn has_subscription(&self, queue: &str) -> bool {
        self.delivery_txs.lock().contains_key(queue)
    }

    pub fn ack_count(&self) -> usize {
        self.acks.lock().len()
    }

    pub fn nack_count(&self) -> usize {
        self.nacks.lock().len()
    }
}

#[async_trait::async_trait]
impl BrokerClient for MockBroker {
    async fn connect(&self) -> BrokerResult<()> {
        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Io("ECONNREFUSED".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.delivery_txs.lock().clear();
    }

    async fn cleanup(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.delivery_txs.lock().clear();
    }

    fn is_channel_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn check_queue(&self, queue: &str) -> BrokerResult<QueueSnapshot> {
        if !self.is_channel_ready() {
            return Err(BrokerError::NotConnected);
        }
        if self.denied.lock().contains(queue) {
            return Err(BrokerError::AccessRefused(queue.to_string()));
        }
        self.queues
            .lock()
            .get(queue)
            .copied()
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    async fn consume(&self, queue: &str) -> BrokerResult<Subscription> {
        if !self.is_channel_ready() {
            return Err(BrokerError::NotConnected);
        }
        if !self.queues.lock().contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let (tx, rx) = mpsc::channel(8);
        self.delivery_txs.lock().insert(queue.to_string(), tx);
        let seq = self.consumer_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Subscription {
            consumer_tag: format!("mock-consumer-{seq}"),
            deliveries: rx,
        })
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.cancelled.lock().push(consumer_tag.to_string());
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        if !self.is_channel_ready() {
            return Ok(());
        }
        if self.ack_failures.load(Ordering::SeqCst) {
            return Err(BrokerError::Io("simulated ack failure".to_string()));
        }
        self.acks.lock().push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        if !self.is_channel_ready() {
            return Ok(());
        }
        self.nacks.lock().push((delivery_tag, requeue));
        Ok(())
    }
}

/// Spin up a loopback webhook answering every POST with `status`.
/// Returns the URL and a hit counter.
pub async fn spawn_webhook(status: u16) -> (String, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let hits_clone = Arc::clone(&hits);
    let app = Router::new().route(
        "/hook",
        post(move || {
            let hits = Arc::clone(&hits_clone);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                axum::http::StatusCode::from_u16(status).unwrap()
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), hits)
}
