//! Session output multiplexer.
//!
//! Fans PTY output out to any number of subscribers. Each subscriber has its
//! own bounded queue; when a queue is full its oldest chunk is discarded so a
//! slow consumer never stalls the reader task or the other subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

/// Unique identifier for a subscriber.
pub type ClientId = String;

/// Default queue capacity (in chunks) per subscriber.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Statistics about a subscriber's message handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Chunks enqueued for this subscriber.
    pub messages_sent: u64,
    /// Chunks discarded because the subscriber fell behind.
    pub messages_dropped: u64,
    /// Whether the subscriber is currently experiencing backpressure.
    pub is_backpressured: bool,
}

/// Aggregate counters for one broadcaster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Subscribers currently attached.
    pub subscribers: usize,
    /// Chunks handed to [`SessionOutputBroadcaster::broadcast`].
    pub chunks_published: u64,
    /// Chunks discarded across all subscribers.
    pub overflow_events: u64,
}

struct ClientQueue {
    id: ClientId,
    capacity: usize,
    chunks: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    /// Set by the broadcaster; no more chunks will arrive.
    closed: AtomicBool,
    /// Set when the [`Subscription`] is dropped.
    detached: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
    backpressured: AtomicBool,
}

impl ClientQueue {
    fn new(id: ClientId, capacity: usize) -> Self {
        Self {
            id,
            capacity: capacity.max(1),
            chunks: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            backpressured: AtomicBool::new(false),
        }
    }

    /// Enqueues a chunk. Returns false if an older chunk had to be dropped.
    fn push(&self, chunk: Bytes) -> bool {
        let overflowed = {
            let mut chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
            let overflowed = chunks.len() >= self.capacity;
            if overflowed {
                chunks.pop_front();
            }
            chunks.push_back(chunk);
            overflowed
        };

        self.sent.fetch_add(1, Ordering::Relaxed);
        if overflowed {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if !self.backpressured.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    client_id = %self.id,
                    dropped = dropped,
                    "Client is backpressured, dropping oldest output"
                );
            }
        } else if self.backpressured.swap(false, Ordering::Relaxed) {
            tracing::debug!(client_id = %self.id, "Client recovered from backpressure");
        }

        self.notify.notify_one();
        !overflowed
    }

    fn pop(&self) -> Option<Bytes> {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn stats(&self) -> ClientStats {
        ClientStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            is_backpressured: self.backpressured.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of one subscriber's queue.
///
/// Dropping it detaches the subscriber; the broadcaster prunes it on the next
/// publish.
pub struct Subscription {
    queue: Arc<ClientQueue>,
}

impl Subscription {
    /// Subscriber identifier.
    pub fn id(&self) -> &ClientId {
        &self.queue.id
    }

    /// Waits for the next chunk. Returns `None` once the broadcaster is closed
    /// and everything queued has been received.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            if let Some(chunk) = self.queue.pop() {
                return Some(chunk);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return self.queue.pop();
            }
            self.queue.notify.notified().await;
        }
    }

    /// Returns a queued chunk without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.queue.pop()
    }

    /// True once no more chunks will be published.
    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }

    /// This subscriber's counters.
    pub fn stats(&self) -> ClientStats {
        self.queue.stats()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.detached.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.queue.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Broadcasts PTY output to multiple subscribers.
pub struct SessionOutputBroadcaster {
    /// Map of client ID to its queue.
    clients: RwLock<HashMap<ClientId, Arc<ClientQueue>>>,
    default_capacity: usize,
    closed: AtomicBool,
    chunks_published: AtomicU64,
    overflow_events: AtomicU64,
}

impl SessionOutputBroadcaster {
    /// Creates a broadcaster with the default per-subscriber capacity.
    pub fn new() -> Self {
        Self::with_default_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Creates a broadcaster whose subscribers hold up to `capacity` chunks.
    pub fn with_default_capacity(capacity: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            default_capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            chunks_published: AtomicU64::new(0),
            overflow_events: AtomicU64::new(0),
        }
    }

    /// Attaches a subscriber with the default capacity.
    pub async fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(self.default_capacity).await
    }

    /// Attaches a subscriber holding up to `capacity` chunks.
    ///
    /// Subscribing to a closed broadcaster yields a subscription that is
    /// already closed.
    pub async fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let client_id = Uuid::new_v4().to_string();
        let queue = Arc::new(ClientQueue::new(client_id.clone(), capacity));

        let mut clients = self.clients.write().await;
        if self.closed.load(Ordering::Acquire) {
            queue.close();
        } else {
            clients.insert(client_id.clone(), Arc::clone(&queue));
        }
        drop(clients);

        tracing::debug!(client_id = %client_id, "Added client to broadcaster");
        Subscription { queue }
    }

    /// Returns the number of attached subscribers.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Aggregate counters.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            subscribers: self.client_count().await,
            chunks_published: self.chunks_published.load(Ordering::Relaxed),
            overflow_events: self.overflow_events.load(Ordering::Relaxed),
        }
    }

    /// True after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publishes a chunk to every subscriber.
    ///
    /// Never waits on a subscriber. Detached subscribers are pruned first.
    /// Returns the number of subscribers that received the chunk without an
    /// overflow.
    pub async fn broadcast(&self, data: Bytes) -> usize {
        if self.is_closed() {
            return 0;
        }

        self.chunks_published.fetch_add(1, Ordering::Relaxed);

        let mut clients = self.clients.write().await;
        clients.retain(|client_id, queue| {
            let keep = !queue.detached.load(Ordering::Acquire);
            if !keep {
                tracing::debug!(client_id = %client_id, "Removed disconnected client");
            }
            keep
        });

        let mut delivered = 0;
        for queue in clients.values() {
            if queue.push(data.clone()) {
                delivered += 1;
            } else {
                self.overflow_events.fetch_add(1, Ordering::Relaxed);
            }
        }
        delivered
    }

    /// Closes every subscription. Queued chunks stay readable.
    pub async fn close(&self) {
        let mut clients = self.clients.write().await;
        self.closed.store(true, Ordering::Release);
        for (_, queue) in clients.drain() {
            queue.close();
        }
    }
}

impl Default for SessionOutputBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionOutputBroadcaster {
    fn drop(&mut self) {
        for queue in self.clients.get_mut().values() {
            queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn chunk(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_broadcaster_creation() {
        let broadcaster = SessionOutputBroadcaster::new();
        assert!(!broadcaster.is_closed());
        assert_eq!(broadcaster.stats().await, BroadcastStats::default());
    }

    #[tokio::test]
    async fn test_subscribe_assigns_unique_ids() {
        let broadcaster = SessionOutputBroadcaster::new();

        let sub1 = broadcaster.subscribe().await;
        let sub2 = broadcaster.subscribe().await;
        assert_ne!(sub1.id(), sub2.id());
        assert_eq!(broadcaster.client_count().await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_to_multiple_clients() {
        let broadcaster = SessionOutputBroadcaster::new();

        let mut subs = Vec::new();
        for _ in 0..3 {
            subs.push(broadcaster.subscribe().await);
        }

        let count = broadcaster.broadcast(chunk("Hello, clients!")).await;
        assert_eq!(count, 3);

        for sub in &mut subs {
            let received = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timeout")
                .expect("no data");
            assert_eq!(received, chunk("Hello, clients!"));
        }

        let stats = subs[0].stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 0);
    }

    #[tokio::test]
    async fn test_slow_client_keeps_newest() {
        let broadcaster = SessionOutputBroadcaster::new();

        let mut fast = broadcaster.subscribe().await;
        let mut slow = broadcaster.subscribe_with_capacity(2).await;

        for i in 0..10 {
            broadcaster.broadcast(chunk(&format!("message-{i}"))).await;
            assert!(fast.recv().await.is_some());
        }

        let stats = slow.stats();
        assert_eq!(stats.messages_dropped, 8);
        assert!(stats.is_backpressured);

        // Drop-oldest: the slow subscriber holds the two newest chunks.
        assert_eq!(slow.try_recv().unwrap(), chunk("message-8"));
        assert_eq!(slow.try_recv().unwrap(), chunk("message-9"));
        assert!(slow.try_recv().is_none());

        let fast_stats = fast.stats();
        assert_eq!(fast_stats.messages_sent, 10);
        assert_eq!(fast_stats.messages_dropped, 0);

        let totals = broadcaster.stats().await;
        assert_eq!(totals.chunks_published, 10);
        assert_eq!(totals.overflow_events, 8);
        assert_eq!(totals.subscribers, 2);
    }

    #[tokio::test]
    async fn test_backpressure_recovers() {
        let broadcaster = SessionOutputBroadcaster::new();
        let mut sub = broadcaster.subscribe_with_capacity(1).await;

        assert!(!sub.stats().is_backpressured);

        broadcaster.broadcast(chunk("msg1")).await;
        broadcaster.broadcast(chunk("msg2")).await;
        assert!(sub.stats().is_backpressured);

        sub.try_recv().unwrap();
        broadcaster.broadcast(chunk("msg3")).await;
        assert!(!sub.stats().is_backpressured);
    }

    #[tokio::test]
    async fn test_disconnected_client_removal() {
        let broadcaster = SessionOutputBroadcaster::new();

        let stays = broadcaster.subscribe().await;
        let drops = broadcaster.subscribe().await;
        assert_eq!(broadcaster.client_count().await, 2);

        drop(drops);
        assert_eq!(broadcaster.broadcast(chunk("test")).await, 1);
        assert_eq!(broadcaster.client_count().await, 1);
        assert_eq!(stays.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_output_ordering_preserved() {
        let broadcaster = SessionOutputBroadcaster::new();
        let mut sub = broadcaster.subscribe().await;

        for i in 0..10 {
            broadcaster.broadcast(chunk(&format!("msg-{i}"))).await;
        }

        for i in 0..10 {
            let received = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timeout")
                .expect("no data");
            assert_eq!(received, chunk(&format!("msg-{i}")), "order at {i}");
        }
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let broadcaster = Arc::new(SessionOutputBroadcaster::new());
        let mut sub = broadcaster.subscribe().await;

        let publisher = Arc::clone(&broadcaster);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.broadcast(chunk("late")).await;
        });

        let received = timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timeout");
        assert_eq!(received, Some(chunk("late")));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_after_drain() {
        let broadcaster = SessionOutputBroadcaster::new();
        let mut sub = broadcaster.subscribe().await;

        broadcaster.broadcast(chunk("last words")).await;
        broadcaster.close().await;

        assert!(sub.is_closed());
        assert_eq!(sub.recv().await, Some(chunk("last words")));
        assert_eq!(sub.recv().await, None);

        // Publishing after close is a no-op.
        assert_eq!(broadcaster.broadcast(chunk("ignored")).await, 0);

        let mut late = broadcaster.subscribe().await;
        assert!(late.is_closed());
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn test_drop_closes_subscriptions() {
        let broadcaster = SessionOutputBroadcaster::new();
        let mut sub = broadcaster.subscribe().await;
        drop(broadcaster);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_multi_client_broadcast_integration() {
        let broadcaster = SessionOutputBroadcaster::with_default_capacity(64);

        let mut subs = vec![
            broadcaster.subscribe().await,
            broadcaster.subscribe_with_capacity(50).await,
            broadcaster.subscribe_with_capacity(100).await,
        ];

        let messages: Vec<Bytes> = (0..20)
            .map(|i| chunk(&format!("output-chunk-{i:03}")))
            .collect();
        for msg in &messages {
            broadcaster.broadcast(msg.clone()).await;
        }

        for (i, expected) in messages.iter().enumerate() {
            for sub in &mut subs {
                let received = timeout(Duration::from_millis(100), sub.recv())
                    .await
                    .expect("timeout")
                    .expect("no data");
                assert_eq!(&received, expected, "{} mismatch at {i}", sub.id());
            }
        }

        for sub in &subs {
            assert_eq!(sub.stats().messages_sent, 20);
            assert_eq!(sub.stats().messages_dropped, 0);
        }
        assert_eq!(broadcaster.stats().await.overflow_events, 0);
    }
}
