//! Live queue interface and implementations.
//!
//! The live queue feeds the primary processor. Items can be enqueued with a
//! delay before they become visible. A dequeued item is leased: it stays
//! invisible for the visibility timeout and reappears unless acknowledged,
//! which makes delivery at-least-once.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use crate::{
    backoff::to_chrono,
    error::Result,
    models::QueueEnvelope,
    storage::queue_items,
    time::Clock,
};

/// Lease handle returned by [`LiveQueue::dequeue`].
pub type Receipt = i64;

/// A leased queue item.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Pass back to [`LiveQueue::ack`] once the item is handled.
    pub receipt: Receipt,
    /// The item itself.
    pub envelope: QueueEnvelope,
}

/// Queue the primary path consumes and the DLQ worker re-injects into.
#[async_trait::async_trait]
pub trait LiveQueue: Send + Sync + std::fmt::Debug {
    /// Adds an envelope that becomes visible after `delay`.
    async fn enqueue(&self, envelope: QueueEnvelope, delay: Duration) -> Result<()>;

    /// Leases the next visible envelope, if any.
    async fn dequeue(&self) -> Result<Option<Delivery>>;

    /// Removes a leased envelope for good.
    async fn ack(&self, receipt: Receipt) -> Result<()>;

    /// Number of envelopes in the queue, visible or not.
    async fn depth(&self) -> Result<usize>;
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    next_receipt: Receipt,
    /// Keyed by (visible-at, receipt) so iteration order is visibility order.
    waiting: BTreeMap<(Instant, Receipt), QueueEnvelope>,
    leased: HashMap<Receipt, (Instant, QueueEnvelope)>,
    enqueued_total: u64,
}

/// In-process queue driven by a [`Clock`].
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<MemoryQueueState>>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    /// Creates an empty queue.
    pub fn new(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
        Self { state: Arc::new(Mutex::new(MemoryQueueState::default())), clock, visibility_timeout }
    }

    /// Every envelope still held, in visibility order, leased ones last.
    pub async fn snapshot(&self) -> Vec<QueueEnvelope> {
        let state = self.state.lock().await;
        state
            .waiting
            .values()
            .chain(state.leased.values().map(|(_, envelope)| envelope))
            .cloned()
            .collect()
    }

    /// Time until the envelope with `message_id` becomes visible; zero when
    /// it already is, `None` when it is not waiting.
    pub async fn visible_in(&self, message_id: &str) -> Option<Duration> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .waiting
            .iter()
            .find(|(_, envelope)| envelope.message_id == message_id)
            .map(|((visible_at, _), _)| visible_at.saturating_duration_since(now))
    }

    /// Envelopes enqueued since creation, including acknowledged ones.
    pub async fn enqueued_total(&self) -> u64 {
        self.state.lock().await.enqueued_total
    }
}

#[async_trait::async_trait]
impl LiveQueue for MemoryQueue {
    async fn enqueue(&self, envelope: QueueEnvelope, delay: Duration) -> Result<()> {
        let visible_at = self.clock.now() + delay;
        let mut state = self.state.lock().await;
        state.next_receipt += 1;
        let receipt = state.next_receipt;
        state.waiting.insert((visible_at, receipt), envelope);
        state.enqueued_total += 1;
        Ok(())
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn dequeue(&self) -> Result<Option<Delivery>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let expired: Vec<Receipt> = state
            .leased
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some((deadline, envelope)) = state.leased.remove(&receipt) {
                state.waiting.insert((deadline, receipt), envelope);
            }
        }

        let Some(key) = state.waiting.keys().next().copied().filter(|(at, _)| *at <= now) else {
            return Ok(None);
        };
        let Some(envelope) = state.waiting.remove(&key) else {
            return Ok(None);
        };

        // Every lease gets its own receipt so a late ack from an expired
        // lease cannot remove the next one.
        state.next_receipt += 1;
        let receipt = state.next_receipt;
        state.leased.insert(receipt, (now + self.visibility_timeout, envelope.clone()));
        Ok(Some(Delivery { receipt, envelope }))
    }

    async fn ack(&self, receipt: Receipt) -> Result<()> {
        self.state.lock().await.leased.remove(&receipt);
        Ok(())
    }

    async fn depth(&self) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.waiting.len() + state.leased.len())
    }
}

/// Queue backed by the `live_queue` table.
#[derive(Debug, Clone)]
pub struct PostgresQueue {
    items: Arc<queue_items::Repository>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

impl PostgresQueue {
    /// Creates a queue over the given repository.
    pub fn new(
        items: Arc<queue_items::Repository>,
        clock: Arc<dyn Clock>,
        visibility_timeout: Duration,
    ) -> Self {
        Self { items, clock, visibility_timeout }
    }
}

#[async_trait::async_trait]
impl LiveQueue for PostgresQueue {
    async fn enqueue(&self, envelope: QueueEnvelope, delay: Duration) -> Result<()> {
        let now = self.clock.now_utc();
        self.items.push(&envelope, now + to_chrono(delay), now).await
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        let now = self.clock.now_utc();
        let leased = self.items.lease_next(now, now + to_chrono(self.visibility_timeout)).await?;
        Ok(leased.map(|(receipt, envelope)| Delivery { receipt, envelope }))
    }

    async fn ack(&self, receipt: Receipt) -> Result<()> {
        self.items.delete(receipt).await
    }

    async fn depth(&self) -> Result<usize> {
        let count = self.items.count().await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::time::TestClock;

    fn queue(clock: &TestClock) -> MemoryQueue {
        MemoryQueue::new(Arc::new(clock.clone()), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn delayed_items_stay_invisible_until_due() {
        let clock = TestClock::new();
        let queue = queue(&clock);
        queue.enqueue(QueueEnvelope::new("later", json!({})), Duration::from_secs(10)).await.unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.visible_in("later").await, Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(10));
        let delivery = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(delivery.envelope.message_id, "later");
    }

    #[tokio::test]
    async fn items_come_out_in_visibility_order() {
        let clock = TestClock::new();
        let queue = queue(&clock);
        queue.enqueue(QueueEnvelope::new("second", json!({})), Duration::from_secs(2)).await.unwrap();
        queue.enqueue(QueueEnvelope::new("first", json!({})), Duration::ZERO).await.unwrap();
        clock.advance(Duration::from_secs(5));

        let first = queue.dequeue().await.unwrap().unwrap();
        let second = queue.dequeue().await.unwrap().unwrap();

        assert_eq!(first.envelope.message_id, "first");
        assert_eq!(second.envelope.message_id, "second");
    }

    #[tokio::test]
    async fn unacknowledged_lease_reappears() {
        let clock = TestClock::new();
        let queue = queue(&clock);
        queue.enqueue(QueueEnvelope::new("msg", json!({})), Duration::ZERO).await.unwrap();

        let leased = queue.dequeue().await.unwrap().unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 1);

        clock.advance(Duration::from_secs(31));
        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.envelope, leased.envelope);

        queue.ack(again.receipt).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn late_ack_from_expired_lease_keeps_the_new_lease() {
        let clock = TestClock::new();
        let queue = queue(&clock);
        queue.enqueue(QueueEnvelope::new("msg", json!({})), Duration::ZERO).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        clock.advance(Duration::from_secs(31));
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_ne!(first.receipt, second.receipt);

        queue.ack(first.receipt).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 1);
        clock.advance(Duration::from_secs(5));
        assert!(queue.dequeue().await.unwrap().is_none(), "second lease is still held");

        queue.ack(second.receipt).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }
}
