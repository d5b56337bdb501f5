//! In-process priority queues

use super::{dead_letter_queue, Delivery, QueueOptions, Transport, TransportError, TransportResult};
use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

#[derive(Debug, Clone)]
struct Entry {
    priority: u8,
    seq: u64,
    body: Vec<u8>,
    deliveries: u32,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    /// Higher priority first, then oldest first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    ready: BinaryHeap<Entry>,
    unacked: HashMap<u64, Entry>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: BinaryHeap::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, entry: Entry) {
        self.ready.push(entry);
        self.notify.notify_one();
    }
}

/// Transport backed by in-memory priority queues.
///
/// Unacknowledged deliveries are held until acked or nacked, so a consumer
/// that drops a delivery without answering leaves it in flight.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    queues: Mutex<HashMap<String, QueueState>>,
    next_seq: AtomicU64,
    next_tag: AtomicU64,
    offline: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage: while offline every publish fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Deliveries handed out and not yet acked or nacked.
    pub fn in_flight(&self, queue: &str) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Names of all declared queues.
    pub fn queue_names(&self) -> Vec<String> {
        let queues = self.queues.lock().unwrap();
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }

    fn take(&self, queue: &str, state: &mut QueueState) -> Option<Delivery> {
        let mut entry = state.ready.pop()?;
        entry.deliveries += 1;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        let delivery = Delivery {
            tag,
            queue: queue.to_string(),
            priority: entry.priority,
            body: entry.body.clone(),
            deliveries: entry.deliveries,
        };
        state.unacked.insert(tag, entry);
        Some(delivery)
    }

    fn dead_letter(queues: &mut HashMap<String, QueueState>, queue: &str, mut entry: Entry) {
        let target = dead_letter_queue(queue);
        warn!(queue, dead_letter = %target, deliveries = entry.deliveries, "dead-lettering message");
        entry.deliveries = 0;
        queues
            .entry(target)
            .or_insert_with(|| QueueState::new(QueueOptions::durable()))
            .push(entry);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare(&self, queue: &str, options: QueueOptions) -> TransportResult<()> {
        let mut queues = self.queues.lock().unwrap();
        queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState::new(options));
        Ok(())
    }

    async fn publish(&self, queue: &str, priority: u8, body: Vec<u8>) -> TransportResult<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(TransportError::Publish {
                queue: queue.to_string(),
                reason: "transport offline".into(),
            });
        }
        let mut queues = self.queues.lock().unwrap();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        state.push(Entry {
            priority,
            seq,
            body,
            deliveries: 0,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> TransportResult<Delivery> {
        loop {
            let notify = {
                let mut queues = self.queues.lock().unwrap();
                let state = queues
                    .get_mut(queue)
                    .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
                if let Some(delivery) = self.take(queue, state) {
                    return Ok(delivery);
                }
                state.notify.clone()
            };
            notify.notified().await;
        }
    }

    async fn try_consume(&self, queue: &str) -> TransportResult<Option<Delivery>> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        Ok(self.take(queue, state))
    }

    async fn ack(&self, delivery: &Delivery) -> TransportResult<()> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| TransportError::UnknownQueue(delivery.queue.clone()))?;
        state
            .unacked
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or(TransportError::UnknownDelivery(delivery.tag))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> TransportResult<()> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| TransportError::UnknownQueue(delivery.queue.clone()))?;
        let mut entry = state
            .unacked
            .remove(&delivery.tag)
            .ok_or(TransportError::UnknownDelivery(delivery.tag))?;
        let options = state.options;

        let exhausted = options.dead_letter && entry.deliveries >= options.max_deliveries;
        if requeue && !exhausted {
            // behind everything already waiting at the same priority
            entry.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            state.push(entry);
        } else if options.dead_letter {
            Self::dead_letter(&mut queues, &delivery.queue, entry);
        } else {
            warn!(queue = %delivery.queue, "discarding rejected message");
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> TransportResult<usize> {
        let queues = self.queues.lock().unwrap();
        queues
            .get(queue)
            .map(|q| q.ready.len())
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn transport(queue: &str, options: QueueOptions) -> MemoryTransport {
        let t = MemoryTransport::new();
        t.declare(queue, options).await.unwrap();
        t
    }

    #[tokio::test]
    async fn higher_priority_first_then_fifo() {
        let t = transport("q", QueueOptions::durable()).await;
        t.publish("q", 1, b"low".to_vec()).await.unwrap();
        t.publish("q", 10, b"high-1".to_vec()).await.unwrap();
        t.publish("q", 10, b"high-2".to_vec()).await.unwrap();
        t.publish("q", 5, b"mid".to_vec()).await.unwrap();

        let mut order = Vec::new();
        while let Some(d) = t.try_consume("q").await.unwrap() {
            order.push(String::from_utf8(d.body.clone()).unwrap());
            t.ack(&d).await.unwrap();
        }
        assert_eq!(order, vec!["high-1", "high-2", "mid", "low"]);
    }

    #[tokio::test]
    async fn unacked_delivery_is_held_until_answered() {
        let t = transport("q", QueueOptions::durable()).await;
        t.publish("q", 1, b"m".to_vec()).await.unwrap();
        let d = t.try_consume("q").await.unwrap().unwrap();
        assert_eq!(t.depth("q").await.unwrap(), 0);
        assert_eq!(t.in_flight("q"), 1);

        t.nack(&d, true).await.unwrap();
        let again = t.try_consume("q").await.unwrap().unwrap();
        assert_eq!(again.deliveries, 2);
        t.ack(&again).await.unwrap();
        assert!(t.ack(&again).await.is_err());
    }

    #[tokio::test]
    async fn requeued_message_goes_behind_its_priority() {
        let t = transport("q", QueueOptions::durable()).await;
        t.publish("q", 5, b"first".to_vec()).await.unwrap();
        t.publish("q", 5, b"second".to_vec()).await.unwrap();
        let d = t.try_consume("q").await.unwrap().unwrap();
        t.nack(&d, true).await.unwrap();

        let next = t.try_consume("q").await.unwrap().unwrap();
        assert_eq!(next.body, b"second".to_vec());
        let last = t.try_consume("q").await.unwrap().unwrap();
        assert_eq!(last.body, b"first".to_vec());
    }

    #[tokio::test]
    async fn durable_queue_requeues_forever() {
        let t = transport("commands", QueueOptions::durable()).await;
        t.publish("commands", 10, b"m".to_vec()).await.unwrap();
        for _ in 0..10 {
            let d = t.try_consume("commands").await.unwrap().unwrap();
            t.nack(&d, true).await.unwrap();
        }
        assert_eq!(t.depth("commands").await.unwrap(), 1);
        assert!(!t.queue_names().contains(&dead_letter_queue("commands")));
    }

    #[tokio::test]
    async fn poison_message_is_dead_lettered() {
        let t = transport("worker", QueueOptions::dead_lettered(3)).await;
        t.publish("worker", 5, b"poison".to_vec()).await.unwrap();
        for _ in 0..3 {
            let d = t.try_consume("worker").await.unwrap().unwrap();
            t.nack(&d, true).await.unwrap();
        }
        assert_eq!(t.depth("worker").await.unwrap(), 0);
        assert_eq!(t.depth("worker.dead-letter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn consume_waits_for_publish() {
        let t = Arc::new(transport("q", QueueOptions::durable()).await);
        let consumer = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.consume("q").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.publish("q", 1, b"late".to_vec()).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"late".to_vec());
    }

    #[tokio::test]
    async fn offline_and_undeclared_publishes_fail() {
        let t = transport("q", QueueOptions::durable()).await;
        assert!(matches!(
            t.publish("missing", 1, vec![]).await,
            Err(TransportError::UnknownQueue(_))
        ));
        t.set_offline(true);
        assert!(matches!(
            t.publish("q", 1, vec![]).await,
            Err(TransportError::Publish { .. })
        ));
    }
}
