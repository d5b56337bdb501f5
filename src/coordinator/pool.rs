//! Partitioned consumers
//!
//! A pool reads one queue and routes each message to a partition chosen by
//! hashing its job id. Partitions handle their messages one at a time, so
//! every message of a job is processed in delivery order while different
//! jobs proceed in parallel.

use crate::job::JobId;
use crate::message::JobScoped;
use crate::transport::{Delivery, Transport, TransportResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PARTITION_BUFFER: usize = 64;
const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_millis(200);

/// What to tell the transport once a message is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Redeliver later
    Requeue,
}

/// Handles the decoded messages of one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Message: DeserializeOwned + JobScoped + Send + 'static;

    async fn handle_message(&self, message: Self::Message) -> Disposition;
}

/// Partition index for a job.
pub fn partition_for(job_id: &JobId, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    job_id.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

pub struct PartitionedPool<H: MessageHandler> {
    name: &'static str,
    queue: String,
    partitions: usize,
    transport: Arc<dyn Transport>,
    handler: Arc<H>,
    requeue_delay: Duration,
}

impl<H: MessageHandler> PartitionedPool<H> {
    pub fn new(
        name: &'static str,
        queue: impl Into<String>,
        partitions: usize,
        transport: Arc<dyn Transport>,
        handler: Arc<H>,
    ) -> Self {
        Self {
            name,
            queue: queue.into(),
            partitions: partitions.max(1),
            transport,
            handler,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    /// Consume until cancelled, then let every partition finish what it holds.
    pub async fn run(self, cancel: CancellationToken) {
        let mut senders = Vec::with_capacity(self.partitions);
        let mut partitions = Vec::with_capacity(self.partitions);
        for index in 0..self.partitions {
            let (tx, rx) = mpsc::channel::<(Delivery, H::Message)>(PARTITION_BUFFER);
            senders.push(tx);
            partitions.push(tokio::spawn(run_partition(
                self.name,
                index,
                rx,
                Arc::clone(&self.handler),
                Arc::clone(&self.transport),
                self.requeue_delay,
            )));
        }
        info!(pool = self.name, queue = %self.queue, partitions = self.partitions, "pool started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = self.transport.consume(&self.queue) => match delivery {
                    Ok(delivery) => self.route(delivery, &senders).await,
                    Err(e) => {
                        warn!(pool = self.name, queue = %self.queue, error = %e, "consume failed");
                        tokio::time::sleep(self.requeue_delay).await;
                    }
                },
            }
        }

        drop(senders);
        for handle in partitions {
            if let Err(e) = handle.await {
                warn!(pool = self.name, error = %e, "partition task failed");
            }
        }
        info!(pool = self.name, "pool stopped");
    }

    async fn route(&self, delivery: Delivery, senders: &[mpsc::Sender<(Delivery, H::Message)>]) {
        let message: H::Message = match delivery.decode() {
            Ok(message) => message,
            Err(e) => {
                warn!(pool = self.name, queue = %delivery.queue, error = %e, "undecodable message rejected");
                if let Err(e) = self.transport.nack(&delivery, false).await {
                    warn!(pool = self.name, error = %e, "nack failed");
                }
                return;
            }
        };
        let index = partition_for(message.job_id(), senders.len());
        if senders[index].send((delivery, message)).await.is_err() {
            warn!(pool = self.name, partition = index, "partition closed, message left unacked");
        }
    }
}

async fn run_partition<H: MessageHandler>(
    pool: &'static str,
    index: usize,
    mut rx: mpsc::Receiver<(Delivery, H::Message)>,
    handler: Arc<H>,
    transport: Arc<dyn Transport>,
    requeue_delay: Duration,
) {
    while let Some((delivery, message)) = rx.recv().await {
        let disposition = handler.handle_message(message).await;
        if disposition == Disposition::Requeue {
            tokio::time::sleep(requeue_delay).await;
        }
        if let Err(e) = settle(transport.as_ref(), &delivery, disposition).await {
            warn!(pool, partition = index, error = %e, "could not settle delivery");
        }
    }
    debug!(pool, partition = index, "partition drained");
}

async fn settle(
    transport: &dyn Transport,
    delivery: &Delivery,
    disposition: Disposition,
) -> TransportResult<()> {
    match disposition {
        Disposition::Ack => transport.ack(delivery).await,
        Disposition::Requeue => transport.nack(delivery, true).await,
    }
}

/// Handle every message ready on `queue` in place, one at a time.
///
/// Each message present when the call starts is handled once; requeued
/// messages wait for the next call. Returns how many were handled.
pub async fn pump<H: MessageHandler>(
    transport: &dyn Transport,
    queue: &str,
    handler: &H,
) -> TransportResult<usize> {
    let ready = transport.depth(queue).await?;
    let mut handled = 0;
    for _ in 0..ready {
        let Some(delivery) = transport.try_consume(queue).await? else {
            break;
        };
        let disposition = match delivery.decode::<H::Message>() {
            Ok(message) => handler.handle_message(message).await,
            Err(e) => {
                warn!(queue, error = %e, "undecodable message rejected");
                transport.nack(&delivery, false).await?;
                continue;
            }
        };
        settle(transport, &delivery, disposition).await?;
        handled += 1;
    }
    Ok(handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, QueueOptions};
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize)]
    struct Note {
        job_id: JobId,
        seq: u32,
        #[serde(default)]
        fail_once: bool,
    }

    impl JobScoped for Note {
        fn job_id(&self) -> &JobId {
            &self.job_id
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, u32)>>,
        failed: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        type Message = Note;

        async fn handle_message(&self, note: Note) -> Disposition {
            if note.fail_once {
                let mut failed = self.failed.lock().unwrap();
                if !failed.contains(&note.seq) {
                    failed.push(note.seq);
                    return Disposition::Requeue;
                }
            }
            self.seen
                .lock()
                .unwrap()
                .push((note.job_id.to_string(), note.seq));
            Disposition::Ack
        }
    }

    async fn publish(t: &MemoryTransport, job: &str, seq: u32, fail_once: bool) {
        let body = serde_json::json!({ "job_id": job, "seq": seq, "fail_once": fail_once });
        t.publish("q", 1, serde_json::to_vec(&body).unwrap()).await.unwrap();
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        let job = JobId::new("job-42");
        let first = partition_for(&job, 4);
        assert!(first < 4);
        for _ in 0..10 {
            assert_eq!(partition_for(&job, 4), first);
        }
        assert_eq!(partition_for(&job, 0), 0);
    }

    #[tokio::test]
    async fn pump_handles_ready_messages_once() {
        let t = MemoryTransport::new();
        t.declare("q", QueueOptions::durable()).await.unwrap();
        publish(&t, "a", 1, false).await;
        publish(&t, "a", 2, true).await;
        t.publish("q", 1, b"not json".to_vec()).await.unwrap();

        let recorder = Recorder::default();
        assert_eq!(pump(&t, "q", &recorder).await.unwrap(), 2);
        assert_eq!(t.depth("q").await.unwrap(), 1);

        assert_eq!(pump(&t, "q", &recorder).await.unwrap(), 1);
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![("a".to_string(), 1), ("a".to_string(), 2)]);
    }

    #[tokio::test]
    async fn pool_keeps_per_job_order_and_stops_on_cancel() {
        let t = Arc::new(MemoryTransport::new());
        t.declare("q", QueueOptions::durable()).await.unwrap();
        for seq in 0..20 {
            publish(&t, if seq % 2 == 0 { "even" } else { "odd" }, seq, false).await;
        }

        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let pool = PartitionedPool::new("test", "q", 3, t.clone(), recorder.clone())
            .with_requeue_delay(Duration::from_millis(1));
        let handle = tokio::spawn(pool.run(cancel.clone()));

        for _ in 0..100 {
            if recorder.seen.lock().unwrap().len() == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 20);
        for job in ["even", "odd"] {
            let order: Vec<u32> = seen.iter().filter(|(j, _)| j == job).map(|(_, s)| *s).collect();
            let mut sorted = order.clone();
            sorted.sort();
            assert_eq!(order, sorted);
        }
        assert_eq!(t.in_flight("q"), 0);
    }
}
