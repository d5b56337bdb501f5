//! Message transport interface
//!
//! A durable, priority-ordered queue per logical name with explicit
//! acknowledgement. Consumers ack a delivery once handled or nack it to
//! request redelivery. Queues declared with dead-lettering shunt a message
//! to `<queue>.dead-letter` after too many failed deliveries.

mod memory;

pub use memory::MemoryTransport;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(u64),

    #[error("Publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Options fixed when a queue is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Shunt repeatedly failing messages to `<queue>.dead-letter`
    pub dead_letter: bool,
    /// Deliveries allowed before dead-lettering
    pub max_deliveries: u32,
}

impl QueueOptions {
    /// A queue that requeues failures forever.
    pub fn durable() -> Self {
        Self::default()
    }

    pub fn dead_lettered(max_deliveries: u32) -> Self {
        Self {
            dead_letter: true,
            max_deliveries: max_deliveries.max(1),
        }
    }
}

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.dead-letter")
}

/// One message handed to a consumer, awaiting ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub priority: u8,
    pub body: Vec<u8>,
    /// How many times this message has been delivered, including this one
    pub deliveries: u32,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> TransportResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a queue if it does not exist yet.
    async fn declare(&self, queue: &str, options: QueueOptions) -> TransportResult<()>;

    async fn publish(&self, queue: &str, priority: u8, body: Vec<u8>) -> TransportResult<()>;

    /// Wait for the next message.
    async fn consume(&self, queue: &str) -> TransportResult<Delivery>;

    /// Take the next message if one is ready.
    async fn try_consume(&self, queue: &str) -> TransportResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> TransportResult<()>;

    /// Reject a delivery; with `requeue` it is delivered again later.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> TransportResult<()>;

    /// Messages ready for delivery.
    async fn depth(&self, queue: &str) -> TransportResult<usize>;
}

/// Encode a message as JSON and publish it.
pub async fn publish_json<T: Serialize + Sync>(
    transport: &dyn Transport,
    queue: &str,
    priority: u8,
    message: &T,
) -> TransportResult<()> {
    let body = serde_json::to_vec(message)?;
    transport.publish(queue, priority, body).await
}
