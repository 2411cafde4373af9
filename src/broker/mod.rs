//! Broker queue: durable point-to-point work queues.
//!
//! This module contains:
//! - `BrokerQueue` trait: declare / publish / consume named queues
//! - `Delivery` and `AckHandle`: a consumed message and its ack decision
//! - Implementations: AMQP (RabbitMQ), in-memory
//!
//! Delivery is at-least-once. A consumer owns the ack decision for every
//! delivery it takes; a delivery whose handle is never resolved is
//! redelivered by the broker.

use async_trait::async_trait;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;
mod producer;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;
pub use producer::Producer;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Declare failed for queue '{queue}': {message}")]
    Declare { queue: String, message: String },

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Queue '{0}' is not declared")]
    UnknownQueue(String),

    #[error("Queue '{0}' already has a consumer in this process")]
    AlreadyConsuming(String),
}

/// Stream of deliveries for one queue.
///
/// Lazy and unbounded; it ends only when the broker side goes away for good.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Interface for durable named work queues.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP 0-9-1
/// - `MemoryBroker`: in-process queues for tests and local runs
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    /// Create a durable queue. Declaring an existing queue is a no-op.
    async fn declare(&self, queue: &str) -> Result<()>;

    /// Publish a persistent message.
    ///
    /// Returns once the broker has confirmed receipt. On error nothing was
    /// enqueued.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()>;

    /// Start consuming a queue.
    ///
    /// At most one consumption loop per queue per process.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;
}

/// Backend-specific acknowledgement of a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Ack decision for one delivery. Consumed by whichever call resolves it.
pub struct AckHandle {
    inner: Box<dyn Acknowledger>,
}

impl AckHandle {
    pub fn new(inner: impl Acknowledger + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Mark the message processed; the broker forgets it.
    pub async fn ack(self) -> Result<()> {
        self.inner.ack().await
    }

    /// Mark the message failed. With `requeue` the broker redelivers it,
    /// without it the message is dropped (or dead-lettered by broker policy).
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.inner.nack(requeue).await
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AckHandle")
    }
}

/// A message taken from a queue.
#[derive(Debug)]
pub struct Delivery {
    /// Opaque message body.
    pub payload: Vec<u8>,
    /// True when the broker has delivered this message before.
    pub redelivered: bool,
    /// Ack decision, owned by the consumer from here on.
    pub handle: AckHandle,
}
