//! Live channel: ephemeral topic-based pub/sub.
//!
//! Workers republish persisted records here; the channel bridge subscribes
//! and forwards everything to the connection hub. Messages reach only the
//! subscribers present at publish time and are never replayed.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryLive;
#[cfg(feature = "redis")]
pub use self::redis::RedisLive;

/// Result type for live channel operations.
pub type Result<T> = std::result::Result<T, LiveError>;

/// Errors that can occur on the live channel.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One message received from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMessage {
    pub channel: String,
    pub payload: String,
}

/// Subscription stream. Dropping it ends the subscription.
pub type LiveStream = BoxStream<'static, LiveMessage>;

/// Interface for the live pub/sub transport.
///
/// Implementations:
/// - `RedisLive`: Redis PUBLISH / SUBSCRIBE
/// - `MemoryLive`: in-process broadcast channels
#[async_trait]
pub trait LiveChannel: Send + Sync {
    /// Deliver a payload to the channel's current subscribers.
    ///
    /// Returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize>;

    /// Subscribe to a set of channels.
    ///
    /// The stream ends if the underlying transport goes away.
    async fn subscribe(&self, channels: &[String]) -> Result<LiveStream>;
}

/// Serialize a record as JSON and publish it.
pub async fn publish_record<T: Serialize + ?Sized>(
    live: &dyn LiveChannel,
    channel: &str,
    record: &T,
) -> Result<usize> {
    let payload = serde_json::to_string(record)?;
    live.publish(channel, payload).await
}
