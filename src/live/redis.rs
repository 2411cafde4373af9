//! Redis pub/sub live channel.
//!
//! Publishing goes through a shared `ConnectionManager`, which reconnects
//! on its own. Each subscription opens a dedicated pub/sub connection; the
//! stream ends when that connection drops and the caller resubscribes.

use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{debug, info, warn};

use super::{LiveChannel, LiveError, LiveMessage, LiveStream, Result};

/// Redis-backed live channel.
pub struct RedisLive {
    client: Client,
    conn: ConnectionManager,
}

impl RedisLive {
    /// Connect to Redis.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| LiveError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| LiveError::Connection(e.to_string()))?;

        info!(url = %url, "Connected to Redis live channel");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl LiveChannel for RedisLive {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn
            .publish(channel, payload)
            .await
            .map_err(|e| LiveError::Publish(e.to_string()))?;
        debug!(channel = %channel, receivers, "Published live message");
        Ok(receivers)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<LiveStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| LiveError::Subscribe(format!("Failed to open pub/sub: {}", e)))?;

        for channel in channels {
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| LiveError::Subscribe(format!("Failed to subscribe: {}", e)))?;
        }
        info!(channels = ?channels, "Subscribed to Redis channels");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(LiveMessage { channel, payload }),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Dropping non-text live message");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
