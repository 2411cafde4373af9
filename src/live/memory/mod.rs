//! In-memory live channel using tokio broadcast channels.
//!
//! One broadcast sender per channel name, created on first use. Slow
//! subscribers that fall behind the buffer lose the oldest messages, which
//! matches pub/sub semantics.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{LiveChannel, LiveMessage, LiveStream, Result};

/// Buffered messages per channel before subscribers lag.
const CHANNEL_CAPACITY: usize = 1024;

/// In-process live channel.
#[derive(Default)]
pub struct MemoryLive {
    senders: RwLock<HashMap<String, broadcast::Sender<LiveMessage>>>,
}

impl MemoryLive {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<LiveMessage> {
        if let Some(sender) = self
            .senders
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(channel)
        {
            return sender.clone();
        }
        self.senders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Drop every channel, ending all open subscriptions.
    ///
    /// Simulates losing the pub/sub connection.
    pub fn disconnect_all(&self) {
        self.senders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        info!("Memory live channel disconnected all subscribers");
    }
}

fn receiver_stream(channel: String, rx: broadcast::Receiver<LiveMessage>) -> LiveStream {
    futures::stream::unfold((channel, rx), |(channel, mut rx)| async move {
        loop {
            match rx.recv().await {
                Ok(msg) => return Some((msg, (channel, rx))),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(channel = %channel, skipped = n, "Live subscriber lagged, skipped messages");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(channel = %channel, "Live channel closed");
                    return None;
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl LiveChannel for MemoryLive {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        let msg = LiveMessage {
            channel: channel.to_string(),
            payload,
        };
        // No receivers is not an error for pub/sub.
        let receivers = self.sender(channel).send(msg).unwrap_or(0);
        debug!(channel = %channel, receivers, "Published live message");
        Ok(receivers)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<LiveStream> {
        let streams: Vec<LiveStream> = channels
            .iter()
            .map(|channel| receiver_stream(channel.clone(), self.sender(channel).subscribe()))
            .collect();
        Ok(futures::stream::select_all(streams).boxed())
    }
}
