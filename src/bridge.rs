//! Channel bridge: live channel subscription into hub broadcasts.
//!
//! Subscribes once to every topic channel and forwards each message as
//! untyped JSON. A message that is not valid JSON is logged and skipped.
//! When the subscription ends the bridge resubscribes with exponential
//! backoff, until shutdown.

use std::sync::Arc;

use backon::BackoffBuilder;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::hub::HubHandle;
use crate::live::{LiveChannel, LiveMessage};
use crate::topics::TopicTable;
use crate::utils::retry::{reconnect_backoff, RECONNECT_MAX_DELAY};
use crate::utils::shutdown::ShutdownSignal;

/// Forwards live channel traffic to the hub.
pub struct ChannelBridge {
    live: Arc<dyn LiveChannel>,
    hub: HubHandle,
    channels: Vec<String>,
}

impl ChannelBridge {
    pub fn new(live: Arc<dyn LiveChannel>, hub: HubHandle, topics: &TopicTable) -> Self {
        Self {
            live,
            hub,
            channels: topics.names(),
        }
    }

    /// Run until shutdown or until the hub stops.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let backoff_builder = reconnect_backoff();
        let mut backoff_iter = backoff_builder.build();

        loop {
            match self.live.subscribe(&self.channels).await {
                Ok(mut stream) => {
                    info!(channels = ?self.channels, "Bridge subscribed to live channels");
                    backoff_iter = backoff_builder.build();

                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown.recv() => {
                                info!("Bridge stopping");
                                return;
                            }
                            next = stream.next() => match next {
                                Some(message) => {
                                    if !self.forward(message).await {
                                        info!("Hub stopped, bridge exiting");
                                        return;
                                    }
                                }
                                None => {
                                    warn!("Live subscription ended, resubscribing");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to subscribe to live channels");
                }
            }

            let delay = backoff_iter.next().unwrap_or(RECONNECT_MAX_DELAY);
            debug!(backoff_ms = %delay.as_millis(), "Waiting before resubscribing");
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Returns `false` once the hub is gone.
    async fn forward(&self, message: LiveMessage) -> bool {
        let data: Value = match serde_json::from_str(&message.payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "Skipping undecodable live message");
                return true;
            }
        };
        self.hub.broadcast(message.channel, data).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use crate::live::MemoryLive;
    use crate::utils::shutdown;
    use std::time::Duration;

    async fn wait_for_subscribers(live: &MemoryLive, channel: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while live.publish(channel, "null".to_string()).await.unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Bridge never subscribed");
    }

    #[tokio::test]
    async fn test_forwards_json_and_skips_garbage() {
        let live = Arc::new(MemoryLive::new());
        let (hub, _hub_task) = HubHandle::spawn(&HubConfig::default());
        let session = hub.register().await.unwrap();
        let mut mailbox = session.into_mailbox();

        let (trigger, signal) = shutdown::channel();
        let bridge = ChannelBridge::new(live.clone(), hub.clone(), &TopicTable::default());
        let task = tokio::spawn(bridge.run(signal));

        wait_for_subscribers(&live, "sales").await;

        live.publish("sales", "{not json".to_string()).await.unwrap();
        live.publish("sales", r#"{"revenue":90.0}"#.to_string())
            .await
            .unwrap();

        // Skip the null messages sent while waiting for the subscription.
        let value = loop {
            let frame = tokio::time::timeout(Duration::from_secs(1), mailbox.recv())
                .await
                .unwrap()
                .unwrap();
            let value: Value = serde_json::from_str(&frame).unwrap();
            if !value["data"].is_null() {
                break value;
            }
        };
        assert_eq!(value["channel"], "sales");
        assert_eq!(value["data"]["revenue"], 90.0);

        trigger.trigger();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_resubscribes_after_disconnect() {
        let live = Arc::new(MemoryLive::new());
        let (hub, _hub_task) = HubHandle::spawn(&HubConfig::default());
        let (trigger, signal) = shutdown::channel();
        let bridge = ChannelBridge::new(live.clone(), hub, &TopicTable::default());
        let task = tokio::spawn(bridge.run(signal));

        wait_for_subscribers(&live, "stock_quotes").await;
        live.disconnect_all();
        wait_for_subscribers(&live, "stock_quotes").await;

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
