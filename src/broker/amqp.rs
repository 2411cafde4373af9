//! AMQP (RabbitMQ) broker implementation.
//!
//! Work queues are durable queues on the default exchange: publishing to
//! queue `q` uses routing key `q`. Publishes wait for publisher confirms.
//! Consumers use manual acks with a bounded prefetch and reconnect with
//! exponential backoff when the channel or connection drops.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{
    AckHandle, Acknowledger, BrokerError, BrokerQueue, Delivery, DeliveryStream, Result,
};
use crate::utils::retry::{
    publish_backoff, reconnect_backoff, PUBLISH_MAX_RETRIES, RECONNECT_MAX_DELAY,
};

/// Default prefetch (unacked deliveries per consumer).
pub const DEFAULT_PREFETCH: u16 = 100;

/// Connection pool size.
const POOL_MAX_SIZE: usize = 10;

/// Configuration for the AMQP connection.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Maximum unacknowledged deliveries per consumer.
    pub prefetch: u16,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

/// Releases the per-process consumer slot for a queue.
struct ConsumerSlot {
    queue: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl ConsumerSlot {
    fn claim(active: &Arc<Mutex<HashSet<String>>>, queue: &str) -> Result<Self> {
        let mut guard = active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !guard.insert(queue.to_string()) {
            return Err(BrokerError::AlreadyConsuming(queue.to_string()));
        }
        Ok(Self {
            queue: queue.to_string(),
            active: Arc::clone(active),
        })
    }
}

impl Drop for ConsumerSlot {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.queue);
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Ack(format!("Failed to nack: {}", e)))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        payload: delivery.data,
        redelivered: delivery.redelivered,
        handle: AckHandle::new(AmqpAcker {
            acker: delivery.acker,
        }),
    }
}

/// RabbitMQ broker.
pub struct AmqpBroker {
    pool: Pool,
    config: AmqpConfig,
    consuming: Arc<Mutex<HashSet<String>>>,
}

impl AmqpBroker {
    /// Create the connection pool and verify one connection.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_MAX_SIZE)
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {}", e)))?;

        let conn = pool
            .get()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;
        conn.create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))?;

        info!(url = %config.url, prefetch = config.prefetch, "Connected to AMQP");

        Ok(Self {
            pool,
            config,
            consuming: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Get a channel from the pool.
    async fn get_channel(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BrokerError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))
    }

    async fn declare_on(channel: &Channel, queue: &str) -> Result<()> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Set up a consumer channel with prefetch and manual acks.
    ///
    /// The channel is returned with the consumer so it outlives setup.
    async fn setup_consumer(
        pool: &Pool,
        queue: &str,
        prefetch: u16,
    ) -> Result<(Channel, lapin::Consumer)> {
        let channel = Self::get_channel(pool).await?;
        Self::declare_on(&channel, queue).await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to set prefetch: {}", e)))?;

        let tag = format!("dashfeed-{}-{}", queue, uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        Ok((channel, consumer))
    }

    /// Forward deliveries to `tx`, reconnecting with backoff and jitter.
    ///
    /// Returns once the receiving side is dropped.
    async fn consume_with_reconnect(
        pool: Pool,
        queue: String,
        prefetch: u16,
        first: (Channel, lapin::Consumer),
        tx: mpsc::Sender<Delivery>,
        _slot: ConsumerSlot,
    ) {
        let backoff_builder = reconnect_backoff();
        let mut backoff_iter = backoff_builder.build();
        let mut current = Some(first);

        loop {
            let setup = match current.take() {
                Some(ready) => Ok(ready),
                None => Self::setup_consumer(&pool, &queue, prefetch).await,
            };

            match setup {
                Ok((_channel, mut consumer)) => {
                    info!(queue = %queue, "Consumer connected, processing messages");
                    backoff_iter = backoff_builder.build();

                    loop {
                        tokio::select! {
                            _ = tx.closed() => {
                                debug!(queue = %queue, "Delivery stream dropped, stopping consumer");
                                return;
                            }
                            next = consumer.next() => match next {
                                Some(Ok(delivery)) => {
                                    if tx.send(into_delivery(delivery)).await.is_err() {
                                        return;
                                    }
                                }
                                Some(Err(e)) => {
                                    error!(queue = %queue, error = %e, "Consumer delivery error, will reconnect");
                                    break;
                                }
                                None => {
                                    info!(queue = %queue, "Consumer stream ended, reconnecting...");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(RECONNECT_MAX_DELAY);
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = %queue,
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::select! {
                        _ = tx.closed() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            }

            let delay = backoff_iter.next().unwrap_or(RECONNECT_MAX_DELAY);
            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl BrokerQueue for AmqpBroker {
    async fn declare(&self, queue: &str) -> Result<()> {
        let channel = Self::get_channel(&self.pool).await?;
        Self::declare_on(&channel, queue).await?;
        info!(queue = %queue, "Declared queue");
        Ok(())
    }

    #[tracing::instrument(name = "broker.publish", skip_all, fields(queue = %queue))]
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO)
            .chain(publish_backoff().build())
            .enumerate()
        {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            // Fresh channel per attempt picks up a reconnected pool entry.
            let channel = match Self::get_channel(&self.pool).await {
                Ok(ch) => ch,
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = PUBLISH_MAX_RETRIES,
                        error = %e,
                        "Failed to get channel, retrying..."
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            if let Err(e) = channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
            {
                warn!(attempt = attempt + 1, error = %e, "Failed to enable confirms, retrying...");
                last_error = Some(BrokerError::Publish(format!(
                    "Failed to enable confirms: {}",
                    e
                )));
                continue;
            }

            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2); // persistent

            match channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(confirmation) if confirmation.is_nack() => {
                        warn!(attempt = attempt + 1, "Broker nacked publish, retrying...");
                        last_error = Some(BrokerError::Publish(
                            "Broker rejected message".to_string(),
                        ));
                    }
                    Ok(_) => {
                        debug!(queue = %queue, bytes = payload.len(), "Published message");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(
                            attempt = attempt + 1,
                            max_retries = PUBLISH_MAX_RETRIES,
                            error = %e,
                            "Publish confirmation failed, retrying..."
                        );
                        last_error = Some(BrokerError::Publish(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = PUBLISH_MAX_RETRIES,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    last_error = Some(BrokerError::Publish(format!("Failed to publish: {}", e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BrokerError::Publish("Max retries exceeded".to_string())))
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let slot = ConsumerSlot::claim(&self.consuming, queue)?;

        // Setup failures at start are reported; later ones are retried.
        let first = Self::setup_consumer(&self.pool, queue, self.config.prefetch).await?;

        let (tx, rx) = mpsc::channel(usize::from(self.config.prefetch.max(1)));
        tokio::spawn(Self::consume_with_reconnect(
            self.pool.clone(),
            queue.to_string(),
            self.config.prefetch,
            first,
            tx,
            slot,
        ));

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = AmqpConfig::new("amqp://localhost:5672");
        assert_eq!(config.url, "amqp://localhost:5672");
        assert_eq!(config.prefetch, DEFAULT_PREFETCH);
    }

    #[test]
    fn test_consumer_slot_is_exclusive() {
        let active = Arc::new(Mutex::new(HashSet::new()));
        let slot = ConsumerSlot::claim(&active, "sales").unwrap();
        assert!(matches!(
            ConsumerSlot::claim(&active, "sales"),
            Err(BrokerError::AlreadyConsuming(_))
        ));
        assert!(ConsumerSlot::claim(&active, "stock_quotes").is_ok());

        drop(slot);
        assert!(ConsumerSlot::claim(&active, "sales").is_ok());
    }
}
