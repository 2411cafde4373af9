//! Publishes domain events onto their work queues.

use std::sync::Arc;

use tracing::{debug, error};

use super::{BrokerError, BrokerQueue, Result};
use crate::model::DomainEvent;
use crate::topics::TopicTable;

/// Routes each event to the queue of its kind and publishes it.
#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn BrokerQueue>,
    topics: TopicTable,
}

impl Producer {
    pub fn new(broker: Arc<dyn BrokerQueue>, topics: TopicTable) -> Self {
        Self { broker, topics }
    }

    /// Declare every queue in the topic table.
    pub async fn declare_all(&self) -> Result<()> {
        for name in self.topics.names() {
            self.broker.declare(&name).await?;
        }
        Ok(())
    }

    /// Publish one event to the queue for its kind.
    pub async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let queue = self.topics.name(event.kind());
        let payload = event
            .to_payload()
            .map_err(|e| BrokerError::Publish(format!("Failed to encode event: {}", e)))?;

        self.broker.publish(queue, payload).await.map_err(|e| {
            error!(queue = %queue, error = %e, "Failed to publish event");
            e
        })?;
        debug!(queue = %queue, kind = %event.kind(), "Published event");
        Ok(())
    }

    /// Publish events in order, stopping at the first failure.
    ///
    /// Returns how many were published. On failure the error is returned
    /// and the events before it stay published.
    pub async fn publish_batch(&self, events: &[DomainEvent]) -> Result<usize> {
        for (published, event) in events.iter().enumerate() {
            if let Err(e) = self.publish(event).await {
                error!(published, total = events.len(), "Batch publish stopped");
                return Err(e);
            }
        }
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::model::{Quote, Sale};

    async fn setup() -> (Arc<MemoryBroker>, Producer) {
        let broker = Arc::new(MemoryBroker::new());
        let producer = Producer::new(broker.clone(), TopicTable::default());
        producer.declare_all().await.unwrap();
        (broker, producer)
    }

    #[tokio::test]
    async fn test_publish_routes_by_kind() {
        let (broker, producer) = setup().await;

        let quote = DomainEvent::from(Quote {
            symbol: "AAPL".to_string(),
            ..Default::default()
        });
        producer.publish(&quote).await.unwrap();

        assert_eq!(broker.stats("stock_quotes").await.unwrap().published, 1);
        assert_eq!(broker.stats("sales").await.unwrap().published, 0);
    }

    #[tokio::test]
    async fn test_publish_batch_counts() {
        let (broker, producer) = setup().await;

        let events: Vec<DomainEvent> = (0..3)
            .map(|i| {
                DomainEvent::from(Sale {
                    product_name: format!("widget-{}", i),
                    quantity: 1,
                    unit_price: 2.0,
                    ..Default::default()
                })
            })
            .collect();

        assert_eq!(producer.publish_batch(&events).await.unwrap(), 3);
        assert_eq!(broker.stats("sales").await.unwrap().published, 3);
    }

    #[tokio::test]
    async fn test_publish_batch_stops_on_failure() {
        let (broker, producer) = setup().await;
        broker.set_fail_on_publish(true);

        let events = vec![DomainEvent::from(Quote::default())];
        assert!(producer.publish_batch(&events).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_batch_keeps_events_before_failure() {
        let broker = Arc::new(MemoryBroker::new());
        broker.declare("stock_quotes").await.unwrap();
        let producer = Producer::new(broker.clone(), TopicTable::default());

        // The sales queue was never declared.
        let events = vec![
            DomainEvent::from(Quote::default()),
            DomainEvent::from(Sale::default()),
            DomainEvent::from(Quote::default()),
        ];
        assert!(matches!(
            producer.publish_batch(&events).await,
            Err(BrokerError::UnknownQueue(_))
        ));
        assert_eq!(broker.stats("stock_quotes").await.unwrap().published, 1);
    }
}
