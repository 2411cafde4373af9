//! Ingestion workers: one consumption loop per event kind.
//!
//! Each message goes through decode, validate, enrich, persist, ack and
//! finally a best-effort republish on the live channel. The ack decision
//! follows the failure class:
//!
//! | Failure      | Action                              |
//! |--------------|-------------------------------------|
//! | decode       | nack without requeue                |
//! | validation   | nack without requeue                |
//! | persistence  | nack with requeue                   |
//! | live publish | logged only, message stays acked    |
//!
//! Delivery is at-least-once: a crash between persist and ack persists the
//! record again on redelivery.

mod batch;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::broker::{AckHandle, BrokerError, BrokerQueue, Delivery, DeliveryStream};
use crate::live::{publish_record, LiveChannel};
use crate::model::{FinancialMetric, Quote, Record, Sale, UserEvent, ValidationError};
use crate::persist::{PersistError, Persister};
use crate::topics::TopicTable;
use crate::utils::shutdown::ShutdownSignal;

/// Default number of records per persistence batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default idle time before a partial batch is flushed.
pub const DEFAULT_BATCH_LINGER: Duration = Duration::from_secs(1);

/// Why a message could not be ingested.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to persist record: {0}")]
    Persist(#[from] PersistError),
}

impl IngestError {
    /// Whether a retry could succeed.
    ///
    /// Decode and validation failures are properties of the payload and
    /// would fail forever; persistence failures are assumed transient.
    pub fn requeue(&self) -> bool {
        matches!(self, IngestError::Persist(_))
    }
}

/// How a delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Persisted and acked.
    Acked,
    /// Permanently failed, nacked without requeue.
    Rejected,
    /// Transiently failed, nacked with requeue.
    Requeued,
}

/// Batching parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Records per `persist_batch` call.
    pub size: usize,
    /// Idle time after which a partial batch is flushed anyway.
    pub linger: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            size: DEFAULT_BATCH_SIZE,
            linger: DEFAULT_BATCH_LINGER,
        }
    }
}

/// Consumption loop for one record type.
pub struct IngestionWorker<R: Record> {
    queue: String,
    broker: Arc<dyn BrokerQueue>,
    store: Arc<dyn Persister<R>>,
    live: Option<Arc<dyn LiveChannel>>,
    batch: Option<BatchSettings>,
}

impl<R: Record> IngestionWorker<R> {
    /// Worker for `R`, consuming the queue the topic table assigns to its kind.
    pub fn new(
        topics: &TopicTable,
        broker: Arc<dyn BrokerQueue>,
        store: Arc<dyn Persister<R>>,
    ) -> Self {
        Self {
            queue: topics.name(R::KIND).to_string(),
            broker,
            store,
            live: None,
            batch: None,
        }
    }

    /// Republish persisted records on the live channel.
    pub fn with_live(mut self, live: Arc<dyn LiveChannel>) -> Self {
        self.live = Some(live);
        self
    }

    /// Persist in batches instead of one record at a time.
    pub fn with_batching(mut self, settings: BatchSettings) -> Self {
        self.batch = Some(BatchSettings {
            size: settings.size.max(1),
            ..settings
        });
        self
    }

    /// Queue (and live channel) this worker is bound to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Decode, validate and enrich one payload.
    pub fn process(&self, payload: &[u8]) -> Result<R, IngestError> {
        let mut record = R::decode(payload)?;
        record.validate()?;
        record.enrich(Utc::now());
        Ok(record)
    }

    /// Consume until shutdown or until the delivery stream ends.
    ///
    /// The message being handled when shutdown arrives is finished first.
    /// Fails only if consumption cannot start.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), BrokerError> {
        let deliveries = self.broker.consume(&self.queue).await?;
        info!(
            queue = %self.queue,
            kind = %R::KIND,
            batch_size = self.batch.map(|b| b.size),
            "Ingestion worker started"
        );

        match self.batch {
            Some(settings) => self.run_batched(deliveries, shutdown, settings).await,
            None => self.run_single(deliveries, shutdown).await,
        }

        info!(queue = %self.queue, "Ingestion worker stopped");
        Ok(())
    }

    async fn run_single(&self, mut deliveries: DeliveryStream, mut shutdown: ShutdownSignal) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                next = deliveries.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        warn!(queue = %self.queue, "Delivery stream ended");
                        break;
                    }
                },
            };
            self.handle_delivery(delivery).await;
        }
    }

    /// Run one delivery through the pipeline and resolve its ack.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Outcome {
        let Delivery {
            payload,
            redelivered,
            handle,
        } = delivery;

        let result = match self.process(&payload) {
            Ok(record) => match self.store.persist(&record).await {
                Ok(()) => Ok(record),
                Err(e) => Err(IngestError::Persist(e)),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(record) => {
                if let Err(e) = handle.ack().await {
                    // Redelivery will persist a duplicate, which is tolerated.
                    error!(queue = %self.queue, error = %e, "Failed to ack message");
                }
                self.republish(std::slice::from_ref(&record)).await;
                Outcome::Acked
            }
            Err(e) => self.reject(handle, e, redelivered).await,
        }
    }

    async fn reject(
        &self,
        handle: AckHandle,
        err: IngestError,
        redelivered: bool,
    ) -> Outcome {
        let requeue = err.requeue();
        if requeue {
            warn!(queue = %self.queue, redelivered, error = %err, "Transient failure, requeueing message");
        } else {
            warn!(queue = %self.queue, redelivered, error = %err, "Dropping message");
        }
        if let Err(e) = handle.nack(requeue).await {
            error!(queue = %self.queue, error = %e, "Failed to nack message");
        }
        if requeue {
            Outcome::Requeued
        } else {
            Outcome::Rejected
        }
    }

    async fn republish(&self, records: &[R]) {
        let Some(live) = &self.live else {
            return;
        };
        for record in records {
            match publish_record(live.as_ref(), &self.queue, record).await {
                Ok(receivers) => {
                    debug!(channel = %self.queue, receivers, "Republished record")
                }
                Err(e) => {
                    error!(channel = %self.queue, error = %e, "Failed to publish to live channel")
                }
            }
        }
    }
}

/// Stores for every record type, used to build the full worker set.
pub struct Stores {
    pub quote: Arc<dyn Persister<Quote>>,
    pub sale: Arc<dyn Persister<Sale>>,
    pub user_event: Arc<dyn Persister<UserEvent>>,
    pub financial_metric: Arc<dyn Persister<FinancialMetric>>,
}

/// Spawn one worker per event kind.
///
/// Each task resolves to its worker's result once it stops.
pub fn spawn_all(
    topics: &TopicTable,
    broker: Arc<dyn BrokerQueue>,
    live: Option<Arc<dyn LiveChannel>>,
    stores: Stores,
    batch: Option<BatchSettings>,
    shutdown: ShutdownSignal,
) -> Vec<tokio::task::JoinHandle<Result<(), BrokerError>>> {
    fn spawn<R: Record>(
        topics: &TopicTable,
        broker: &Arc<dyn BrokerQueue>,
        live: &Option<Arc<dyn LiveChannel>>,
        store: Arc<dyn Persister<R>>,
        batch: Option<BatchSettings>,
        shutdown: &ShutdownSignal,
    ) -> tokio::task::JoinHandle<Result<(), BrokerError>> {
        let mut worker = IngestionWorker::new(topics, Arc::clone(broker), store);
        if let Some(live) = live {
            worker = worker.with_live(Arc::clone(live));
        }
        if let Some(settings) = batch {
            worker = worker.with_batching(settings);
        }
        tokio::spawn(worker.run(shutdown.clone()))
    }

    vec![
        spawn(topics, &broker, &live, stores.quote, batch, &shutdown),
        spawn(topics, &broker, &live, stores.sale, batch, &shutdown),
        spawn(topics, &broker, &live, stores.user_event, batch, &shutdown),
        spawn(
            topics,
            &broker,
            &live,
            stores.financial_metric,
            batch,
            &shutdown,
        ),
    ]
}
