//! Batched persistence.
//!
//! Accepted records are held together with their ack handles. A batch is
//! flushed with one `persist_batch` call when it is full, when it has sat
//! idle for the linger period, on shutdown, and when the delivery stream
//! ends. Acks are only sent after the batch is stored; a failed batch is
//! nacked with requeue as a whole.

use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{BatchSettings, IngestionWorker, Outcome};
use crate::broker::{AckHandle, DeliveryStream};
use crate::model::Record;
use crate::utils::shutdown::ShutdownSignal;

struct Pending<R> {
    record: R,
    handle: AckHandle,
}

impl<R: Record> IngestionWorker<R> {
    pub(super) async fn run_batched(
        &self,
        mut deliveries: DeliveryStream,
        mut shutdown: ShutdownSignal,
        settings: BatchSettings,
    ) {
        let mut batch: Vec<Pending<R>> = Vec::with_capacity(settings.size);
        let mut deadline: Option<Instant> = None;

        loop {
            let linger = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = linger => {
                    debug!(queue = %self.queue, pending = batch.len(), "Linger elapsed, flushing partial batch");
                    self.flush(&mut batch).await;
                    deadline = None;
                }
                next = deliveries.next() => match next {
                    Some(delivery) => match self.process(&delivery.payload) {
                        Ok(record) => {
                            batch.push(Pending { record, handle: delivery.handle });
                            if batch.len() >= settings.size {
                                self.flush(&mut batch).await;
                                deadline = None;
                            } else if deadline.is_none() {
                                deadline = Some(Instant::now() + settings.linger);
                            }
                        }
                        Err(e) => {
                            self.reject(delivery.handle, e, delivery.redelivered).await;
                        }
                    },
                    None => {
                        warn!(queue = %self.queue, "Delivery stream ended");
                        break;
                    }
                },
            }
        }

        if !batch.is_empty() {
            info!(queue = %self.queue, pending = batch.len(), "Flushing partial batch before stopping");
            self.flush(&mut batch).await;
        }
    }

    /// Persist and resolve everything in `batch`, leaving it empty.
    async fn flush(&self, batch: &mut Vec<Pending<R>>) -> Outcome {
        let (records, handles): (Vec<R>, Vec<AckHandle>) = std::mem::take(batch)
            .into_iter()
            .map(|p| (p.record, p.handle))
            .unzip();

        if records.is_empty() {
            return Outcome::Acked;
        }

        match self.store.persist_batch(&records).await {
            Ok(()) => {
                for handle in handles {
                    if let Err(e) = handle.ack().await {
                        error!(queue = %self.queue, error = %e, "Failed to ack message");
                    }
                }
                debug!(queue = %self.queue, count = records.len(), "Persisted batch");
                self.republish(&records).await;
                Outcome::Acked
            }
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    count = records.len(),
                    error = %e,
                    "Batch persistence failed, requeueing batch"
                );
                for handle in handles {
                    if let Err(e) = handle.nack(true).await {
                        error!(queue = %self.queue, error = %e, "Failed to nack message");
                    }
                }
                Outcome::Requeued
            }
        }
    }
}
