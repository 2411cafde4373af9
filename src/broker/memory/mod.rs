//! In-memory broker for tests and single-process runs.
//!
//! Models the parts of broker behaviour the pipeline relies on: durable
//! named queues, one consumer per queue, ack / nack with requeue, the
//! redelivered flag, and redelivery of messages whose ack handle is
//! dropped without a decision.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};

use super::{
    AckHandle, Acknowledger, BrokerError, BrokerQueue, Delivery, DeliveryStream, Result,
};

struct Envelope {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct Counters {
    published: AtomicUsize,
    acked: AtomicUsize,
    rejected: AtomicUsize,
    requeued: AtomicUsize,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages accepted by `publish`.
    pub published: usize,
    /// Deliveries acked.
    pub acked: usize,
    /// Deliveries nacked without requeue.
    pub rejected: usize,
    /// Deliveries returned to the queue (nack with requeue, or abandoned).
    pub requeued: usize,
    /// Messages waiting to be delivered.
    pub pending: usize,
}

struct Queue {
    name: String,
    messages: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    consuming: AtomicBool,
    counters: Counters,
}

impl Queue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            consuming: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    fn messages(&self) -> std::sync::MutexGuard<'_, VecDeque<Envelope>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_back(&self, envelope: Envelope) {
        self.messages().push_back(envelope);
        self.notify.notify_one();
    }

    /// Requeued messages go back to the head, as RabbitMQ does.
    fn push_front(&self, envelope: Envelope) {
        self.messages().push_front(envelope);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Envelope> {
        self.messages().pop_front()
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            published: self.counters.published.load(Ordering::SeqCst),
            acked: self.counters.acked.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            requeued: self.counters.requeued.load(Ordering::SeqCst),
            pending: self.messages().len(),
        }
    }
}

/// Releases the single-consumer slot when the delivery stream is dropped.
struct ConsumerGuard(Arc<Queue>);

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.0.consuming.store(false, Ordering::SeqCst);
        debug!(queue = %self.0.name, "Memory consumer released");
    }
}

struct MemoryAcker {
    queue: Arc<Queue>,
    payload: Vec<u8>,
    resolved: AtomicBool,
}

impl MemoryAcker {
    fn resolve(&self) -> Result<()> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Ack("delivery already resolved".to_string()));
        }
        Ok(())
    }

    fn requeue(&self) {
        self.queue.counters.requeued.fetch_add(1, Ordering::SeqCst);
        self.queue.push_front(Envelope {
            payload: self.payload.clone(),
            redelivered: true,
        });
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.resolve()?;
        self.queue.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.resolve()?;
        if requeue {
            self.requeue();
        } else {
            self.queue.counters.rejected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.resolved.load(Ordering::SeqCst) {
            debug!(queue = %self.queue.name, "Unresolved delivery dropped, redelivering");
            self.requeue();
        }
    }
}

/// In-process broker.
#[derive(Default)]
pub struct MemoryBroker {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    fail_on_publish: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `publish` fail with a transport error.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Counters for a queue, if declared.
    pub async fn stats(&self, queue: &str) -> Option<QueueStats> {
        self.queues.read().await.get(queue).map(|q| q.stats())
    }

    async fn queue(&self, queue: &str) -> Result<Arc<Queue>> {
        self.queues
            .read()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))
    }
}

#[async_trait]
impl BrokerQueue for MemoryBroker {
    async fn declare(&self, queue: &str) -> Result<()> {
        let mut queues = self.queues.write().await;
        if !queues.contains_key(queue) {
            queues.insert(queue.to_string(), Arc::new(Queue::new(queue)));
            info!(queue = %queue, "Declared memory queue");
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("Mock publish failure".to_string()));
        }
        let q = self.queue(queue).await?;
        q.counters.published.fetch_add(1, Ordering::SeqCst);
        q.push_back(Envelope {
            payload,
            redelivered: false,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let q = self.queue(queue).await?;
        if q.consuming.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyConsuming(queue.to_string()));
        }

        let stream = futures::stream::unfold(ConsumerGuard(q), |guard| async move {
            loop {
                if let Some(envelope) = guard.0.pop() {
                    let delivery = Delivery {
                        payload: envelope.payload.clone(),
                        redelivered: envelope.redelivered,
                        handle: AckHandle::new(MemoryAcker {
                            queue: Arc::clone(&guard.0),
                            payload: envelope.payload,
                            resolved: AtomicBool::new(false),
                        }),
                    };
                    return Some((delivery, guard));
                }
                guard.0.notify.notified().await;
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests;
