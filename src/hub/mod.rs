//! Connection hub: fans live messages out to WebSocket sessions.
//!
//! A single actor task owns the session registry and processes commands
//! from one bounded inbox in order, so register, unregister and broadcast
//! never race. Every session has a bounded mailbox; the hub never waits on
//! one. A session whose mailbox is full or closed when a broadcast arrives
//! is evicted, which keeps one slow client from stalling the others.
//!
//! The hub holds the only strong sender of each mailbox. Removing a session
//! from the registry therefore closes its mailbox, and the session's
//! outbound pump flushes what is queued, sends a close frame and exits.

mod frame;
mod session;

pub use frame::{ClientFrame, ServerFrame};
pub use session::Session;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{debug, error, info, warn};

/// Default per-session mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;
/// Default hub inbox capacity.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;
/// Default time sessions get to drain on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Identifies a session for its whole lifetime.
pub type SessionId = u64;

/// Channels a session asked for. Written by its inbound pump.
pub type Subscriptions = Arc<RwLock<HashSet<String>>>;

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

/// Errors that can occur talking to the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Hub is not running")]
    Closed,
}

/// Which sessions receive a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPolicy {
    /// Every registered session receives every channel. Subscriptions are
    /// acknowledged but only serve as client-side hints.
    #[default]
    All,
    /// Only sessions subscribed to the channel receive it.
    Subscribed,
}

/// Hub configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Frames buffered per session before it counts as a slow consumer.
    pub mailbox_capacity: usize,
    /// Commands buffered in the hub inbox.
    pub inbox_capacity: usize,
    /// Broadcast delivery policy.
    pub delivery: DeliveryPolicy,
    /// How long sessions get to drain on shutdown, in milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            delivery: DeliveryPolicy::default(),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl HubConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

pub(crate) enum HubCommand {
    Register {
        id: SessionId,
        mailbox: mpsc::Sender<Arc<str>>,
        subscriptions: Subscriptions,
    },
    Unregister(SessionId),
    Broadcast {
        channel: String,
        data: Value,
    },
    Count(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

struct Registered {
    mailbox: mpsc::Sender<Arc<str>>,
    subscriptions: Subscriptions,
}

/// The actor. Owns the registry; runs until shutdown or until every
/// handle is dropped.
struct Hub {
    inbox: mpsc::Receiver<HubCommand>,
    sessions: HashMap<SessionId, Registered>,
    delivery: DeliveryPolicy,
}

impl Hub {
    async fn run(mut self) {
        info!(delivery = ?self.delivery, "Hub started");
        while let Some(command) = self.inbox.recv().await {
            match command {
                HubCommand::Register {
                    id,
                    mailbox,
                    subscriptions,
                } => {
                    self.sessions.insert(
                        id,
                        Registered {
                            mailbox,
                            subscriptions,
                        },
                    );
                    info!(session = id, total = self.sessions.len(), "Client connected");
                }
                HubCommand::Unregister(id) => {
                    if self.sessions.remove(&id).is_some() {
                        info!(session = id, total = self.sessions.len(), "Client disconnected");
                    }
                }
                HubCommand::Broadcast { channel, data } => self.broadcast(&channel, &data).await,
                HubCommand::Count(reply) => {
                    let _ = reply.send(self.sessions.len());
                }
                HubCommand::Shutdown(reply) => {
                    info!(sessions = self.sessions.len(), "Hub shutting down, closing sessions");
                    self.sessions.clear();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("Hub stopped");
    }

    async fn broadcast(&mut self, channel: &str, data: &Value) {
        let frame: Arc<str> = match (ServerFrame::Data { channel, data }).encode() {
            Ok(encoded) => encoded.into(),
            Err(e) => {
                error!(channel = %channel, error = %e, "Failed to encode broadcast");
                return;
            }
        };

        let mut evicted = Vec::new();
        for (id, session) in &self.sessions {
            if self.delivery == DeliveryPolicy::Subscribed
                && !session.subscriptions.read().await.contains(channel)
            {
                continue;
            }
            if session.mailbox.try_send(Arc::clone(&frame)).is_err() {
                evicted.push(*id);
            }
        }

        for id in evicted {
            self.sessions.remove(&id);
            warn!(
                session = id,
                total = self.sessions.len(),
                "Evicted slow or closed session"
            );
        }
    }
}

/// Cloneable handle to the hub actor.
#[derive(Clone)]
pub struct HubHandle {
    inbox: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
    mailbox_capacity: usize,
    active: Arc<watch::Sender<usize>>,
}

impl HubHandle {
    /// Start the hub actor.
    pub fn spawn(config: &HubConfig) -> (HubHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.inbox_capacity.max(1));
        let hub = Hub {
            inbox: rx,
            sessions: HashMap::new(),
            delivery: config.delivery,
        };
        let task = tokio::spawn(hub.run());
        let (active, _) = watch::channel(0);

        let handle = HubHandle {
            inbox: tx,
            next_id: Arc::new(AtomicU64::new(1)),
            mailbox_capacity: config.mailbox_capacity.max(1),
            active: Arc::new(active),
        };
        (handle, task)
    }

    async fn send(&self, command: HubCommand) -> Result<()> {
        self.inbox.send(command).await.map_err(|_| HubError::Closed)
    }

    /// Create a session and register it.
    ///
    /// The returned session is registered once the hub processes the
    /// command; commands are ordered, so any later broadcast reaches it.
    pub async fn register(&self) -> Result<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        let subscriptions: Subscriptions = Arc::default();
        let acks = tx.downgrade();

        self.send(HubCommand::Register {
            id,
            mailbox: tx,
            subscriptions: Arc::clone(&subscriptions),
        })
        .await?;

        Ok(Session::new(
            id,
            rx,
            acks,
            subscriptions,
            self.clone(),
            session::ActiveGuard::new(Arc::clone(&self.active)),
        ))
    }

    /// Remove a session and close its mailbox. Unknown ids are ignored.
    pub async fn unregister(&self, id: SessionId) -> Result<()> {
        self.send(HubCommand::Unregister(id)).await
    }

    /// Queue a message for every eligible session.
    pub async fn broadcast(&self, channel: impl Into<String>, data: Value) -> Result<()> {
        self.send(HubCommand::Broadcast {
            channel: channel.into(),
            data,
        })
        .await
    }

    /// Number of registered sessions.
    pub async fn session_count(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Count(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Close every session and stop the hub.
    ///
    /// Waits up to `grace` for sessions to flush and exit. Returns `true`
    /// when all of them did.
    pub async fn shutdown(&self, grace: Duration) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Shutdown(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)?;

        let mut active = self.active.subscribe();
        let drained = tokio::time::timeout(grace, active.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if !drained {
            warn!(remaining = *active.borrow(), "Sessions still open after grace period");
        }
        Ok(drained)
    }
}
