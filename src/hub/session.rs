//! One WebSocket connection, driven by two pumps.
//!
//! The inbound pump reads client frames and maintains the subscription
//! set. The outbound pump drains the mailbox into the socket. Whichever
//! pump finishes first ends the session; the session then unregisters
//! (a no-op if the hub already removed it) and the socket halves are
//! dropped together.

use std::fmt::Display;
use std::pin::pin;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{ClientFrame, HubHandle, ServerFrame, SessionId, Subscriptions};

/// Keeps the hub's count of running sessions accurate.
pub(super) struct ActiveGuard(Arc<watch::Sender<usize>>);

impl ActiveGuard {
    pub(super) fn new(active: Arc<watch::Sender<usize>>) -> Self {
        active.send_modify(|n| *n += 1);
        Self(active)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// A registered client session.
pub struct Session {
    pub(super) id: SessionId,
    pub(super) mailbox: mpsc::Receiver<Arc<str>>,
    pub(super) acks: mpsc::WeakSender<Arc<str>>,
    pub(super) subscriptions: Subscriptions,
    hub: HubHandle,
    _active: ActiveGuard,
}

impl Session {
    pub(super) fn new(
        id: SessionId,
        mailbox: mpsc::Receiver<Arc<str>>,
        acks: mpsc::WeakSender<Arc<str>>,
        subscriptions: Subscriptions,
        hub: HubHandle,
        active: ActiveGuard,
    ) -> Self {
        Self {
            id,
            mailbox,
            acks,
            subscriptions,
            hub,
            _active: active,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn into_mailbox(self) -> mpsc::Receiver<Arc<str>> {
        self.mailbox
    }

    /// Drive the connection until either side ends it.
    pub async fn run<W, R, E>(self, sink: W, stream: R)
    where
        W: Sink<Message> + Unpin,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let Session {
            id,
            mailbox,
            acks,
            subscriptions,
            hub,
            _active,
        } = self;

        let outbound = pin!(outbound_pump(id, mailbox, sink));
        let inbound = pin!(inbound_pump(id, stream, acks, subscriptions));

        tokio::select! {
            _ = outbound => debug!(session = id, "Outbound pump finished"),
            _ = inbound => debug!(session = id, "Inbound pump finished"),
        }

        // The hub may already be gone during shutdown.
        let _ = hub.unregister(id).await;
    }
}

/// Queue an ack frame on the session's own mailbox.
///
/// Returns `false` when the session should end: the hub already dropped it,
/// or the mailbox is full and the client is not keeping up.
pub(super) fn queue_ack(id: SessionId, acks: &mpsc::WeakSender<Arc<str>>, frame: ServerFrame<'_>) -> bool {
    let Some(tx) = acks.upgrade() else {
        return false;
    };
    let encoded = match frame.encode() {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!(session = id, error = %e, "Failed to encode ack frame");
            return true;
        }
    };
    match tx.try_send(encoded.into()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(session = id, "Mailbox full while queueing ack, dropping slow session");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

async fn inbound_pump<R, E>(
    id: SessionId,
    mut stream: R,
    acks: mpsc::WeakSender<Arc<str>>,
    subscriptions: Subscriptions,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(session = id, error = %e, "WebSocket read failed");
                break;
            }
        };

        let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(session = id, error = %e, "Ignoring malformed client frame");
                continue;
            }
        };

        let keep_going = match frame {
            ClientFrame::Subscribe { channel } => {
                subscriptions.write().await.insert(channel.clone());
                debug!(session = id, channel = %channel, "Subscribed");
                queue_ack(id, &acks, ServerFrame::Subscribed { channel: &channel })
            }
            ClientFrame::Unsubscribe { channel } => {
                subscriptions.write().await.remove(&channel);
                debug!(session = id, channel = %channel, "Unsubscribed");
                queue_ack(id, &acks, ServerFrame::Unsubscribed { channel: &channel })
            }
            ClientFrame::Unknown => true,
        };
        if !keep_going {
            break;
        }
    }
}

async fn outbound_pump<W>(id: SessionId, mut mailbox: mpsc::Receiver<Arc<str>>, mut sink: W)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(frame) = mailbox.recv().await {
        if let Err(e) = sink.send(Message::Text(String::from(&*frame).into())).await {
            debug!(session = id, error = %e, "WebSocket write failed");
            return;
        }
    }

    // Mailbox closed by the hub.
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!(session = id, error = %e, "Failed to send close frame");
    }
}
