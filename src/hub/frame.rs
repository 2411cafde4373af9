//! JSON text frames exchanged with WebSocket clients.
//!
//! Every frame is an object with a `type` field. Outbound frames are
//! serialized from borrowed data so a broadcast is encoded exactly once.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent to clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame<'a> {
    /// A live channel message.
    Data { channel: &'a str, data: &'a Value },
    /// Acknowledges a subscribe request.
    Subscribed { channel: &'a str },
    /// Acknowledges an unsubscribe request.
    Unsubscribed { channel: &'a str },
}

impl ServerFrame<'_> {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Frames received from clients. Unknown types are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    #[serde(other)]
    Unknown,
}
