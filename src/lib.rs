//! Dashfeed - queue-driven ingestion and real-time fan-out
//!
//! Events (stock quotes, sales, user behaviour, financial metrics) arrive on
//! durable work queues. Ingestion workers validate, enrich and persist them,
//! then republish each record on a live pub/sub channel. The stream service
//! bridges that channel into a connection hub that pushes every message to
//! connected WebSocket clients.
//!
//! ```text
//! Producer -> Broker queue -> IngestionWorker -> Persister
//!                                    |
//!                                    v
//!                              Live channel -> ChannelBridge -> Hub -> Sessions
//! ```

pub mod bridge;
pub mod broker;
pub mod config;
pub mod hub;
pub mod live;
pub mod model;
pub mod persist;
pub mod server;
pub mod topics;
pub mod utils;
pub mod worker;
