//! dashfeed-stream: Real-time fan-out service
//!
//! Subscribes to the Redis live channels and pushes every message to
//! connected WebSocket clients.
//!
//! ## Architecture
//! ```text
//! [Redis pub/sub] -> [ChannelBridge] -> [Hub] -> [WebSocket sessions]
//! ```
//!
//! ## Endpoints
//! - `GET /ws`: WebSocket upgrade
//! - `GET /health`: service status and connected session count
//!
//! ## Configuration
//! - DASHFEED__LIVE__REDIS__URL: Redis connection string
//! - DASHFEED__SERVER__PORT: listen port (default: 8080)
//! - DASHFEED__HUB__DELIVERY: `all` or `subscribed`

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use dashfeed::bridge::ChannelBridge;
use dashfeed::config::Config;
use dashfeed::hub::HubHandle;
use dashfeed::live::RedisLive;
use dashfeed::server;
use dashfeed::utils::bootstrap::{connect_with_retry, init_tracing, parse_config_path};
use dashfeed::utils::shutdown::{self, wait_for_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting dashfeed-stream");

    let redis_url = config.live.redis.url.clone();
    let live = connect_with_retry("redis", &redis_url, || RedisLive::connect(&redis_url)).await?;

    let (hub, hub_task) = HubHandle::spawn(&config.hub);
    let (trigger, signal) = shutdown::channel();

    let bridge = ChannelBridge::new(Arc::new(live), hub.clone(), &config.topics);
    let bridge_task = tokio::spawn(bridge.run(signal.clone()));

    let listener = TcpListener::bind(config.server.bind_address()).await?;
    let server_task = tokio::spawn(server::serve(listener, hub.clone(), signal));

    wait_for_signal().await;
    trigger.trigger();

    let grace = config.hub.shutdown_grace();
    match hub.shutdown(grace).await {
        Ok(true) => info!("All sessions closed"),
        Ok(false) => warn!("Forcing close of remaining sessions"),
        Err(e) => warn!(error = %e, "Hub already stopped"),
    }

    if let Err(e) = bridge_task.await {
        error!(error = %e, "Bridge task panicked");
    }

    match tokio::time::timeout(grace, server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Server error"),
        Ok(Err(e)) => error!(error = %e, "Server task panicked"),
        Err(_) => warn!("Server did not stop within grace period"),
    }

    let _ = hub_task.await;
    info!("dashfeed-stream stopped");
    Ok(())
}
