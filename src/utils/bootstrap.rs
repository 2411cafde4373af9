//! Bootstrap utilities for dashfeed binaries.
//!
//! Shared initialization code for the worker and stream binaries.

use std::future::Future;
use std::time::Duration;

use backon::Retryable;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;
use crate::utils::retry::connection_backoff;

/// Initialize tracing with the DASHFEED_LOG environment variable.
///
/// Defaults to "info" level if DASHFEED_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Config file path from the first command-line argument, if any.
pub fn parse_config_path() -> Option<String> {
    std::env::args().nth(1)
}

/// Connect to an external service with exponential backoff retry.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "rabbitmq", "redis")
/// * `address` - The address being connected to
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connected client on success, or the last error once
/// [`connection_backoff`] is exhausted.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let result = connect
        .retry(connection_backoff())
        .notify(|err: &E, dur: Duration| {
            warn!(
                service = %service_name,
                address = %address,
                error = %err,
                delay = ?dur,
                "Connection failed, retrying"
            );
        })
        .await;

    match &result {
        Ok(_) => info!(service = %service_name, address = %address, "Connected"),
        Err(e) => error!(
            service = %service_name,
            address = %address,
            error = %e,
            "Giving up on connection"
        ),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_connect_with_retry_recovers() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: Result<&str, String> = connect_with_retry("svc", "addr", move || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("refused".to_string())
            } else {
                Ok("connected")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
