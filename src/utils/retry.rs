//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Provides standard
//! backoff configurations for startup connections, runtime reconnects and
//! broker publishes.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Ceiling for reconnect delays once a backoff iterator is exhausted.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Number of retries after the first publish attempt.
pub const PUBLISH_MAX_RETRIES: usize = 5;

/// Backoff for broker / pub-sub connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Backoff for consumer and subscription reconnects at runtime.
///
/// Callers keep reconnecting after the iterator runs out, sleeping
/// [`RECONNECT_MAX_DELAY`] between attempts, and rebuild the iterator after
/// every successful connection.
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(RECONNECT_MAX_DELAY)
        .with_max_times(10)
        .with_jitter()
}

/// Backoff for broker publish retries.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: [`PUBLISH_MAX_RETRIES`]
/// - Jitter enabled
pub fn publish_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(PUBLISH_MAX_RETRIES)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_publish_backoff_is_bounded() {
        assert_eq!(publish_backoff().build().count(), PUBLISH_MAX_RETRIES);
    }

    #[test]
    fn test_reconnect_delays_stay_under_ceiling() {
        // Jitter adds at most one extra base delay on top of the cap.
        for delay in reconnect_backoff().build() {
            assert!(delay <= RECONNECT_MAX_DELAY * 2);
        }
    }
}
