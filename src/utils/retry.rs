//! Backoff policies.
//!
//! Uses `backon` for exponential backoff with jitter. Outbound sends do not use
//! these: the sender retries a failed send forever at a fixed interval.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for store reads at startup (reloading the outbox).
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 10
/// - Jitter enabled
pub fn store_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}
