//! Retry policies for coordination store calls.
//!
//! Only failures classified as transient (`is_retriable()`) are retried;
//! `NotFound` and validation errors surface immediately.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `store_policy` | 50ms | 2s | 5 | Syncer reads, group administration |
//! | `fast_policy` | 5ms | 100ms | 3 | Stamps and single-node writes |
//! | `resync_policy` | 100ms | 5s | 10 | Syncer recovery after a failed event |

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Policy for reads and writes against the coordination store.
///
/// Long enough to ride out a store leader change, short enough that a
/// split blocked on a dead store fails within seconds.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for cheap single-node operations.
pub fn fast_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(3)
        .with_jitter()
}

/// Delays between full resyncs once an event could not be applied.
pub fn resync_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Execute an async operation with the store retry policy.
///
/// ```rust,ignore
/// let data = retry::with_store_policy(
///     || async { store.read_node(&path).await },
///     |e| e.is_retriable(),
/// ).await?;
/// ```
pub async fn with_store_policy<F, Fut, T, E, C>(operation: F, mut condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation
        .retry(store_policy())
        .when(move |e| {
            let retry = condition(e);
            if retry {
                record_retry_attempt("store");
            }
            retry
        })
        .await
}

/// Execute an async operation with the fast retry policy.
pub async fn with_fast_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation.retry(fast_policy()).when(condition).await
}

pub fn record_retry_attempt(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, "Retrying coordination store call");
}
