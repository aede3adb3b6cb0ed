//! Prometheus metrics for the region-tree subsystem.
//!
//! Metrics cover:
//! - Split and merge outcomes per partitioner
//! - Replica allocations per placement strategy
//! - Syncer activity (watch events, rebuilds, callback deliveries)
//! - Local id mapper size
//! - Waits that ran into their timeout
//!
//! All metrics are registered to a custom registry with the "regiontree" prefix.
//! A metric that fails to register falls back to an unregistered instance so
//! recording never panics.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for region-tree metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("regiontree".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Structural operations
// =============================================================================

define_counter_vec!(
    SPLIT_OPERATIONS,
    "split_operations_total",
    "Region split steps by partitioner and outcome",
    ["partitioner", "outcome"]
);
define_counter_vec!(
    MERGE_OPERATIONS,
    "merge_operations_total",
    "Region merge steps by partitioner and outcome",
    ["partitioner", "outcome"]
);
define_counter_vec!(
    RESOURCE_ALLOCATIONS,
    "resource_allocations_total",
    "Replica allocations by placement strategy and outcome",
    ["strategy", "outcome"]
);

// =============================================================================
// Syncer
// =============================================================================

define_counter_vec!(
    SYNC_EVENTS,
    "sync_watch_events_total",
    "Coordination store watch events processed by the syncer",
    ["kind"]
);
define_counter_vec!(
    TREE_REBUILDS,
    "tree_rebuilds_total",
    "Full rebuilds of a region tree",
    ["reason"]
);
define_counter_vec!(
    REGION_EVENTS,
    "region_events_total",
    "Region callbacks emitted by kind",
    ["kind"]
);
define_gauge_vec!(
    TREE_REGIONS,
    "tree_regions",
    "Regions in the in-memory tree per group",
    ["group"]
);
define_histogram_vec!(
    SYNC_DURATION,
    "sync_duration_seconds",
    "Duration of a tree synchronization pass",
    ["scope"],
    [0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
);

// =============================================================================
// Id mapper and waits
// =============================================================================

define_gauge_vec!(
    MAPPED_REGIONS,
    "mapped_regions",
    "Locally mapped regions per group",
    ["group"]
);
define_counter_vec!(
    WAIT_TIMEOUTS,
    "wait_timeouts_total",
    "Blocking waits that hit their timeout",
    ["wait"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retries of coordination store calls",
    ["policy", "outcome"]
);

// =============================================================================
// Registration helpers
// =============================================================================

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("histogram opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Encode all metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_split(partitioner: &str, outcome: &str) {
    SPLIT_OPERATIONS
        .with_label_values(&[partitioner, outcome])
        .inc();
}

pub fn record_merge(partitioner: &str, outcome: &str) {
    MERGE_OPERATIONS
        .with_label_values(&[partitioner, outcome])
        .inc();
}

pub fn record_allocation(strategy: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    RESOURCE_ALLOCATIONS
        .with_label_values(&[strategy, outcome])
        .inc();
}

pub fn record_sync(scope: &str, duration_secs: f64) {
    SYNC_DURATION
        .with_label_values(&[scope])
        .observe(duration_secs);
}
