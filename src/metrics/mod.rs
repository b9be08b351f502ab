//! Prometheus metrics for the work queue.
//!
//! - Item metrics (pushed, delivered, discarded, forward failures) by queue
//! - Backend construction metrics (attempts, failures by reason)
//! - Manager metrics (registered queues by type)

mod helpers;

pub use helpers::{encode_metrics, ManagerMetrics, QueueMetrics, StarterMetrics};

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_queue";

lazy_static! {
    // ============================================================================
    // Item Metrics
    // ============================================================================

    /// Items accepted by a queue
    pub static ref ITEMS_PUSHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_items_pushed_total", METRIC_PREFIX),
        "Total items accepted by push",
        &["queue"]
    ).unwrap();

    /// Items handed to a handler
    pub static ref ITEMS_DELIVERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_items_delivered_total", METRIC_PREFIX),
        "Total items delivered to handlers",
        &["queue"]
    ).unwrap();

    /// Items dropped by termination
    pub static ref ITEMS_DISCARDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_items_discarded_total", METRIC_PREFIX),
        "Total buffered items discarded on terminate",
        &["queue"]
    ).unwrap();

    /// Buffered items the backend rejected
    pub static ref FORWARD_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_forward_failures_total", METRIC_PREFIX),
        "Total buffered items that could not be forwarded to the backend",
        &["queue"]
    ).unwrap();

    // ============================================================================
    // Construction Metrics
    // ============================================================================

    /// Backend construction attempts
    pub static ref CONSTRUCTION_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_construction_attempts_total", METRIC_PREFIX),
        "Total backend construction attempts",
        &["queue_type"]
    ).unwrap();

    /// Delayed starts that gave up
    pub static ref CONSTRUCTION_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_construction_failures_total", METRIC_PREFIX),
        "Total delayed starts that failed",
        &["queue_type", "reason"]
    ).unwrap();

    // ============================================================================
    // Manager Metrics
    // ============================================================================

    /// Queues registered with the manager
    pub static ref QUEUES_REGISTERED: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_queues_registered", METRIC_PREFIX),
        "Queues registered with the manager",
        &["queue_type"]
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        // lazy_static metrics only register on first access
        ITEMS_PUSHED_TOTAL.with_label_values(&["encode-test"]).inc();

        let output = encode_metrics().unwrap();
        assert!(output.contains("ara_queue_items_pushed_total"));
        assert!(output.contains("encode-test"));
    }
}
