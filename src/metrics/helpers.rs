//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    CONSTRUCTION_ATTEMPTS_TOTAL, CONSTRUCTION_FAILURES_TOTAL, FORWARD_FAILURES_TOTAL,
    ITEMS_DELIVERED_TOTAL, ITEMS_DISCARDED_TOTAL, ITEMS_PUSHED_TOTAL, QUEUES_REGISTERED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording item metrics
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record an item accepted by push
    pub fn record_pushed(queue: &str) {
        ITEMS_PUSHED_TOTAL.with_label_values(&[queue]).inc();
    }

    /// Record an item handed to the handler
    pub fn record_delivered(queue: &str) {
        ITEMS_DELIVERED_TOTAL.with_label_values(&[queue]).inc();
    }

    /// Record items dropped by termination
    pub fn record_discarded(queue: &str, count: u64) {
        ITEMS_DISCARDED_TOTAL.with_label_values(&[queue]).inc_by(count);
    }

    /// Record a buffered item the backend rejected
    pub fn record_forward_failure(queue: &str) {
        FORWARD_FAILURES_TOTAL.with_label_values(&[queue]).inc();
    }
}

/// Helper struct for delayed start metrics
pub struct StarterMetrics;

impl StarterMetrics {
    pub fn record_attempt(queue_type: &str) {
        CONSTRUCTION_ATTEMPTS_TOTAL
            .with_label_values(&[queue_type])
            .inc();
    }

    /// Record a delayed start that gave up, labelled by error kind
    pub fn record_failure(queue_type: &str, reason: &str) {
        CONSTRUCTION_FAILURES_TOTAL
            .with_label_values(&[queue_type, reason])
            .inc();
    }
}

/// Helper struct for manager metrics
pub struct ManagerMetrics;

impl ManagerMetrics {
    pub fn record_registered(queue_type: &str) {
        QUEUES_REGISTERED.with_label_values(&[queue_type]).inc();
    }
}
