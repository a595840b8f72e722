// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the upgrade coordinator.
//!
//! This module provides metrics collection with the namespace prefix
//! `storage_firestoned_io_upgrade_` (prometheus-safe version of "storage.firestoned.io").
//!
//! # Metrics Categories
//!
//! - **Run Metrics** - Track upgrade runs and their outcomes
//! - **Phase Metrics** - Track how long each phase takes
//! - **Managed Object Metrics** - Track objects created, deleted and failed cleanups
//! - **Leader Election Metrics** - Track leadership state changes
//!
//! # Example
//!
//! ```rust,no_run
//! use storage_upgrade::metrics::{record_upgrade_run, gather_metrics};
//!
//! record_upgrade_run("success");
//! let text = gather_metrics().unwrap();
//! ```

use prometheus::{CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::LazyLock;
use std::time::Duration;

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Namespace prefix for all upgrade metrics (prometheus-safe)
const METRICS_NAMESPACE: &str = "storage_firestoned_io_upgrade";

// ============================================================================
// Global Metrics Registry
// ============================================================================

/// Global Prometheus metrics registry
pub static METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Run Metrics
// ============================================================================

/// Total number of upgrade runs by outcome
///
/// Labels:
/// - `outcome`: `success` or `failure`
pub static UPGRADE_RUNS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_runs_total"),
        "Total number of upgrade runs by outcome",
    );
    let counter = CounterVec::new(opts, &["outcome"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Duration of each upgrade phase in seconds
///
/// Labels:
/// - `phase`: Phase name (e.g., `api_version`, `pods`)
pub static PHASE_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        format!("{METRICS_NAMESPACE}_phase_duration_seconds"),
        "Duration of upgrade phases in seconds",
    )
    .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]);
    let histogram = HistogramVec::new(opts, &["phase"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(histogram.clone()))
        .unwrap();
    histogram
});

// ============================================================================
// Managed Object Metrics
// ============================================================================

/// Total number of managed objects created
///
/// Labels:
/// - `kind`: Kind of object created
pub static OBJECTS_CREATED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_objects_created_total"),
        "Total number of managed objects created by kind",
    );
    let counter = CounterVec::new(opts, &["kind"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Total number of managed objects deleted
///
/// Labels:
/// - `kind`: Kind of object deleted
pub static OBJECTS_DELETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_objects_deleted_total"),
        "Total number of managed objects deleted by kind",
    );
    let counter = CounterVec::new(opts, &["kind"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Total number of cleanups that failed and were skipped
///
/// Labels:
/// - `kind`: Kind of object that could not be removed
pub static CLEANUP_FAILURES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_cleanup_failures_total"),
        "Total number of best-effort cleanups that failed by kind",
    );
    let counter = CounterVec::new(opts, &["kind"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

// ============================================================================
// Leader Election Metrics
// ============================================================================

/// Total number of leader election transitions
///
/// Labels:
/// - `event`: `acquired`, `lost` or `released`
pub static LEADER_ELECTIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_leader_elections_total"),
        "Total number of upgrade lease transitions by event",
    );
    let counter = CounterVec::new(opts, &["event"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(counter.clone()))
        .unwrap();
    counter
});

/// Current leader status (1 = leading, 0 = not leading)
///
/// Labels:
/// - `identity`: Candidate identity
pub static LEADER_STATUS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        format!("{METRICS_NAMESPACE}_leader_status"),
        "Whether this candidate currently holds the upgrade lease",
    );
    let gauge = GaugeVec::new(opts, &["identity"]).unwrap();
    METRICS_REGISTRY
        .register(Box::new(gauge.clone()))
        .unwrap();
    gauge
});

// ============================================================================
// Helper Functions
// ============================================================================

/// Record the terminal outcome of an upgrade run
///
/// # Arguments
/// * `outcome` - `success` or `failure`
pub fn record_upgrade_run(outcome: &str) {
    UPGRADE_RUNS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record how long a phase took
pub fn record_phase_duration(phase: &str, duration: Duration) {
    PHASE_DURATION_SECONDS
        .with_label_values(&[phase])
        .observe(duration.as_secs_f64());
}

/// Record a managed object creation
pub fn record_object_created(kind: &str) {
    OBJECTS_CREATED_TOTAL.with_label_values(&[kind]).inc();
}

/// Record a managed object deletion
pub fn record_object_deleted(kind: &str) {
    OBJECTS_DELETED_TOTAL.with_label_values(&[kind]).inc();
}

/// Record a failed best-effort cleanup
pub fn record_cleanup_failure(kind: &str) {
    CLEANUP_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

/// Record leader election acquired
///
/// # Arguments
/// * `identity` - Identity of the candidate that acquired leadership
pub fn record_leader_elected(identity: &str) {
    LEADER_ELECTIONS_TOTAL
        .with_label_values(&["acquired"])
        .inc();
    LEADER_STATUS.with_label_values(&[identity]).set(1.0);
}

/// Record leader election lost
pub fn record_leader_lost(identity: &str) {
    LEADER_ELECTIONS_TOTAL.with_label_values(&["lost"]).inc();
    LEADER_STATUS.with_label_values(&[identity]).set(0.0);
}

/// Record the lease being released on purpose
pub fn record_leader_released(identity: &str) {
    LEADER_ELECTIONS_TOTAL
        .with_label_values(&["released"])
        .inc();
    LEADER_STATUS.with_label_values(&[identity]).set(0.0);
}

/// Gather and encode all metrics in Prometheus text format
///
/// # Errors
/// Returns error if encoding fails
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("UTF-8 error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_upgrade_run() {
        record_upgrade_run("success");

        let counter = UPGRADE_RUNS_TOTAL.with_label_values(&["success"]);
        assert!(counter.get() > 0.0);
    }

    #[test]
    fn test_record_phase_duration() {
        record_phase_duration("phase_test", Duration::from_millis(250));

        let histogram = PHASE_DURATION_SECONDS.with_label_values(&["phase_test"]);
        assert!(histogram.get_sample_count() > 0);
    }

    #[test]
    fn test_leader_status_follows_transitions() {
        let identity = "metrics-test-node";

        record_leader_elected(identity);
        assert!((LEADER_STATUS.with_label_values(&[identity]).get() - 1.0).abs() < f64::EPSILON);

        record_leader_released(identity);
        assert!(LEADER_STATUS.with_label_values(&[identity]).get().abs() < f64::EPSILON);
    }

    #[test]
    fn test_gather_metrics() {
        record_object_created("GatherTest");

        let metrics_text = gather_metrics().expect("Gathering metrics should succeed");
        assert!(
            metrics_text.contains("storage_firestoned_io_upgrade"),
            "Metrics should contain namespace prefix"
        );
        assert!(
            metrics_text.contains("objects_created_total"),
            "Metrics should contain object creation counter"
        );
    }
}
