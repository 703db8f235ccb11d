//! Prometheus metrics for windtunnel.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `windtunnel_tasks_submitted_total` - Tasks accepted by the backend
//! - `windtunnel_task_status_total` - Status transitions observed by polling
//! - `windtunnel_reconciled_total` - Job log records reconciled, by bucket
//!
//! ## Histograms
//! - `windtunnel_wait_duration_seconds` - Time spent waiting for tasks to finish
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for windtunnel metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `pool`: backend pool id, or `default`
pub static TASKS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "windtunnel_tasks_submitted_total",
        "Total number of tasks accepted by the backend",
    );
    CounterVec::new(opts, &["pool"]).expect("windtunnel_tasks_submitted_total metric creation failed")
});

/// Labels:
/// - `status`: the status transitioned to
pub static TASK_STATUS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "windtunnel_task_status_total",
        "Total number of task status transitions observed",
    );
    CounterVec::new(opts, &["status"]).expect("windtunnel_task_status_total metric creation failed")
});

/// Labels:
/// - `status`: queued, running, success, failed, unknown or error
pub static RECONCILED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "windtunnel_reconciled_total",
        "Total number of job log records reconciled",
    );
    CounterVec::new(opts, &["status"]).expect("windtunnel_reconciled_total metric creation failed")
});

/// Solver runs take minutes to hours, so buckets start at one second.
///
/// Labels:
/// - `status`: terminal status the wait ended with
pub static WAIT_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(1.0, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "windtunnel_wait_duration_seconds",
        "Time spent waiting for tasks to reach a terminal status",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"])
        .expect("windtunnel_wait_duration_seconds metric creation failed")
});

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(TASKS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(TASK_STATUS_TOTAL.clone()),
        Box::new(RECONCILED_TOTAL.clone()),
        Box::new(WAIT_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_task_submitted(pool: &str) {
    TASKS_SUBMITTED_TOTAL.with_label_values(&[pool]).inc();
}

pub fn record_task_status(status: &str) {
    TASK_STATUS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_reconciled(status: &str) {
    RECONCILED_TOTAL.with_label_values(&[status]).inc();
}

pub fn observe_wait_duration(status: &str, duration_secs: f64) {
    WAIT_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
