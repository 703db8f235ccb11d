//! Tracing spans and lifecycle recording for windtunnel.
//!
//! Span constructors attach structured fields to case assembly, submission,
//! waiting, reconciliation and pool operations. The `record_*` helpers log a
//! lifecycle transition and, with the `metrics` feature, update the matching
//! Prometheus series. Without the feature they only log.
//!
//! # Example
//!
//! ```ignore
//! use windtunnel::telemetry::{reconcile_span, record_reconciled};
//!
//! let span = reconcile_span(records.len());
//! let _enter = span.enter();
//! record_reconciled("task-1", "success");
//! ```

use std::path::Path;
use std::time::Duration;

use tracing::{info_span, Span};

use crate::task::TaskStatus;

/// Span around assembling one case from a template.
#[must_use]
pub fn assemble_span(template: &Path, destination: &Path) -> Span {
    info_span!(
        "windtunnel.assemble",
        template = %template.display(),
        case_root = %destination.display(),
    )
}

/// Span around submitting an assembled case.
#[must_use]
pub fn submit_span(input_dir: &Path) -> Span {
    info_span!("windtunnel.submit", input_dir = %input_dir.display())
}

/// Span around waiting for a task to finish.
#[must_use]
pub fn wait_span(task_id: impl AsRef<str>) -> Span {
    info_span!("windtunnel.wait", task_id = %task_id.as_ref())
}

#[must_use]
pub fn reconcile_span(records: usize) -> Span {
    info_span!("windtunnel.reconcile", records = records)
}

/// Span around a machine pool operation such as `start`.
#[must_use]
pub fn pool_span(machine_type: impl AsRef<str>, operation: &'static str) -> Span {
    info_span!(
        "windtunnel.pool",
        machine_type = %machine_type.as_ref(),
        operation = operation,
    )
}

pub fn record_pool_started(pool_id: impl AsRef<str>, machine_type: impl AsRef<str>) {
    tracing::info!(
        pool_id = %pool_id.as_ref(),
        machine_type = %machine_type.as_ref(),
        "machine pool started"
    );
}

/// Record a task accepted by the backend. `pool` is `None` for the
/// backend's default pool.
pub fn record_task_submitted(task_id: impl AsRef<str>, pool: Option<&str>) {
    tracing::info!(
        task_id = %task_id.as_ref(),
        pool = pool.unwrap_or("default"),
        "task submitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_submitted(pool.unwrap_or("default"));
}

/// Record a forward status transition observed by polling.
pub fn record_status_observed(task_id: impl AsRef<str>, from: TaskStatus, to: TaskStatus) {
    if to.is_terminal() {
        tracing::info!(task_id = %task_id.as_ref(), %from, %to, "task finished");
    } else {
        tracing::debug!(task_id = %task_id.as_ref(), %from, %to, "task status changed");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_status(to.as_str());
}

/// Record one job log record's reconciled bucket.
pub fn record_reconciled(task_id: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::debug!(
        task_id = %task_id.as_ref(),
        status = %status.as_ref(),
        "task reconciled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_reconciled(status.as_ref());
}

/// Record a wait that ended in a terminal status.
pub fn record_wait_finished(task_id: impl AsRef<str>, status: TaskStatus, elapsed: Duration) {
    let duration_secs = elapsed.as_secs_f64();
    tracing::info!(
        task_id = %task_id.as_ref(),
        status = %status,
        duration_secs = duration_secs,
        "wait finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_wait_duration(status.as_str(), duration_secs);
}
