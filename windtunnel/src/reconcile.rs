//! Batch status reconciliation over a job log.
//!
//! Every record is checked independently: a purged task or a failing backend
//! call is counted and reported, never allowed to abort the batch.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::backend::{ComputeBackend, TaskId};
use crate::error::{Error, Result};
use crate::events::SharedPublisher;
use crate::joblog::{JobLog, JobLogRecord};
use crate::task::{TaskHandle, TaskStatus};
use crate::telemetry;

/// Bucket a record is counted under.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKey {
    Queued,
    Running,
    Success,
    Failed,
    /// The backend no longer knows the task id.
    Unknown,
    /// The status query itself failed.
    Error,
}

impl StatusKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKey::Queued => "queued",
            StatusKey::Running => "running",
            StatusKey::Success => "success",
            StatusKey::Failed => "failed",
            StatusKey::Unknown => "unknown",
            StatusKey::Error => "error",
        }
    }
}

impl From<TaskStatus> for StatusKey {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Queued => StatusKey::Queued,
            TaskStatus::Running => StatusKey::Running,
            TaskStatus::Success => StatusKey::Success,
            TaskStatus::Failed => StatusKey::Failed,
        }
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOptions {
    /// Download outputs of successful tasks.
    pub download: bool,
    /// Directory under each record's `input_dir` that receives outputs.
    pub output_subdir: PathBuf,
    /// Status queries in flight at once.
    pub concurrency: usize,
}

impl ReconcileOptions {
    pub const DEFAULT_OUTPUT_SUBDIR: &'static str = "downloaded_outputs";

    pub fn with_download(mut self, download: bool) -> Self {
        self.download = download;
        self
    }

    pub fn with_output_subdir(mut self, subdir: impl Into<PathBuf>) -> Self {
        self.output_subdir = subdir.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            download: true,
            output_subdir: PathBuf::from(Self::DEFAULT_OUTPUT_SUBDIR),
            concurrency: 1,
        }
    }
}

/// What happened to one job log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordOutcome {
    pub task_id: TaskId,
    pub status: StatusKey,
    pub downloaded: Option<PathBuf>,
    /// Status query failure, or a download failure for a successful task.
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ReconcileReport {
    outcomes: Vec<RecordOutcome>,
    counts: BTreeMap<StatusKey, usize>,
}

impl ReconcileReport {
    fn from_outcomes(outcomes: Vec<RecordOutcome>) -> Self {
        let mut counts = BTreeMap::new();
        for outcome in &outcomes {
            *counts.entry(outcome.status).or_insert(0) += 1;
        }
        Self { outcomes, counts }
    }

    /// Per-record results in job log order.
    pub fn outcomes(&self) -> &[RecordOutcome] {
        &self.outcomes
    }

    pub fn counts(&self) -> &BTreeMap<StatusKey, usize> {
        &self.counts
    }

    pub fn count(&self, key: StatusKey) -> usize {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn downloads(&self) -> impl Iterator<Item = (&TaskId, &Path)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.downloaded.as_deref().map(|path| (&o.task_id, path)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&TaskId, &str)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.error.as_deref().map(|err| (&o.task_id, err)))
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tasks", self.total())?;
        for (key, count) in &self.counts {
            write!(f, ", {key}: {count}")?;
        }
        Ok(())
    }
}

pub struct Reconciler {
    backend: Arc<dyn ComputeBackend>,
    options: ReconcileOptions,
    events: SharedPublisher,
}

impl Reconciler {
    pub fn new(backend: Arc<dyn ComputeBackend>, options: ReconcileOptions) -> Self {
        Self {
            backend,
            options,
            events: None,
        }
    }

    pub fn with_events(mut self, events: SharedPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    pub async fn reconcile(&self, records: &[JobLogRecord]) -> ReconcileReport {
        let span = telemetry::reconcile_span(records.len());
        async {
            let outcomes: Vec<RecordOutcome> = stream::iter(records)
                .map(|record| self.reconcile_one(record))
                .buffered(self.options.concurrency.max(1))
                .collect()
                .await;

            let report = ReconcileReport::from_outcomes(outcomes);
            tracing::info!(
                total = report.total(),
                success = report.count(StatusKey::Success),
                failed = report.count(StatusKey::Failed),
                unknown = report.count(StatusKey::Unknown),
                "reconciliation finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    /// Read the job log at `path`, then reconcile it.
    pub async fn reconcile_log(&self, path: &Path) -> Result<ReconcileReport> {
        let records = JobLog::new(path).read()?;
        Ok(self.reconcile(&records).await)
    }

    async fn reconcile_one(&self, record: &JobLogRecord) -> RecordOutcome {
        let handle = TaskHandle::attach(record.task_id.clone(), Arc::clone(&self.backend))
            .with_input_dir(&record.input_dir)
            .with_events(self.events.clone());

        let mut outcome = RecordOutcome {
            task_id: record.task_id.clone(),
            status: StatusKey::Error,
            downloaded: None,
            error: None,
        };

        match handle.get_status().await {
            Ok(status) => outcome.status = status.into(),
            Err(Error::UnknownJob(_)) => {
                tracing::warn!(task_id = %record.task_id, "task unknown to backend");
                outcome.status = StatusKey::Unknown;
            }
            Err(err) => {
                tracing::warn!(task_id = %record.task_id, error = %err, "status query failed");
                outcome.error = Some(err.to_string());
            }
        }

        if self.options.download && outcome.status == StatusKey::Success {
            let dest = record.input_dir.join(&self.options.output_subdir);
            match handle.download_outputs(&dest).await {
                Ok(path) => outcome.downloaded = Some(path),
                Err(err) => {
                    tracing::warn!(task_id = %record.task_id, error = %err, "download failed");
                    outcome.error = Some(err.to_string());
                }
            }
        }

        telemetry::record_reconciled(record.task_id.as_str(), outcome.status.as_str());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, status: StatusKey) -> RecordOutcome {
        RecordOutcome {
            task_id: TaskId::new(id),
            status,
            downloaded: None,
            error: None,
        }
    }

    #[test]
    fn test_report_counts_each_record_once() {
        let report = ReconcileReport::from_outcomes(vec![
            outcome("a", StatusKey::Success),
            outcome("b", StatusKey::Success),
            outcome("c", StatusKey::Failed),
            outcome("d", StatusKey::Unknown),
        ]);
        assert_eq!(report.total(), 4);
        assert_eq!(report.count(StatusKey::Success), 2);
        assert_eq!(report.count(StatusKey::Running), 0);
        assert_eq!(report.to_string(), "4 tasks, success: 2, failed: 1, unknown: 1");
    }

    #[test]
    fn test_report_downloads_and_failures() {
        let mut ok = outcome("a", StatusKey::Success);
        ok.downloaded = Some(PathBuf::from("/runs/a/downloaded_outputs"));
        let mut broken = outcome("b", StatusKey::Success);
        broken.error = Some("disk full".into());

        let report = ReconcileReport::from_outcomes(vec![ok, broken]);
        let downloads: Vec<_> = report.downloads().collect();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].0.as_str(), "a");
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures, vec![(&TaskId::new("b"), "disk full")]);
        assert_eq!(report.count(StatusKey::Success), 2);
    }

    #[test]
    fn test_default_options() {
        let options = ReconcileOptions::default();
        assert!(options.download);
        assert_eq!(options.output_subdir, PathBuf::from("downloaded_outputs"));
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.with_concurrency(8).concurrency, 8);
    }

    #[test]
    fn test_status_key_from_task_status() {
        assert_eq!(StatusKey::from(TaskStatus::Running), StatusKey::Running);
        assert_eq!(StatusKey::Unknown.to_string(), "unknown");
    }
}
