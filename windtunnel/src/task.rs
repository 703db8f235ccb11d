//! Submitted jobs and their observable lifecycle.
//!
//! A [`TaskHandle`] is a local view of one remote task. The backend owns
//! execution; the handle only polls it. The status cached on a handle is
//! monotone: once a poll has observed `running`, a later `queued` answer is
//! ignored, and a terminal status is never replaced.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::Instrument;

use crate::backend::{ComputeBackend, SubmitRequest, TaskId};
use crate::error::{Error, IllegalStateError, Result};
use crate::events::{emit, SharedPublisher, TaskEventPayload};
use crate::pipeline::CommandPipeline;
use crate::pool::MachinePool;
use crate::telemetry;

/// Remote task status as reported by the backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    /// Position in the lifecycle. Both terminal states share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::Running => 1,
            TaskStatus::Success | TaskStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    /// Status after observing `observed`, never moving backwards.
    pub fn advance(self, observed: TaskStatus) -> TaskStatus {
        if self.is_terminal() || observed.rank() < self.rank() {
            self
        } else {
            observed
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token for cancelling in-progress waits.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`ShutdownToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Controls for [`TaskHandle::wait`].
#[derive(Clone, Debug)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    /// Give up after this long with [`Error::Timeout`].
    pub timeout: Option<Duration>,
    /// Give up when cancelled with [`Error::WaitCancelled`].
    pub shutdown: Option<ShutdownToken>,
}

impl WaitOptions {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_shutdown(mut self, token: ShutdownToken) -> Self {
        self.shutdown = Some(token);
        self
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            timeout: None,
            shutdown: None,
        }
    }
}

/// Handle to a submitted task. Clones share the cached status.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    input_dir: Option<PathBuf>,
    backend: Arc<dyn ComputeBackend>,
    events: SharedPublisher,
    status: Arc<Mutex<TaskStatus>>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("input_dir", &self.input_dir)
            .finish_non_exhaustive()
    }
}

impl TaskHandle {
    /// Rebuild a handle from a stored task id, e.g. one read from a job log.
    ///
    /// Nothing is known about the task until the first poll, so the cached
    /// status starts at `queued`.
    pub fn attach(task_id: TaskId, backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            id: task_id,
            input_dir: None,
            backend,
            events: None,
            status: Arc::new(Mutex::new(TaskStatus::Queued)),
        }
    }

    pub fn with_input_dir(mut self, input_dir: impl Into<PathBuf>) -> Self {
        self.input_dir = Some(input_dir.into());
        self
    }

    pub fn with_events(mut self, events: SharedPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn input_dir(&self) -> Option<&Path> {
        self.input_dir.as_deref()
    }

    /// Most recent status observed by any clone of this handle, without polling.
    pub async fn last_status(&self) -> TaskStatus {
        *self.status.lock().await
    }

    /// Poll the backend once.
    pub async fn get_status(&self) -> Result<TaskStatus> {
        let observed = self.backend.task_status(&self.id).await?;

        let mut cached = self.status.lock().await;
        let previous = *cached;
        let current = previous.advance(observed);
        if current != observed {
            tracing::warn!(
                task_id = %self.id,
                cached = %previous,
                observed = %observed,
                "ignoring backwards status report"
            );
        }
        if current == previous {
            return Ok(current);
        }
        *cached = current;
        drop(cached);

        telemetry::record_status_observed(self.id.as_str(), previous, current);
        emit(
            &self.events,
            TaskEventPayload::StatusChanged {
                task_id: self.id.clone(),
                from: previous,
                to: current,
            },
        )
        .await;
        Ok(current)
    }

    /// Poll until the task reaches a terminal status.
    ///
    /// Timing out or being cancelled only stops the local wait; the remote
    /// task keeps running and the handle stays usable.
    pub async fn wait(&self, options: WaitOptions) -> Result<TaskStatus> {
        let span = telemetry::wait_span(self.id.as_str());
        async {
            let started = Instant::now();
            let poll_interval = options.poll_interval;
            let polling = async {
                loop {
                    let status = self.get_status().await?;
                    if status.is_terminal() {
                        return Ok::<_, Error>(status);
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            };

            let outcome = tokio::select! {
                result = polling => result,
                _ = deadline(options.timeout) => {
                    let last_status = self.last_status().await;
                    tracing::warn!(task_id = %self.id, %last_status, "wait timed out");
                    Err(Error::Timeout { task_id: self.id.clone(), last_status })
                }
                _ = cancelled(options.shutdown.as_ref()) => {
                    let last_status = self.last_status().await;
                    tracing::info!(task_id = %self.id, %last_status, "wait cancelled");
                    Err(Error::WaitCancelled { task_id: self.id.clone(), last_status })
                }
            };

            if let Ok(status) = &outcome {
                telemetry::record_wait_finished(self.id.as_str(), *status, started.elapsed());
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Fetch the outputs of a successful task into `dest`.
    pub async fn download_outputs(&self, dest: &Path) -> Result<PathBuf> {
        let status = self.get_status().await?;
        if status != TaskStatus::Success {
            let state = format!("task is {status}");
            return Err(IllegalStateError::new("download outputs", state).into());
        }

        let path = self.backend.download_outputs(&self.id, dest).await?;
        tracing::info!(task_id = %self.id, path = %path.display(), "outputs downloaded");
        emit(
            &self.events,
            TaskEventPayload::OutputsDownloaded {
                task_id: self.id.clone(),
                path: path.clone(),
            },
        )
        .await;
        Ok(path)
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(token: Option<&ShutdownToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Hand an assembled case to the backend. Returns once the task is accepted.
///
/// With `pool` set the pool must already be started; `None` targets the
/// backend's default pool.
pub async fn submit(
    backend: Arc<dyn ComputeBackend>,
    case_root: &Path,
    pipeline: &CommandPipeline,
    pool: Option<&MachinePool>,
) -> Result<TaskHandle> {
    submit_with_events(backend, case_root, pipeline, pool, None).await
}

/// [`submit`], publishing lifecycle events for the new task to `events`.
pub async fn submit_with_events(
    backend: Arc<dyn ComputeBackend>,
    case_root: &Path,
    pipeline: &CommandPipeline,
    pool: Option<&MachinePool>,
    events: SharedPublisher,
) -> Result<TaskHandle> {
    let span = telemetry::submit_span(case_root);
    async move {
        let pool_id = match pool {
            Some(pool) => Some(pool.bind().await?),
            None => None,
        };

        let request = SubmitRequest {
            input_dir: case_root.to_path_buf(),
            commands: pipeline.commands(),
            pool: pool_id.clone(),
        };
        let task_id = backend.submit(request).await?;

        telemetry::record_task_submitted(task_id.as_str(), pool_id.as_ref().map(|p| p.as_str()));
        emit(
            &events,
            TaskEventPayload::Submitted {
                task_id: task_id.clone(),
                input_dir: case_root.to_path_buf(),
                pool_id,
            },
        )
        .await;

        Ok(TaskHandle::attach(task_id, backend)
            .with_input_dir(case_root)
            .with_events(events))
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_lowercase() {
        assert_eq!(serde_json::to_string(&TaskStatus::Running).unwrap(), "\"running\"");
        let parsed: TaskStatus = serde_json::from_str("\"success\"").unwrap();
        assert_eq!(parsed, TaskStatus::Success);
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_status_never_moves_backwards() {
        use TaskStatus::*;
        assert_eq!(Queued.advance(Running), Running);
        assert_eq!(Running.advance(Queued), Running);
        assert_eq!(Running.advance(Success), Success);
        assert_eq!(Success.advance(Running), Success);
        assert_eq!(Success.advance(Failed), Success);
        assert_eq!(Failed.advance(Success), Failed);
        assert_eq!(Queued.advance(Failed), Failed);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_token_resolves_immediately() {
        let token = ShutdownToken::default();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already-cancelled token should resolve");
    }

    #[test]
    fn test_wait_options_builders() {
        let token = ShutdownToken::new();
        let options = WaitOptions::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(1))
            .with_shutdown(token);
        assert_eq!(options.poll_interval, Duration::from_millis(10));
        assert_eq!(options.timeout, Some(Duration::from_secs(1)));
        assert!(options.shutdown.is_some());
        assert_eq!(WaitOptions::default().poll_interval, Duration::from_secs(5));
    }
}
