use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::MachinePoolSpec;
use crate::task::TaskStatus;

/// Backend-assigned task identifier. Stable for the task's lifetime.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Backend-assigned identifier of a provisioned machine pool.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the backend needs to run one case.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub input_dir: PathBuf,
    pub commands: Vec<String>,
    /// `None` targets the backend's default pool.
    pub pool: Option<PoolId>,
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),
    #[error("unknown pool: {0}")]
    UnknownPool(PoolId),
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io(err.to_string())
    }
}

/// Remote compute service that runs cases.
///
/// The service owns scheduling and execution; this crate only provisions
/// pools, submits work, polls, and pulls artifacts.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Provision the machines described by `spec`.
    async fn provision_pool(&self, spec: &MachinePoolSpec) -> BackendResult<PoolId>;

    /// Tear down a pool. In-flight tasks on it are the backend's concern.
    async fn release_pool(&self, pool: &PoolId) -> BackendResult<()>;

    /// Queue a case for execution. Returns as soon as the task is accepted.
    async fn submit(&self, request: SubmitRequest) -> BackendResult<TaskId>;

    /// Current status of a task.
    async fn task_status(&self, task: &TaskId) -> BackendResult<TaskStatus>;

    /// Materialize the task's outputs under `dest` and return the
    /// directory that holds them.
    async fn download_outputs(&self, task: &TaskId, dest: &Path) -> BackendResult<PathBuf>;
}
