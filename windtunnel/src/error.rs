use std::path::PathBuf;

use thiserror::Error;

use crate::backend::{BackendError, TaskId};
use crate::task::TaskStatus;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for every fallible windtunnel operation.
///
/// Each variant names the failing concern so callers can attribute a failure
/// to the job, pool, or record that produced it.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Template(#[from] TemplateResolutionError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    IllegalState(#[from] IllegalStateError),

    #[error(transparent)]
    UnknownJob(#[from] UnknownJobError),

    /// The wait deadline passed before the task reached a terminal status.
    #[error("timed out waiting for task {task_id}; last observed status: {last_status}")]
    Timeout {
        task_id: TaskId,
        last_status: TaskStatus,
    },

    /// The wait was cancelled through its shutdown token. The remote task
    /// keeps running.
    #[error("wait for task {task_id} cancelled; last observed status: {last_status}")]
    WaitCancelled {
        task_id: TaskId,
        last_status: TaskStatus,
    },

    #[error(transparent)]
    Backend(BackendError),

    #[error(transparent)]
    JobLog(#[from] JobLogError),
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::UnknownTask(task_id) => {
                Error::UnknownJob(UnknownJobError { task_id })
            }
            BackendError::Provisioning(message) => {
                Error::Provisioning(ProvisioningError::Backend(message))
            }
            other => Error::Backend(other),
        }
    }
}

/// Bad physical or numerical parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("flow speed {speed:.3} m/s must be below {limit} m/s for incompressible flow")]
    FlowTooFast { speed: f64, limit: f64 },

    #[error("{field} must be finite, got {value}")]
    NonFinite { field: &'static str, value: f64 },

    #[error("domain axis {axis}: min ({min}) must be below max ({max})")]
    InvertedAxis { axis: char, min: f64, max: f64 },

    #[error("domain mapping must contain exactly the axes x, y, z; {detail}")]
    DomainAxes { detail: String },

    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: i64 },

    #[error("parameter {name}: {detail}")]
    Parameter { name: String, detail: String },

    #[error("velocity range for axis {axis}: low ({low}) must not exceed high ({high})")]
    InvertedRange { axis: char, low: f64, high: f64 },

    #[error("velocity range for axis {axis}: width of [{low}, {high}] is not finite")]
    RangeTooWide { axis: char, low: f64, high: f64 },
}

/// Case assembly failures.
#[derive(Debug, Error)]
pub enum TemplateResolutionError {
    #[error("template root {0} is not a directory")]
    MissingTemplateRoot(PathBuf),

    #[error("placeholder `{name}` in {file} has no value")]
    Unresolved { name: String, file: PathBuf },

    #[error("malformed placeholder in {file}: {detail}")]
    Malformed { file: PathBuf, detail: String },

    #[error("object mesh {path} is unreadable: {source}")]
    UnreadableObject {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("destination {0} already exists and overwrite is disabled")]
    DestinationExists(PathBuf),

    #[error("destination {destination} lies inside template root {template_root}")]
    DestinationInsideTemplate {
        destination: PathBuf,
        template_root: PathBuf,
    },

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Machine pool creation and start failures. Never retried here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProvisioningError {
    #[error("invalid pool sizing: {0}")]
    InvalidSizing(String),

    #[error("invalid pool spec: {0}")]
    InvalidSpec(String),

    #[error("backend failed to provision pool: {0}")]
    Backend(String),
}

/// An operation was invoked in the wrong lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {operation} while {state}")]
pub struct IllegalStateError {
    pub operation: &'static str,
    pub state: String,
}

impl IllegalStateError {
    pub fn new(operation: &'static str, state: impl ToString) -> Self {
        Self {
            operation,
            state: state.to_string(),
        }
    }
}

/// The backend no longer recognizes a task id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("backend does not recognize task {task_id}")]
pub struct UnknownJobError {
    pub task_id: TaskId,
}

/// Job log read/write failures.
#[derive(Debug, Error)]
pub enum JobLogError {
    #[error("job log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("job log {path}, line {line}: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode job log record: {0}")]
    Encode(#[source] serde_json::Error),
}
