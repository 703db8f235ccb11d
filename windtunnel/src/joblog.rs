//! JSON-lines record of submitted tasks.
//!
//! Each line is one object with at least `task_id` and `input_dir`. Fields
//! this crate does not know about are carried through unchanged.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::TaskId;
use crate::error::JobLogError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobLogRecord {
    pub task_id: TaskId,
    pub input_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobLogRecord {
    pub fn new(task_id: TaskId, input_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_id,
            input_dir: input_dir.into(),
            submitted_at: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn submitted_now(mut self) -> Self {
        self.submitted_at = Some(Utc::now());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Append-only job log at a fixed path.
#[derive(Clone, Debug)]
pub struct JobLog {
    path: PathBuf,
}

impl JobLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, creating the file and its parent directories.
    pub fn append(&self, record: &JobLogRecord) -> Result<(), JobLogError> {
        let mut line = serde_json::to_string(record).map_err(JobLogError::Encode)?;
        line.push('\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| JobLogError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let io_err = |source| JobLogError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;

        tracing::debug!(
            path = %self.path.display(),
            task_id = %record.task_id,
            "job log record appended"
        );
        Ok(())
    }

    pub fn read(&self) -> Result<Vec<JobLogRecord>, JobLogError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| JobLogError::Io {
            path: self.path.clone(),
            source,
        })?;
        Self::parse(&self.path, &contents)
    }

    /// Parse JSON-lines text. Blank lines are skipped; `line` in errors is
    /// 1-based.
    pub fn parse(path: &Path, contents: &str) -> Result<Vec<JobLogRecord>, JobLogError> {
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|source| JobLogError::Malformed {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    source,
                })
            })
            .collect()
    }
}
