use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::backend::{PoolId, TaskId};
use crate::task::TaskStatus;

/// Metadata envelope attached to every lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(correlation_id: Option<Uuid>, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEvent {
    pub meta: EventMeta,
    pub payload: TaskEventPayload,
}

impl TaskEvent {
    /// Wraps `payload` with fresh metadata keyed on the payload's subject.
    pub fn new(payload: TaskEventPayload) -> Self {
        let key = payload.idempotency_key();
        Self {
            meta: EventMeta::new(None, key),
            payload,
        }
    }
}

/// Pool and task lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum TaskEventPayload {
    /// A machine pool finished provisioning.
    PoolStarted {
        pool_id: PoolId,
        machine_type: String,
    },
    /// A machine pool was released.
    PoolStopped { pool_id: PoolId },
    /// The backend accepted a case.
    Submitted {
        task_id: TaskId,
        input_dir: PathBuf,
        pool_id: Option<PoolId>,
    },
    /// A poll observed a newer status.
    StatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// Outputs were materialized locally.
    OutputsDownloaded { task_id: TaskId, path: PathBuf },
}

impl TaskEventPayload {
    fn idempotency_key(&self) -> String {
        match self {
            TaskEventPayload::PoolStarted { pool_id, .. } => format!("pool-start-{pool_id}"),
            TaskEventPayload::PoolStopped { pool_id } => format!("pool-stop-{pool_id}"),
            TaskEventPayload::Submitted { task_id, .. } => format!("submit-{task_id}"),
            TaskEventPayload::StatusChanged { task_id, to, .. } => {
                format!("status-{task_id}-{to}")
            }
            TaskEventPayload::OutputsDownloaded { task_id, .. } => format!("download-{task_id}"),
        }
    }
}

/// Trait for publishing lifecycle events.
#[async_trait]
pub trait TaskEventPublisher: Send + Sync {
    /// Publish an event to all subscribers.
    async fn publish(&self, event: TaskEvent) -> anyhow::Result<()>;

    /// Subscribe to events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<TaskEvent>;
}

/// Shared, optional publisher handed to pools and task handles.
pub type SharedPublisher = Option<Arc<dyn TaskEventPublisher>>;

pub(crate) async fn emit(events: &SharedPublisher, payload: TaskEventPayload) {
    if let Some(events) = events {
        if let Err(err) = events.publish(TaskEvent::new(payload)).await {
            tracing::warn!("publish task event failed: {err}");
        }
    }
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged`; events published
/// with no subscribers are dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<TaskEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn shared(self) -> SharedPublisher {
        Some(Arc::new(self))
    }
}

#[async_trait]
impl TaskEventPublisher for InProcEventBus {
    async fn publish(&self, event: TaskEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}
