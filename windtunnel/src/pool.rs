use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::Instrument;

use crate::backend::{ComputeBackend, PoolId};
use crate::error::{IllegalStateError, ProvisioningError, Result};
use crate::events::{emit, SharedPublisher, TaskEventPayload};
use crate::telemetry;

/// How many machines a pool holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolSizing {
    Fixed { count: u32 },
    /// The backend scales between `min` and `max` machines.
    Elastic { min: u32, max: u32 },
}

impl PoolSizing {
    pub fn validate(&self) -> std::result::Result<(), ProvisioningError> {
        match *self {
            PoolSizing::Fixed { count } if count < 1 => Err(ProvisioningError::InvalidSizing(
                "fixed pools need at least one machine".into(),
            )),
            PoolSizing::Elastic { min, .. } if min < 1 => Err(ProvisioningError::InvalidSizing(
                "elastic pools need a minimum of at least one machine".into(),
            )),
            PoolSizing::Elastic { min, max } if min > max => {
                Err(ProvisioningError::InvalidSizing(format!(
                    "elastic minimum ({min}) exceeds maximum ({max})"
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn max_machines(&self) -> u32 {
        match *self {
            PoolSizing::Fixed { count } => count,
            PoolSizing::Elastic { max, .. } => max,
        }
    }

    pub fn is_elastic(&self) -> bool {
        matches!(self, PoolSizing::Elastic { .. })
    }
}

impl fmt::Display for PoolSizing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolSizing::Fixed { count } => write!(f, "fixed({count})"),
            PoolSizing::Elastic { min, max } => write!(f, "elastic({min}..={max})"),
        }
    }
}

/// Validated description of a billable group of workers.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MachinePoolSpecRepr")]
pub struct MachinePoolSpec {
    machine_type: String,
    sizing: PoolSizing,
    disk_size_gb: u32,
}

impl MachinePoolSpec {
    pub const DEFAULT_MACHINE_TYPE: &'static str = "c2-standard-16";
    pub const DEFAULT_DISK_SIZE_GB: u32 = 70;

    pub fn new(
        machine_type: impl Into<String>,
        sizing: PoolSizing,
        disk_size_gb: u32,
    ) -> std::result::Result<Self, ProvisioningError> {
        let machine_type = machine_type.into();
        if machine_type.trim().is_empty() {
            return Err(ProvisioningError::InvalidSpec("machine type is empty".into()));
        }
        if disk_size_gb == 0 {
            return Err(ProvisioningError::InvalidSpec("disk size must be positive".into()));
        }
        sizing.validate()?;
        Ok(Self {
            machine_type,
            sizing,
            disk_size_gb,
        })
    }

    pub fn machine_type(&self) -> &str {
        &self.machine_type
    }

    pub fn sizing(&self) -> PoolSizing {
        self.sizing
    }

    pub fn disk_size_gb(&self) -> u32 {
        self.disk_size_gb
    }
}

#[derive(Deserialize)]
struct MachinePoolSpecRepr {
    machine_type: String,
    sizing: PoolSizing,
    disk_size_gb: u32,
}

impl TryFrom<MachinePoolSpecRepr> for MachinePoolSpec {
    type Error = ProvisioningError;

    fn try_from(repr: MachinePoolSpecRepr) -> std::result::Result<Self, Self::Error> {
        Self::new(repr.machine_type, repr.sizing, repr.disk_size_gb)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Created,
    Started,
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolState::Created => "created",
            PoolState::Started => "started",
            PoolState::Stopped => "stopped",
        })
    }
}

/// Shared handle to a machine pool.
///
/// Clones refer to the same pool. Stopping is never automatic: a pool that is
/// still started when its last handle drops keeps consuming resources on the
/// backend, and a warning is logged.
#[derive(Clone)]
pub struct MachinePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    spec: MachinePoolSpec,
    backend: Arc<dyn ComputeBackend>,
    events: SharedPublisher,
    status: RwLock<PoolStatus>,
}

#[derive(Debug)]
struct PoolStatus {
    state: PoolState,
    id: Option<PoolId>,
}

impl fmt::Debug for MachinePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MachinePool");
        debug.field("spec", &self.inner.spec);
        match self.inner.status.try_read() {
            Ok(status) => debug.field("status", &*status),
            Err(_) => debug.field("status", &"<locked>"),
        };
        debug.finish()
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let status = self.status.get_mut();
        if status.state == PoolState::Started {
            tracing::warn!(
                pool_id = ?status.id,
                machine_type = %self.spec.machine_type,
                "machine pool dropped while started; it keeps running until stopped on the backend"
            );
        }
    }
}

impl MachinePool {
    pub fn create(spec: MachinePoolSpec, backend: Arc<dyn ComputeBackend>) -> Self {
        Self::with_events(spec, backend, None)
    }

    pub fn with_events(
        spec: MachinePoolSpec,
        backend: Arc<dyn ComputeBackend>,
        events: SharedPublisher,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                spec,
                backend,
                events,
                status: RwLock::new(PoolStatus {
                    state: PoolState::Created,
                    id: None,
                }),
            }),
        }
    }

    pub fn spec(&self) -> &MachinePoolSpec {
        &self.inner.spec
    }

    pub async fn state(&self) -> PoolState {
        self.inner.status.read().await.state
    }

    pub async fn id(&self) -> Option<PoolId> {
        self.inner.status.read().await.id.clone()
    }

    /// Provision the pool. Starting a started pool is a no-op.
    pub async fn start(&self) -> Result<PoolId> {
        let span = telemetry::pool_span(self.inner.spec.machine_type(), "start");
        async {
            let mut status = self.inner.status.write().await;
            match (status.state, &status.id) {
                (PoolState::Started, Some(id)) => {
                    tracing::debug!(pool_id = %id, "pool already started");
                    return Ok(id.clone());
                }
                (PoolState::Stopped, _) => {
                    return Err(IllegalStateError::new("start pool", PoolState::Stopped).into());
                }
                _ => {}
            }

            let id = self
                .inner
                .backend
                .provision_pool(&self.inner.spec)
                .await?;

            status.state = PoolState::Started;
            status.id = Some(id.clone());
            drop(status);

            telemetry::record_pool_started(id.as_str(), self.inner.spec.machine_type());
            emit(
                &self.inner.events,
                TaskEventPayload::PoolStarted {
                    pool_id: id.clone(),
                    machine_type: self.inner.spec.machine_type().to_string(),
                },
            )
            .await;
            Ok(id)
        }
        .instrument(span)
        .await
    }

    /// Release the pool's machines. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut status = self.inner.status.write().await;
        let id = match (status.state, status.id.clone()) {
            (PoolState::Stopped, _) => return Ok(()),
            (PoolState::Started, Some(id)) => id,
            _ => {
                status.state = PoolState::Stopped;
                return Ok(());
            }
        };

        self.inner.backend.release_pool(&id).await?;
        status.state = PoolState::Stopped;
        drop(status);

        tracing::info!(pool_id = %id, "machine pool stopped");
        emit(&self.inner.events, TaskEventPayload::PoolStopped { pool_id: id }).await;
        Ok(())
    }

    /// Id to bind a task to. Only a started pool accepts tasks.
    pub(crate) async fn bind(&self) -> std::result::Result<PoolId, IllegalStateError> {
        let status = self.inner.status.read().await;
        match (status.state, &status.id) {
            (PoolState::Started, Some(id)) => Ok(id.clone()),
            (state, _) => Err(IllegalStateError::new("bind task to pool", state)),
        }
    }
}
