use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::backend::ComputeBackend;
use crate::config::WindTunnelConfig;
use crate::error::{Result, TemplateResolutionError};
use crate::events::SharedPublisher;
use crate::joblog::{JobLog, JobLogRecord};
use crate::model::{ParamMap, SimulationParameters, WindTunnel};
use crate::pipeline::CommandPipeline;
use crate::pool::MachinePool;
use crate::task::{submit_with_events, TaskHandle};
use crate::telemetry;
use crate::template::{AssemblyOptions, Case, CaseAssembler};

/// Steady-state simulation of one object inside a wind tunnel.
///
/// Each [`WindTunnelScenario::simulate`] call assembles a fresh case under
/// the configured working directory and submits it.
#[derive(Clone)]
pub struct WindTunnelScenario {
    wind_tunnel: WindTunnel,
    assembler: CaseAssembler,
    config: WindTunnelConfig,
    backend: Arc<dyn ComputeBackend>,
    pipeline: CommandPipeline,
    events: SharedPublisher,
}

impl std::fmt::Debug for WindTunnelScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindTunnelScenario")
            .field("wind_tunnel", &self.wind_tunnel)
            .field("template_root", &self.assembler.template_root())
            .field("working_dir", &self.config.working_dir)
            .finish_non_exhaustive()
    }
}

impl WindTunnelScenario {
    pub fn new(
        wind_tunnel: WindTunnel,
        template_root: impl Into<PathBuf>,
        config: WindTunnelConfig,
        backend: Arc<dyn ComputeBackend>,
    ) -> Self {
        Self {
            wind_tunnel,
            assembler: CaseAssembler::new(template_root),
            config,
            backend,
            pipeline: CommandPipeline::steady_state(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: SharedPublisher) -> Self {
        self.events = events;
        self
    }

    /// Same template, configuration and backend around a different tunnel.
    pub fn with_wind_tunnel(&self, wind_tunnel: WindTunnel) -> Self {
        Self {
            wind_tunnel,
            ..self.clone()
        }
    }

    pub fn wind_tunnel(&self) -> &WindTunnel {
        &self.wind_tunnel
    }

    pub fn config(&self) -> &WindTunnelConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &CommandPipeline {
        &self.pipeline
    }

    /// Template parameters for one run. Simulation parameters take
    /// precedence over wind tunnel fields of the same name.
    pub fn case_params(&self, parameters: &SimulationParameters) -> ParamMap {
        self.wind_tunnel
            .to_params()
            .merged_with(&parameters.to_params())
    }

    /// Assemble a case into a new directory without submitting it.
    pub async fn prepare(
        &self,
        object_path: &Path,
        parameters: &SimulationParameters,
    ) -> Result<Case> {
        let params = self.case_params(parameters);
        let destination = self
            .config
            .working_dir
            .join(format!("{}-{}", self.config.scenario_dir, Uuid::now_v7()));
        let span = telemetry::assemble_span(self.assembler.template_root(), &destination);

        let assembler = self.assembler.clone();
        let object = object_path.to_path_buf();
        let target = destination.clone();
        let assembled = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            assembler.assemble(&object, &params, &target, AssemblyOptions::default())
        })
        .await;

        match assembled {
            Ok(case) => Ok(case?),
            Err(join) => Err(TemplateResolutionError::Io {
                path: destination,
                source: std::io::Error::other(join),
            }
            .into()),
        }
    }

    /// Assemble and submit one case.
    pub async fn simulate(
        &self,
        object_path: &Path,
        parameters: &SimulationParameters,
        pool: Option<&MachinePool>,
    ) -> Result<TaskHandle> {
        let case = self.prepare(object_path, parameters).await?;
        let submitted = submit_with_events(
            Arc::clone(&self.backend),
            case.root(),
            &self.pipeline,
            pool,
            self.events.clone(),
        )
        .await;
        let handle = match submitted {
            Ok(handle) => handle,
            Err(err) => {
                discard_case(case.root()).await;
                return Err(err);
            }
        };

        if let Some(path) = &self.config.job_log {
            let record = JobLogRecord::new(handle.id().clone(), case.root())
                .submitted_now()
                .with_extra("object", json!(object_path.display().to_string()))
                .with_extra("flow_velocity", json!(self.wind_tunnel.flow_velocity()));
            // Already submitted: report the failure but keep the handle.
            if let Err(err) = JobLog::new(path).append(&record) {
                tracing::error!(
                    task_id = %handle.id(),
                    input_dir = %case.root().display(),
                    error = %err,
                    "failed to record submission in job log"
                );
            }
        }

        Ok(handle)
    }
}

/// Remove a case that was assembled but never accepted by the backend.
async fn discard_case(root: &Path) {
    match tokio::fs::remove_dir_all(root).await {
        Ok(()) => tracing::debug!(case_root = %root.display(), "discarded unsubmitted case"),
        Err(err) => tracing::warn!(
            case_root = %root.display(),
            error = %err,
            "failed to remove unsubmitted case"
        ),
    }
}
