//! Windtunnel - CFD wind tunnel job construction and execution.
//!
//! Turns a 3D object mesh plus physical and numerical parameters into a
//! solver-ready OpenFOAM case, submits it to a remote compute backend, and
//! tracks the resulting tasks until their outputs are available locally.
//!
//! # Core Concepts
//!
//! - **Model**: [`WindTunnel`] and [`SimulationParameters`] are validated
//!   records that flatten into a [`ParamMap`] for template substitution.
//!
//! - **Template**: [`CaseAssembler`] copies a case skeleton, fills in every
//!   `{{ placeholder }}` and places the object mesh.
//!
//! - **Pipeline**: [`CommandPipeline::steady_state`] is the fixed sequence of
//!   eight solver stages every case runs.
//!
//! - **Backend**: the [`ComputeBackend`] trait abstracts the remote service
//!   that provisions machines, runs tasks, and serves their outputs.
//!
//! - **Pools and tasks**: [`MachinePool`] manages billable machines;
//!   [`submit`] hands a case to the backend and returns a [`TaskHandle`] for
//!   polling, waiting and downloading.
//!
//! - **Reconciliation**: [`Reconciler`] replays a [`JobLog`] against the
//!   backend, counting statuses and pulling outputs of successful tasks.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use windtunnel::*;
//!
//! let scenario = WindTunnelScenario::new(
//!     WindTunnel::new([50.0, 0.0, 0.0], None)?,
//!     "templates/wind_tunnel",
//!     WindTunnelConfig::new("runs"),
//!     backend,
//! );
//! let task = scenario
//!     .simulate("vehicle.obj".as_ref(), &SimulationParameters::new(50, 2)?, None)
//!     .await?;
//! task.wait(WaitOptions::default()).await?;
//! task.download_outputs("runs/outputs".as_ref()).await?;
//! ```

/// Compute backend abstraction.
///
/// The `backend` module defines the [`ComputeBackend`] trait along with the
/// [`TaskId`], [`PoolId`] and [`SubmitRequest`] types exchanged with it.
pub mod backend;

/// Configuration loaded from TOML.
///
/// [`WindTunnelConfig`] holds the working directory, job log location, and
/// pool, wait and reconcile settings.
pub mod config;

/// Error types for every fallible operation.
pub mod error;

/// Lifecycle event publishing.
///
/// The `events` module provides [`TaskEventPublisher`], [`TaskEvent`] and the
/// broadcast-based [`InProcEventBus`].
pub mod events;

/// JSON-lines log of submitted tasks.
pub mod joblog;

#[cfg(feature = "metrics")]
/// Prometheus metrics, available with the `metrics` feature.
pub mod metrics;

/// Wind tunnel and simulation parameter records.
pub mod model;

/// The fixed solver stage sequence and its progress state machine.
pub mod pipeline;

/// Machine pool specification and lifecycle.
pub mod pool;

/// Status reconciliation over a job log.
pub mod reconcile;

/// Case assembly and submission for one wind tunnel.
pub mod scenario;

/// Batch submission across a dataset of objects.
pub mod sweep;

/// Task submission, polling and waiting.
///
/// Includes [`TaskHandle`], [`TaskStatus`], [`WaitOptions`] and the
/// [`ShutdownToken`] used to cancel waits.
pub mod task;

/// Tracing spans and lifecycle recording.
pub mod telemetry;

/// Template rendering and case assembly.
pub mod template;

pub use backend::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use joblog::*;
pub use model::*;
pub use pipeline::*;
pub use pool::*;
pub use reconcile::*;
pub use scenario::*;
pub use sweep::*;
pub use task::*;
pub use template::*;
