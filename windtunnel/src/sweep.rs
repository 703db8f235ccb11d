//! Batch submission over a dataset of objects.
//!
//! Every object is simulated `simulations_per_object` times, each run with a
//! flow velocity drawn uniformly from a [`FlowVelocityRange`].

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TemplateResolutionError, ValidationError};
use crate::model::{DomainBox, SimulationParameters, WindTunnel};
use crate::pool::MachinePool;
use crate::scenario::WindTunnelScenario;
use crate::task::TaskHandle;

/// Per-axis `[low, high]` bounds for sampled flow velocities.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FlowVelocityRangeRepr")]
pub struct FlowVelocityRange {
    x: [f64; 2],
    y: [f64; 2],
    z: [f64; 2],
}

impl FlowVelocityRange {
    pub fn new(x: [f64; 2], y: [f64; 2], z: [f64; 2]) -> std::result::Result<Self, ValidationError> {
        for (axis, [low, high]) in [('x', x), ('y', y), ('z', z)] {
            if !low.is_finite() || !high.is_finite() {
                return Err(ValidationError::NonFinite {
                    field: "flow velocity range",
                    value: if low.is_finite() { high } else { low },
                });
            }
            if low > high {
                return Err(ValidationError::InvertedRange { axis, low, high });
            }
            if !(high - low).is_finite() {
                return Err(ValidationError::RangeTooWide { axis, low, high });
            }
        }
        Ok(Self { x, y, z })
    }

    /// A range that always yields `velocity`.
    pub fn fixed(velocity: [f64; 3]) -> std::result::Result<Self, ValidationError> {
        let [x, y, z] = velocity;
        Self::new([x, x], [y, y], [z, z])
    }

    pub fn x(&self) -> [f64; 2] {
        self.x
    }

    pub fn y(&self) -> [f64; 2] {
        self.y
    }

    pub fn z(&self) -> [f64; 2] {
        self.z
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> [f64; 3] {
        [
            uniform(rng, self.x),
            uniform(rng, self.y),
            uniform(rng, self.z),
        ]
    }
}

#[derive(Deserialize)]
struct FlowVelocityRangeRepr {
    x: [f64; 2],
    y: [f64; 2],
    z: [f64; 2],
}

impl TryFrom<FlowVelocityRangeRepr> for FlowVelocityRange {
    type Error = ValidationError;

    fn try_from(repr: FlowVelocityRangeRepr) -> std::result::Result<Self, Self::Error> {
        Self::new(repr.x, repr.y, repr.z)
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, [low, high]: [f64; 2]) -> f64 {
    if low == high {
        return low;
    }
    // Interpolate so that ranges near f64::MAX cannot overflow.
    let t: f64 = rng.gen_range(0.0..=1.0);
    (low * (1.0 - t) + high * t).clamp(low, high)
}

#[derive(Clone, Debug)]
pub struct Sweep {
    pub objects: Vec<PathBuf>,
    pub simulations_per_object: u32,
    pub velocity_range: FlowVelocityRange,
    pub domain: DomainBox,
    pub parameters: SimulationParameters,
}

/// A run that could not be submitted.
#[derive(Debug)]
pub struct SweepFailure {
    pub object: PathBuf,
    /// Zero-based run index for `object`.
    pub run: u32,
    pub flow_velocity: [f64; 3],
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub submitted: Vec<TaskHandle>,
    pub failures: Vec<SweepFailure>,
}

impl SweepOutcome {
    pub fn attempted(&self) -> usize {
        self.submitted.len() + self.failures.len()
    }
}

impl Sweep {
    pub fn new(objects: Vec<PathBuf>, velocity_range: FlowVelocityRange) -> Self {
        Self {
            objects,
            simulations_per_object: 1,
            velocity_range,
            domain: DomainBox::BATCH,
            parameters: SimulationParameters::default(),
        }
    }

    /// Every regular file directly inside `dir`, in name order.
    pub fn from_dataset(dir: &Path, velocity_range: FlowVelocityRange) -> Result<Self> {
        let io_err = |source| TemplateResolutionError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut objects = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() {
                objects.push(path);
            }
        }
        objects.sort();
        tracing::debug!(dataset = %dir.display(), objects = objects.len(), "dataset listed");
        Ok(Self::new(objects, velocity_range))
    }

    pub fn with_simulations_per_object(mut self, count: u32) -> Self {
        self.simulations_per_object = count;
        self
    }

    pub fn with_domain(mut self, domain: DomainBox) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_parameters(mut self, parameters: SimulationParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Submit every run. A failed run is recorded and the sweep moves on.
    pub async fn run<R: Rng + ?Sized>(
        &self,
        scenario: &WindTunnelScenario,
        pool: Option<&MachinePool>,
        rng: &mut R,
    ) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        for object in &self.objects {
            for run in 0..self.simulations_per_object {
                let flow_velocity = self.velocity_range.sample(rng);
                match self.run_one(scenario, object, flow_velocity, pool).await {
                    Ok(handle) => outcome.submitted.push(handle),
                    Err(error) => {
                        tracing::warn!(
                            object = %object.display(),
                            run,
                            ?flow_velocity,
                            %error,
                            "sweep run failed"
                        );
                        outcome.failures.push(SweepFailure {
                            object: object.clone(),
                            run,
                            flow_velocity,
                            error,
                        });
                    }
                }
            }
        }

        tracing::info!(
            submitted = outcome.submitted.len(),
            failed = outcome.failures.len(),
            "sweep finished"
        );
        outcome
    }

    async fn run_one(
        &self,
        scenario: &WindTunnelScenario,
        object: &Path,
        flow_velocity: [f64; 3],
        pool: Option<&MachinePool>,
    ) -> Result<TaskHandle> {
        let wind_tunnel = WindTunnel::with_box(flow_velocity, self.domain)?;
        scenario
            .with_wind_tunnel(wind_tunnel)
            .simulate(object, &self.parameters, pool)
            .await
    }
}
