//! Validated value objects describing one wind-tunnel experiment.
//!
//! Both records serialize to a flat [`ParamMap`] that feeds placeholder
//! substitution during case assembly, and can be rebuilt from that map.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Incompressible-flow validity limit in m/s (exclusive).
pub const MAX_FLOW_SPEED: f64 = 100.0;

pub const DEFAULT_FLOW_VELOCITY: [f64; 3] = [30.0, 0.0, 0.0];

const AXES: [char; 3] = ['x', 'y', 'z'];

/// A single substitutable parameter value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Real(f64),
    Vector([f64; 3]),
}

impl ParamValue {
    pub fn as_real(&self) -> Option<f64> {
        match *self {
            ParamValue::Integer(v) => Some(v as f64),
            ParamValue::Real(v) => Some(v),
            ParamValue::Vector(_) => None,
        }
    }

    pub fn component(&self, index: usize) -> Option<f64> {
        match self {
            ParamValue::Vector(v) => v.get(index).copied(),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    /// Vectors render in OpenFOAM tuple form: `(30 0 0)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{v}"),
            ParamValue::Real(v) => write!(f, "{v}"),
            ParamValue::Vector([x, y, z]) => write!(f, "({x} {y} {z})"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Integer(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Integer(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Real(value)
    }
}

impl From<[f64; 3]> for ParamValue {
    fn from(value: [f64; 3]) -> Self {
        ParamValue::Vector(value)
    }
}

/// Ordered flat mapping from field name to value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamMap(BTreeMap<String, ParamValue>);

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Union of `self` and `later`. On a name collision the value from
    /// `later` wins.
    pub fn merged_with(mut self, later: &ParamMap) -> ParamMap {
        for (name, value) in &later.0 {
            if let Some(previous) = self.0.insert(name.clone(), *value) {
                if previous != *value {
                    tracing::debug!(
                        param = %name,
                        previous = %previous,
                        value = %value,
                        "parameter overridden by later source"
                    );
                }
            }
        }
        self
    }

    fn require(&self, name: &str) -> Result<&ParamValue, ValidationError> {
        self.get(name).ok_or_else(|| ValidationError::Parameter {
            name: name.to_string(),
            detail: "missing".to_string(),
        })
    }

    pub fn real(&self, name: &str) -> Result<f64, ValidationError> {
        self.require(name)?
            .as_real()
            .ok_or_else(|| ValidationError::Parameter {
                name: name.to_string(),
                detail: "expected a number".to_string(),
            })
    }

    pub fn integer(&self, name: &str) -> Result<i64, ValidationError> {
        match self.require(name)? {
            ParamValue::Integer(v) => Ok(*v),
            ParamValue::Real(v) if v.fract() == 0.0 && v.is_finite() => Ok(*v as i64),
            _ => Err(ValidationError::Parameter {
                name: name.to_string(),
                detail: "expected an integer".to_string(),
            }),
        }
    }

    pub fn vector(&self, name: &str) -> Result<[f64; 3], ValidationError> {
        match self.require(name)? {
            ParamValue::Vector(v) => Ok(*v),
            _ => Err(ValidationError::Parameter {
                name: name.to_string(),
                detail: "expected a 3-component vector".to_string(),
            }),
        }
    }
}

impl FromIterator<(String, ParamValue)> for ParamMap {
    fn from_iter<T: IntoIterator<Item = (String, ParamValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Canonical axis-aligned simulation domain.
///
/// Both historical input shapes (six scalars, or an `x`/`y`/`z` mapping of
/// `[min, max]` pairs) construct this one type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DomainBox {
    bounds: [[f64; 2]; 3],
}

impl DomainBox {
    /// Default box for the six-scalar schema.
    pub const DEFAULT: DomainBox = DomainBox {
        bounds: [[-5.0, 15.0], [-5.0, 5.0], [0.0, 8.0]],
    };

    /// Default used when the axis-mapping constructor receives no domain.
    pub const DEFAULT_AXES: DomainBox = DomainBox {
        bounds: [[-5.0, 15.0], [-4.0, 4.0], [0.0, 8.0]],
    };

    /// Longer downstream region used by the batch submission defaults.
    pub const BATCH: DomainBox = DomainBox {
        bounds: [[-5.0, 20.0], [-5.0, 5.0], [0.0, 8.0]],
    };

    pub fn from_bounds(
        x_min: f64,
        x_max: f64,
        y_min: f64,
        y_max: f64,
        z_min: f64,
        z_max: f64,
    ) -> Result<Self, ValidationError> {
        let bounds = [[x_min, x_max], [y_min, y_max], [z_min, z_max]];
        for (axis, [min, max]) in AXES.iter().zip(bounds) {
            if !min.is_finite() || !max.is_finite() {
                return Err(ValidationError::NonFinite {
                    field: "domain bound",
                    value: if min.is_finite() { max } else { min },
                });
            }
            if min >= max {
                return Err(ValidationError::InvertedAxis {
                    axis: *axis,
                    min,
                    max,
                });
            }
        }
        Ok(Self { bounds })
    }

    /// Builds a box from an axis mapping holding exactly `x`, `y` and `z`.
    pub fn from_axes(axes: &BTreeMap<String, [f64; 2]>) -> Result<Self, ValidationError> {
        let unexpected: Vec<&str> = axes
            .keys()
            .map(String::as_str)
            .filter(|k| !matches!(*k, "x" | "y" | "z"))
            .collect();
        if !unexpected.is_empty() {
            return Err(ValidationError::DomainAxes {
                detail: format!("unexpected axes {unexpected:?}"),
            });
        }

        let mut bounds = [[0.0; 2]; 3];
        for (slot, axis) in bounds.iter_mut().zip(AXES) {
            *slot = *axes.get(axis.to_string().as_str()).ok_or_else(|| {
                ValidationError::DomainAxes {
                    detail: format!("missing axis {axis}"),
                }
            })?;
        }

        let [[x_min, x_max], [y_min, y_max], [z_min, z_max]] = bounds;
        Self::from_bounds(x_min, x_max, y_min, y_max, z_min, z_max)
    }

    pub fn x(&self) -> [f64; 2] {
        self.bounds[0]
    }

    pub fn y(&self) -> [f64; 2] {
        self.bounds[1]
    }

    pub fn z(&self) -> [f64; 2] {
        self.bounds[2]
    }

    pub fn to_axes(&self) -> BTreeMap<String, [f64; 2]> {
        AXES.iter()
            .zip(self.bounds)
            .map(|(axis, range)| (axis.to_string(), range))
            .collect()
    }
}

impl Default for DomainBox {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Caller-facing domain description in either schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainSpec {
    Bounds {
        x_min: f64,
        x_max: f64,
        y_min: f64,
        y_max: f64,
        z_min: f64,
        z_max: f64,
    },
    Axes(BTreeMap<String, [f64; 2]>),
}

impl DomainSpec {
    pub fn axes<const N: usize>(pairs: [(&str, [f64; 2]); N]) -> Self {
        DomainSpec::Axes(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    pub fn resolve(&self) -> Result<DomainBox, ValidationError> {
        match self {
            DomainSpec::Bounds {
                x_min,
                x_max,
                y_min,
                y_max,
                z_min,
                z_max,
            } => DomainBox::from_bounds(*x_min, *x_max, *y_min, *y_max, *z_min, *z_max),
            DomainSpec::Axes(axes) => DomainBox::from_axes(axes),
        }
    }
}

/// Physical test enclosure and inflow condition.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WindTunnelRepr", into = "WindTunnelRepr")]
pub struct WindTunnel {
    flow_velocity: [f64; 3],
    domain: DomainBox,
}

impl WindTunnel {
    /// Creates a tunnel from a velocity and an optional domain in either
    /// schema. An omitted domain uses [`DomainBox::DEFAULT_AXES`].
    pub fn new(flow_velocity: [f64; 3], domain: Option<DomainSpec>) -> Result<Self, ValidationError> {
        let domain = match domain {
            Some(spec) => spec.resolve()?,
            None => DomainBox::DEFAULT_AXES,
        };
        Self::with_box(flow_velocity, domain)
    }

    pub fn from_bounds(
        flow_velocity: [f64; 3],
        x_min: f64,
        x_max: f64,
        y_min: f64,
        y_max: f64,
        z_min: f64,
        z_max: f64,
    ) -> Result<Self, ValidationError> {
        let domain = DomainBox::from_bounds(x_min, x_max, y_min, y_max, z_min, z_max)?;
        Self::with_box(flow_velocity, domain)
    }

    pub fn with_box(flow_velocity: [f64; 3], domain: DomainBox) -> Result<Self, ValidationError> {
        if let Some(bad) = flow_velocity.iter().find(|c| !c.is_finite()) {
            return Err(ValidationError::NonFinite {
                field: "flow_velocity",
                value: *bad,
            });
        }
        let speed = magnitude(flow_velocity);
        if speed >= MAX_FLOW_SPEED {
            return Err(ValidationError::FlowTooFast {
                speed,
                limit: MAX_FLOW_SPEED,
            });
        }
        Ok(Self {
            flow_velocity,
            domain,
        })
    }

    pub fn flow_velocity(&self) -> [f64; 3] {
        self.flow_velocity
    }

    pub fn flow_speed(&self) -> f64 {
        magnitude(self.flow_velocity)
    }

    pub fn domain(&self) -> &DomainBox {
        &self.domain
    }

    pub fn to_params(&self) -> ParamMap {
        let mut params = ParamMap::new();
        params.insert("flow_velocity", self.flow_velocity);
        for (axis, [min, max]) in AXES.iter().zip(self.domain.bounds) {
            params.insert(format!("{axis}_min"), min);
            params.insert(format!("{axis}_max"), max);
        }
        params
    }

    pub fn from_params(params: &ParamMap) -> Result<Self, ValidationError> {
        Self::from_bounds(
            params.vector("flow_velocity")?,
            params.real("x_min")?,
            params.real("x_max")?,
            params.real("y_min")?,
            params.real("y_max")?,
            params.real("z_min")?,
            params.real("z_max")?,
        )
    }
}

impl Default for WindTunnel {
    fn default() -> Self {
        Self {
            flow_velocity: DEFAULT_FLOW_VELOCITY,
            domain: DomainBox::DEFAULT,
        }
    }
}

fn magnitude(v: [f64; 3]) -> f64 {
    v.iter().map(|c| c * c).sum::<f64>().sqrt()
}

/// Wire shape accepting both schemas; serializes as six scalars.
#[derive(Serialize, Deserialize)]
struct WindTunnelRepr {
    #[serde(default = "default_flow_velocity")]
    flow_velocity: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    domain: Option<BTreeMap<String, [f64; 2]>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    x_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    x_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    y_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    y_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    z_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    z_max: Option<f64>,
}

fn default_flow_velocity() -> [f64; 3] {
    DEFAULT_FLOW_VELOCITY
}

impl TryFrom<WindTunnelRepr> for WindTunnel {
    type Error = ValidationError;

    fn try_from(repr: WindTunnelRepr) -> Result<Self, Self::Error> {
        let scalars = [
            repr.x_min, repr.x_max, repr.y_min, repr.y_max, repr.z_min, repr.z_max,
        ];
        match repr.domain {
            Some(axes) => {
                if scalars.iter().any(Option::is_some) {
                    return Err(ValidationError::DomainAxes {
                        detail: "cannot combine a domain mapping with scalar bounds".into(),
                    });
                }
                Self::with_box(repr.flow_velocity, DomainBox::from_axes(&axes)?)
            }
            None => {
                let d = DomainBox::DEFAULT;
                Self::from_bounds(
                    repr.flow_velocity,
                    repr.x_min.unwrap_or(d.x()[0]),
                    repr.x_max.unwrap_or(d.x()[1]),
                    repr.y_min.unwrap_or(d.y()[0]),
                    repr.y_max.unwrap_or(d.y()[1]),
                    repr.z_min.unwrap_or(d.z()[0]),
                    repr.z_max.unwrap_or(d.z()[1]),
                )
            }
        }
    }
}

impl From<WindTunnel> for WindTunnelRepr {
    fn from(tunnel: WindTunnel) -> Self {
        let [x, y, z] = tunnel.domain.bounds;
        Self {
            flow_velocity: tunnel.flow_velocity,
            domain: None,
            x_min: Some(x[0]),
            x_max: Some(x[1]),
            y_min: Some(y[0]),
            y_max: Some(y[1]),
            z_min: Some(z[0]),
            z_max: Some(z[1]),
        }
    }
}

/// Numeric solver controls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SimulationParametersRepr")]
pub struct SimulationParameters {
    num_iterations: u32,
    resolution: u32,
}

impl SimulationParameters {
    pub const DEFAULT_NUM_ITERATIONS: u32 = 100;
    pub const DEFAULT_RESOLUTION: u32 = 2;

    pub fn new(num_iterations: u32, resolution: u32) -> Result<Self, ValidationError> {
        if num_iterations == 0 {
            return Err(ValidationError::NotPositive {
                field: "num_iterations",
                value: 0,
            });
        }
        if resolution == 0 {
            return Err(ValidationError::NotPositive {
                field: "resolution",
                value: 0,
            });
        }
        Ok(Self {
            num_iterations,
            resolution,
        })
    }

    pub fn num_iterations(&self) -> u32 {
        self.num_iterations
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn to_params(&self) -> ParamMap {
        let mut params = ParamMap::new();
        params.insert("num_iterations", self.num_iterations);
        params.insert("resolution", self.resolution);
        params
    }

    pub fn from_params(params: &ParamMap) -> Result<Self, ValidationError> {
        Self::new(
            positive_u32(params, "num_iterations")?,
            positive_u32(params, "resolution")?,
        )
    }
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            num_iterations: Self::DEFAULT_NUM_ITERATIONS,
            resolution: Self::DEFAULT_RESOLUTION,
        }
    }
}

fn positive_u32(params: &ParamMap, field: &'static str) -> Result<u32, ValidationError> {
    let value = params.integer(field)?;
    if value <= 0 {
        return Err(ValidationError::NotPositive { field, value });
    }
    u32::try_from(value).map_err(|_| ValidationError::Parameter {
        name: field.to_string(),
        detail: format!("{value} is out of range"),
    })
}

#[derive(Deserialize)]
struct SimulationParametersRepr {
    #[serde(default = "default_num_iterations")]
    num_iterations: i64,
    #[serde(default = "default_resolution")]
    resolution: i64,
}

fn default_num_iterations() -> i64 {
    SimulationParameters::DEFAULT_NUM_ITERATIONS.into()
}

fn default_resolution() -> i64 {
    SimulationParameters::DEFAULT_RESOLUTION.into()
}

impl TryFrom<SimulationParametersRepr> for SimulationParameters {
    type Error = ValidationError;

    fn try_from(repr: SimulationParametersRepr) -> Result<Self, Self::Error> {
        let mut params = ParamMap::new();
        params.insert("num_iterations", repr.num_iterations);
        params.insert("resolution", repr.resolution);
        Self::from_params(&params)
    }
}
