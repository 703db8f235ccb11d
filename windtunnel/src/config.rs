use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ProvisioningError;
use crate::pool::{MachinePoolSpec, PoolSizing};
use crate::reconcile::ReconcileOptions;
use crate::task::WaitOptions;

/// Top-level settings for building and running wind tunnel cases.
///
/// Every field has a default, so a TOML file only needs the values it
/// changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindTunnelConfig {
    /// Directory under which cases are assembled.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Name prefix of each case directory.
    #[serde(default = "default_scenario_dir")]
    pub scenario_dir: String,

    /// JSON-lines file that records every submission, if set.
    #[serde(default)]
    pub job_log: Option<PathBuf>,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub wait: WaitConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_scenario_dir() -> String {
    "wind_tunnel_input".to_string()
}

impl Default for WindTunnelConfig {
    fn default() -> Self {
        Self {
            working_dir: default_working_dir(),
            scenario_dir: default_scenario_dir(),
            job_log: None,
            pool: PoolConfig::default(),
            wait: WaitConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl WindTunnelConfig {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_scenario_dir(mut self, name: impl Into<String>) -> Self {
        self.scenario_dir = name.into();
        self
    }

    pub fn with_job_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.job_log = Some(path.into());
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_reconcile(mut self, reconcile: ReconcileConfig) -> Self {
        self.reconcile = reconcile;
        self
    }

    /// Load configuration from a TOML file.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }
}

/// Machine pool settings, mirroring the batch submission defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub machine_type: String,
    pub num_machines: u32,
    pub disk_size_gb: u32,
    /// Scale between one machine and `num_machines` instead of a fixed count.
    pub elastic: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            machine_type: MachinePoolSpec::DEFAULT_MACHINE_TYPE.to_string(),
            num_machines: 1,
            disk_size_gb: MachinePoolSpec::DEFAULT_DISK_SIZE_GB,
            elastic: true,
        }
    }
}

impl PoolConfig {
    pub fn with_machine_type(mut self, machine_type: impl Into<String>) -> Self {
        self.machine_type = machine_type.into();
        self
    }

    pub fn with_num_machines(mut self, count: u32) -> Self {
        self.num_machines = count;
        self
    }

    pub fn with_disk_size(mut self, gb: u32) -> Self {
        self.disk_size_gb = gb;
        self
    }

    pub fn with_elastic(mut self, elastic: bool) -> Self {
        self.elastic = elastic;
        self
    }

    pub fn spec(&self) -> Result<MachinePoolSpec, ProvisioningError> {
        let sizing = if self.elastic {
            PoolSizing::Elastic {
                min: 1,
                max: self.num_machines,
            }
        } else {
            PoolSizing::Fixed {
                count: self.num_machines,
            }
        };
        MachinePoolSpec::new(self.machine_type.clone(), sizing, self.disk_size_gb)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: Option<u64>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            timeout_secs: None,
        }
    }
}

impl WaitConfig {
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn options(&self) -> WaitOptions {
        let options =
            WaitOptions::default().with_poll_interval(Duration::from_millis(self.poll_interval_ms));
        match self.timeout_secs {
            Some(secs) => options.with_timeout(Duration::from_secs(secs)),
            None => options,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub download: bool,
    pub output_subdir: PathBuf,
    pub concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        let options = ReconcileOptions::default();
        Self {
            download: options.download,
            output_subdir: options.output_subdir,
            concurrency: options.concurrency,
        }
    }
}

impl ReconcileConfig {
    pub fn options(&self) -> ReconcileOptions {
        ReconcileOptions::default()
            .with_download(self.download)
            .with_output_subdir(self.output_subdir.clone())
            .with_concurrency(self.concurrency)
    }
}
