//! Control plane configuration
//!
//! Loaded from a YAML file; every field has a default so an empty file is a
//! valid single-host configuration. Command-line flags override the file.

use crate::cluster::JoinRequest;
use crate::engine::{EngineSpec, HandleConfig};
use crate::error::{Error, Result};
use crate::fanout::CoordinatorConfig;
use crate::hardware::ScannerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Address other hosts reach this host's API on
    pub host_id: String,
    pub api_addr: String,
    pub health_addr: String,
    pub metrics_addr: String,
    pub engines: Vec<EngineSpec>,
    pub timeouts: TimeoutConfig,
    pub cluster: ClusterConfig,
    pub hardware: HardwareConfig,
    pub simulation: SimulationConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host_id: "127.0.0.1:8090".to_string(),
            api_addr: "0.0.0.0:8090".to_string(),
            health_addr: "0.0.0.0:8081".to_string(),
            metrics_addr: "0.0.0.0:8080".to_string(),
            engines: Vec::new(),
            timeouts: TimeoutConfig::default(),
            cluster: ClusterConfig::default(),
            hardware: HardwareConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

/// All timeouts in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline of a fanout call without its own timeout
    pub fanout_ms: u64,
    pub engine_operation_ms: u64,
    pub health_poll_initial_ms: u64,
    pub health_poll_max_ms: u64,
    pub stop_grace_ms: u64,
    /// Per-host wait in cluster operations
    pub host_transport_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fanout_ms: 10_000,
            engine_operation_ms: 30_000,
            health_poll_initial_ms: 250,
            health_poll_max_ms: 2_000,
            stop_grace_ms: 5_000,
            host_transport_ms: 15_000,
        }
    }
}

impl TimeoutConfig {
    pub fn fanout(&self) -> Duration {
        Duration::from_millis(self.fanout_ms)
    }

    pub fn host_transport(&self) -> Duration {
        Duration::from_millis(self.host_transport_ms)
    }

    pub fn handle(&self) -> HandleConfig {
        HandleConfig {
            operation_timeout: Duration::from_millis(self.engine_operation_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            health_poll_initial: Duration::from_millis(self.health_poll_initial_ms),
            health_poll_max: Duration::from_millis(self.health_poll_max_ms),
        }
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            fanout_timeout: self.fanout(),
            handle: self.handle(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Leader candidates; the first one leads. Empty means this host leads alone.
    pub access_points: Vec<String>,
    /// Hosts known at startup
    pub members: Vec<JoinRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub sysfs_path: PathBuf,
    pub dev_path: PathBuf,
    pub nvme_cli: String,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        let scanner = ScannerConfig::default();
        Self {
            sysfs_path: scanner.sysfs_path,
            dev_path: scanner.dev_path,
            nvme_cli: scanner.nvme_cli,
        }
    }
}

impl HardwareConfig {
    pub fn scanner(&self) -> ScannerConfig {
        ScannerConfig {
            sysfs_path: self.sysfs_path.clone(),
            dev_path: self.dev_path.clone(),
            nvme_cli: self.nvme_cli.clone(),
        }
    }
}

/// In-memory engines and hardware instead of real ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,
    /// Simulated ranks, numbered from `first_rank`
    pub ranks: u32,
    pub first_rank: u32,
    pub controllers: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ranks: 2,
            first_rank: 0,
            controllers: 2,
        }
    }
}

impl ControlConfig {
    pub fn from_yaml(input: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let input = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&input)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_id.trim().is_empty() {
            return Err(Error::Configuration("host_id must not be empty".into()));
        }

        let mut ranks = BTreeSet::new();
        for engine in &self.engines {
            if !ranks.insert(engine.rank) {
                return Err(Error::Configuration(format!(
                    "rank {} configured twice",
                    engine.rank
                )));
            }
        }

        let t = &self.timeouts;
        let timeouts = [
            ("fanout_ms", t.fanout_ms),
            ("engine_operation_ms", t.engine_operation_ms),
            ("health_poll_initial_ms", t.health_poll_initial_ms),
            ("health_poll_max_ms", t.health_poll_max_ms),
            ("stop_grace_ms", t.stop_grace_ms),
            ("host_transport_ms", t.host_transport_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(Error::Configuration(format!("{} must be positive", name)));
        }
        if t.health_poll_initial_ms > t.health_poll_max_ms {
            return Err(Error::Configuration(
                "health_poll_initial_ms exceeds health_poll_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// Leader candidates, falling back to this host alone
    pub fn access_points(&self) -> Vec<String> {
        if self.cluster.access_points.is_empty() {
            vec![self.host_id.clone()]
        } else {
            self.cluster.access_points.clone()
        }
    }
}
