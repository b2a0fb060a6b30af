//! Domain Ports - Core types and trait definitions for the control plane
//!
//! These traits define the boundaries between the fanout core and the things
//! it drives: engine processes and local hardware. Adapters implement these
//! traits to provide concrete functionality.

use super::ranks::{Rank, RankSet};
use super::state::EngineState;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Outcomes
// =============================================================================

/// Why a single target did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Target was never registered
    NotFound,
    /// Another operation holds the target's lock
    Busy,
    /// No outcome within the deadline
    Timeout,
    /// The engine reported a fault
    EngineFailure,
    /// The device reported a fault
    DeviceFailure,
    /// Host unreachable (cluster layer only)
    TransportFailure,
    /// Requested transition is not permitted from the current state
    InvalidState,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::NotFound => write!(f, "not_found"),
            FailureKind::Busy => write!(f, "busy"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::EngineFailure => write!(f, "engine_failure"),
            FailureKind::DeviceFailure => write!(f, "device_failure"),
            FailureKind::TransportFailure => write!(f, "transport_failure"),
            FailureKind::InvalidState => write!(f, "invalid_state"),
        }
    }
}

/// Outcome recorded for one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome<P> {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<P>,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl<P> Outcome<P> {
    pub fn success(payload: P) -> Self {
        Outcome::Success {
            payload: Some(payload),
        }
    }

    pub fn empty() -> Self {
        Outcome::Success { payload: None }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self::failure(err.failure_kind(), err.to_string())
    }

    pub fn from_result(result: Result<P>) -> Self {
        match result {
            Ok(payload) => Self::success(payload),
            Err(e) => Self::from_error(&e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Failure { kind, .. } => Some(*kind),
            Outcome::Success { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&P> {
        match self {
            Outcome::Success { payload } => payload.as_ref(),
            Outcome::Failure { .. } => None,
        }
    }
}

/// One entry of a fanout result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResult<K, P> {
    pub target: K,
    pub outcome: Outcome<P>,
}

/// Aggregate response: exactly one entry per requested target, ascending by target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutResult<K, P> {
    pub results: Vec<TargetResult<K, P>>,
}

impl<K: Ord + Clone, P> FanoutResult<K, P> {
    /// Build from a per-target map; ordering comes from the map's key order
    pub fn from_map(map: BTreeMap<K, Outcome<P>>) -> Self {
        Self {
            results: map
                .into_iter()
                .map(|(target, outcome)| TargetResult { target, outcome })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn targets(&self) -> BTreeSet<K> {
        self.results.iter().map(|r| r.target.clone()).collect()
    }

    pub fn get(&self, target: &K) -> Option<&Outcome<P>> {
        self.results
            .iter()
            .find(|r| &r.target == target)
            .map(|r| &r.outcome)
    }

    /// True when every requested target has exactly one entry and nothing else does
    pub fn covers_exactly(&self, requested: &BTreeSet<K>) -> bool {
        self.results.len() == requested.len() && &self.targets() == requested
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_success())
    }

    pub fn failed_targets(&self) -> Vec<K> {
        self.results
            .iter()
            .filter(|r| !r.outcome.is_success())
            .map(|r| r.target.clone())
            .collect()
    }

    pub fn into_map(self) -> BTreeMap<K, Outcome<P>> {
        self.results
            .into_iter()
            .map(|r| (r.target, r.outcome))
            .collect()
    }
}

// =============================================================================
// Rank Fanout Request/Response
// =============================================================================

/// Engine log mask settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMasks {
    /// Mask string, e.g. "ERR,mgmt=DEBUG"
    pub masks: String,
    /// Debug streams
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streams: Option<String>,
    /// Subsystems
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystems: Option<String>,
}

/// Operation fanned out to ranks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RankOp {
    PrepShutdown,
    Stop,
    ResetFormat,
    Start,
    Query,
    SetLogMasks(LogMasks),
    CollectLog { max_lines: usize },
}

impl RankOp {
    pub fn name(&self) -> &'static str {
        match self {
            RankOp::PrepShutdown => "prep_shutdown",
            RankOp::Stop => "stop",
            RankOp::ResetFormat => "reset_format",
            RankOp::Start => "start",
            RankOp::Query => "query",
            RankOp::SetLogMasks(_) => "set_log_masks",
            RankOp::CollectLog { .. } => "collect_log",
        }
    }

    /// Operations that change engine state or on-disk flags
    pub fn is_destructive(&self) -> bool {
        matches!(self, RankOp::Stop | RankOp::ResetFormat)
    }
}

impl std::fmt::Display for RankOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Request to fan an operation out to local ranks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutRequest {
    /// Target ranks; empty means every known rank
    #[serde(default)]
    pub ranks: RankSet,
    /// Operation and its parameters
    pub op: RankOp,
    /// Changes failure policy (stop escalates to kill)
    #[serde(default)]
    pub force: bool,
    /// Per-call deadline override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl FanoutRequest {
    pub fn new(ranks: RankSet, op: RankOp) -> Self {
        Self {
            ranks,
            op,
            force: false,
            timeout_ms: None,
        }
    }

    pub fn all(op: RankOp) -> Self {
        Self::new(RankSet::new(), op)
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Per-rank payload of a successful operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankReport {
    /// Registry state after the operation
    pub state: EngineState,
    /// Operation-specific detail (collected log text, applied masks)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RankReport {
    pub fn new(state: EngineState) -> Self {
        Self {
            state,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub type RankFanoutResult = FanoutResult<Rank, RankReport>;

// =============================================================================
// Hardware Types
// =============================================================================

/// NVMe health counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStats {
    /// Temperature in Celsius
    pub temperature_celsius: i32,
    /// Percentage of drive life used
    pub percentage_used: u8,
    /// Data units read (in 512KB units)
    pub data_units_read: u64,
    /// Data units written (in 512KB units)
    pub data_units_written: u64,
    /// Power-on hours
    pub power_on_hours: u64,
    /// Media and data integrity errors
    pub media_errors: u64,
    /// Critical warning flags
    pub critical_warning: u8,
}

/// NVMe namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeNamespace {
    pub id: u32,
    pub size_bytes: u64,
}

/// NVMe controller identified by its PCI address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeController {
    /// Durable PCI address, e.g. 0000:81:00.0
    pub pci_address: String,
    pub model: String,
    pub serial: String,
    pub firmware_rev: String,
    pub numa_node: i32,
    /// Kernel or user-space driver currently bound
    pub driver: String,
    pub namespaces: Vec<NvmeNamespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStats>,
}

impl NvmeController {
    pub fn capacity_bytes(&self) -> u64 {
        self.namespaces.iter().map(|ns| ns.size_bytes).sum()
    }
}

/// Firmware details of one controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub pci_address: String,
    pub model: String,
    pub revision: String,
    /// Active firmware slot
    pub active_slot: u8,
}

/// Fabric interface and its NUMA affinity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FabricInterface {
    /// Network interface name, e.g. ib0
    pub interface: String,
    /// Fabric device, e.g. mlx5_0
    pub device: String,
    /// Fabric providers usable over this interface
    pub providers: Vec<String>,
    pub numa_node: i32,
}

// =============================================================================
// Engine Process Port
// =============================================================================

/// Black-box storage engine process driven by an engine handle
#[async_trait]
pub trait EngineProcess: Send + Sync {
    /// Rank served by this engine
    fn rank(&self) -> Rank;

    /// Launch the engine
    async fn start(&self) -> Result<()>;

    /// True once the launched engine answers its health check
    async fn health_check(&self) -> Result<bool>;

    /// Prepare the engine for a controlled shutdown
    async fn prep_shutdown(&self) -> Result<()>;

    /// Ask the engine to exit and wait up to `grace` for it to go away
    async fn stop(&self, grace: Duration) -> Result<()>;

    /// Terminate the engine without waiting for a clean exit
    async fn kill(&self) -> Result<()>;

    /// True while the engine process exists
    async fn is_running(&self) -> bool;

    /// Clear the engine's formatted flag so storage must be formatted again
    async fn reset_format(&self) -> Result<()>;

    /// State as observed from the engine itself
    async fn query_state(&self) -> Result<EngineState>;

    /// Adjust log verbosity
    async fn set_log_masks(&self, masks: &LogMasks) -> Result<()>;

    /// Return the last `max_lines` lines of the engine log
    async fn collect_log(&self, max_lines: usize) -> Result<String>;
}

// =============================================================================
// Hardware Ports
// =============================================================================

/// Port for local NVMe inventory and device operations
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Enumerate controllers, optionally with health counters
    async fn scan(&self, include_health: bool) -> Result<Vec<NvmeController>>;

    /// Low-level format of every namespace on a controller
    async fn format(&self, pci_address: &str) -> Result<()>;

    /// Rebind a controller to another driver
    async fn rebind(&self, pci_address: &str, driver: &str) -> Result<()>;

    /// Read firmware details
    async fn firmware(&self, pci_address: &str) -> Result<FirmwareInfo>;

    /// Flash and activate a firmware image
    async fn update_firmware(&self, pci_address: &str, image: &Path) -> Result<FirmwareInfo>;
}

/// Port for fabric interface discovery
#[async_trait]
pub trait FabricScanner: Send + Sync {
    /// Enumerate interfaces, keeping only those offering `provider` when given
    async fn scan(&self, provider: Option<&str>) -> Result<Vec<FabricInterface>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type EngineProcessRef = Arc<dyn EngineProcess>;
pub type StorageProviderRef = Arc<dyn StorageProvider>;
pub type FabricScannerRef = Arc<dyn FabricScanner>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(format!("{}", FailureKind::Busy), "busy");
        assert_eq!(format!("{}", FailureKind::TransportFailure), "transport_failure");
    }

    #[test]
    fn test_fanout_result_is_ordered_and_complete() {
        let mut map = BTreeMap::new();
        map.insert(Rank(3), Outcome::<RankReport>::empty());
        map.insert(Rank(1), Outcome::failure(FailureKind::Busy, "busy"));
        map.insert(Rank(2), Outcome::success(RankReport::new(EngineState::Ready)));

        let result = FanoutResult::from_map(map);
        let order: Vec<u32> = result.results.iter().map(|r| r.target.get()).collect();
        assert_eq!(order, vec![1, 2, 3]);

        let requested: BTreeSet<Rank> = [1, 2, 3].into_iter().map(Rank).collect();
        assert!(result.covers_exactly(&requested));
        assert!(!result.all_succeeded());
        assert_eq!(result.failed_targets(), vec![Rank(1)]);
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome: Outcome<RankReport> = Outcome::failure(FailureKind::Timeout, "late");
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], "timeout");

        let outcome = Outcome::success(RankReport::new(EngineState::Stopped));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["payload"]["state"], "stopped");
    }

    #[test]
    fn test_fanout_result_from_json() {
        let json = r#"{"results":[
            {"target":0,"outcome":{"status":"success"}},
            {"target":1,"outcome":{"status":"failure","kind":"busy","message":"rank 1 busy"}}
        ]}"#;
        let result: RankFanoutResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.get(&Rank(0)).unwrap(), &Outcome::empty());
        assert_eq!(result.get(&Rank(1)).unwrap().failure_kind(), Some(FailureKind::Busy));
    }

    #[test]
    fn test_fanout_request_json() {
        let json = r#"{"ranks":"0-2","op":{"op":"stop"},"force":true}"#;
        let req: FanoutRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.ranks.len(), 3);
        assert_eq!(req.op, RankOp::Stop);
        assert!(req.force);
        assert!(req.timeout().is_none());
    }
}
