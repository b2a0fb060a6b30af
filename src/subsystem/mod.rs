//! Subsystem managers - device-level operations on local hardware
//!
//! Device operations reuse the rank fanout's dispatch: per-device try-locks,
//! a deadline, and one outcome per requested device. Destructive requests
//! must carry either a confirmation or a dry-run flag.

pub mod firmware;
pub mod network;
pub mod smd;
pub mod storage;

pub use firmware::{FirmwareManager, FirmwareQueryRequest, FirmwareUpdateRequest};
pub use network::{NetworkManager, NetworkScanRequest, NetworkScanResponse};
pub use smd::{
    DeviceRole, DeviceState, LedState, SmdAction, SmdDevice, SmdManageRequest, SmdManager,
    SmdQueryRequest, SmdQueryResponse,
};
pub use storage::{
    AddDeviceRequest, FormatRequest, RebindRequest, StorageManager, StorageScanRequest,
    StorageScanResponse,
};

use crate::domain::{FanoutResult, Outcome};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Per-device result keyed by PCI address
pub type DeviceFanoutResult<P> = FanoutResult<String, P>;

/// Confirmation carried by every destructive request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestructiveFlags {
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub dry_run: bool,
}

impl DestructiveFlags {
    pub fn confirmed() -> Self {
        Self {
            confirm: true,
            dry_run: false,
        }
    }

    pub fn dry_run() -> Self {
        Self {
            confirm: false,
            dry_run: true,
        }
    }

    /// Reject the request unless it is confirmed or a dry run
    pub fn require(&self, operation: &str) -> Result<()> {
        if self.confirm || self.dry_run {
            Ok(())
        } else {
            Err(Error::ConfirmationRequired {
                operation: operation.to_string(),
            })
        }
    }
}

/// Payload of a destructive device operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub action: String,
    /// True when nothing was changed
    pub dry_run: bool,
}

impl DeviceReport {
    pub fn new(action: impl Into<String>, dry_run: bool) -> Self {
        Self {
            action: action.into(),
            dry_run,
        }
    }
}

/// Resolve requested device addresses against the local inventory.
///
/// An empty request selects the whole inventory. Addresses missing from the
/// inventory get a `NotFound` outcome up front and are not dispatched.
pub(crate) fn resolve_devices<P>(
    requested: &[String],
    inventory: &BTreeSet<String>,
) -> Result<(Vec<String>, BTreeMap<String, Outcome<P>>)> {
    if requested.iter().any(|d| d.trim().is_empty()) {
        return Err(Error::InvalidRequest("empty device address".into()));
    }

    if requested.is_empty() {
        return Ok((inventory.iter().cloned().collect(), BTreeMap::new()));
    }

    let mut targets = Vec::new();
    let mut missing = BTreeMap::new();
    let unique: BTreeSet<&String> = requested.iter().collect();
    for device in unique {
        if inventory.contains(device) {
            targets.push(device.clone());
        } else {
            let err = Error::DeviceNotFound {
                device: device.clone(),
            };
            missing.insert(device.clone(), Outcome::from_error(&err));
        }
    }
    Ok((targets, missing))
}

/// Per-call deadline, rejecting an explicit zero
pub(crate) fn deadline(timeout_ms: Option<u64>, default: Duration) -> Result<Duration> {
    match timeout_ms {
        Some(0) => Err(Error::InvalidRequest("timeout must be positive".into())),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FailureKind;

    #[test]
    fn test_destructive_flags() {
        assert!(DestructiveFlags::default().require("format").is_err());
        assert!(DestructiveFlags::confirmed().require("format").is_ok());
        assert!(DestructiveFlags::dry_run().require("format").is_ok());
    }

    #[test]
    fn test_resolve_devices() {
        let inventory: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();

        let (targets, missing) = resolve_devices::<()>(&[], &inventory).unwrap();
        assert_eq!(targets, vec!["a", "b"]);
        assert!(missing.is_empty());

        let requested = vec!["b".to_string(), "z".to_string(), "b".to_string()];
        let (targets, missing) = resolve_devices::<()>(&requested, &inventory).unwrap();
        assert_eq!(targets, vec!["b"]);
        assert_eq!(missing["z"].failure_kind(), Some(FailureKind::NotFound));

        assert!(resolve_devices::<()>(&["".to_string()], &inventory).is_err());
    }
}
