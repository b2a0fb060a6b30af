//! Storage subsystem manager
//!
//! NVMe inventory scan, format, driver rebind and adding a newly inserted
//! device to an engine's device list.

use super::smd::{SmdDevice, SmdTable};
use super::{deadline, resolve_devices, DestructiveFlags, DeviceFanoutResult, DeviceReport};
use crate::domain::{FanoutResult, NvmeController, Rank, StorageProviderRef};
use crate::engine::RankRegistry;
use crate::error::{Error, Result};
use crate::fanout::Dispatcher;
use crate::metrics;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageScanRequest {
    #[serde(default)]
    pub include_health: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageScanResponse {
    pub controllers: Vec<NvmeController>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRequest {
    /// PCI addresses; empty means every scanned controller
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(flatten)]
    pub flags: DestructiveFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebindRequest {
    pub device: String,
    /// Target driver, e.g. `vfio-pci` or `nvme`
    pub driver: String,
    #[serde(flatten)]
    pub flags: DestructiveFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDeviceRequest {
    pub rank: Rank,
    pub device: String,
    #[serde(flatten)]
    pub flags: DestructiveFlags,
}

/// Storage operations against the local NVMe inventory
pub struct StorageManager {
    provider: StorageProviderRef,
    registry: Arc<RankRegistry>,
    smd: Arc<SmdTable>,
    dispatcher: Dispatcher<String>,
    /// Devices assigned to each engine
    engine_devices: Arc<RwLock<BTreeMap<Rank, BTreeSet<String>>>>,
    deadline: Duration,
}

impl StorageManager {
    pub fn new(
        provider: StorageProviderRef,
        registry: Arc<RankRegistry>,
        smd: Arc<SmdTable>,
        dispatcher: Dispatcher<String>,
        deadline: Duration,
    ) -> Self {
        Self {
            provider,
            registry,
            smd,
            dispatcher,
            engine_devices: Arc::new(RwLock::new(BTreeMap::new())),
            deadline,
        }
    }

    /// Devices assigned to `rank`
    pub fn engine_devices(&self, rank: Rank) -> BTreeSet<String> {
        self.engine_devices
            .read()
            .get(&rank)
            .cloned()
            .unwrap_or_default()
    }

    async fn inventory(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .provider
            .scan(false)
            .await?
            .into_iter()
            .map(|c| c.pci_address)
            .collect())
    }

    /// Enumerate controllers, sorted by PCI address
    pub async fn scan(&self, request: &StorageScanRequest) -> Result<StorageScanResponse> {
        let mut controllers = self.provider.scan(request.include_health).await?;
        controllers.sort_by(|a, b| a.pci_address.cmp(&b.pci_address));
        let total_bytes = controllers.iter().map(|c| c.capacity_bytes()).sum();

        metrics::FANOUT_CALLS
            .with_label_values(&["storage", "scan"])
            .inc();
        Ok(StorageScanResponse {
            controllers,
            total_bytes,
        })
    }

    /// Format each requested controller
    pub async fn format(&self, request: FormatRequest) -> Result<DeviceFanoutResult<DeviceReport>> {
        request.flags.require("format")?;
        let deadline = deadline(request.timeout_ms, self.deadline)?;
        let inventory = self.inventory().await?;
        let (targets, mut results) = resolve_devices(&request.devices, &inventory)?;

        let provider = self.provider.clone();
        let dry_run = request.flags.dry_run;
        let dispatched = self
            .dispatcher
            .run(targets, deadline, move |device| {
                let provider = provider.clone();
                async move {
                    if !dry_run {
                        provider.format(&device).await?;
                    }
                    Ok(DeviceReport::new("format", dry_run))
                }
            })
            .await;
        results.extend(dispatched);

        metrics::FANOUT_CALLS
            .with_label_values(&["storage", "format"])
            .inc();
        let result = FanoutResult::from_map(results);
        info!(
            devices = result.len(),
            failed = result.failed_targets().len(),
            dry_run,
            "Storage format complete"
        );
        Ok(result)
    }

    /// Move one controller to another driver
    pub async fn rebind(&self, request: RebindRequest) -> Result<DeviceFanoutResult<DeviceReport>> {
        request.flags.require("nvme rebind")?;
        if request.driver.trim().is_empty() {
            return Err(Error::MissingParameter("driver".into()));
        }
        let inventory = self.inventory().await?;
        let (targets, mut results) = resolve_devices(&[request.device.clone()], &inventory)?;

        let provider = self.provider.clone();
        let driver = request.driver.clone();
        let dry_run = request.flags.dry_run;
        let dispatched = self
            .dispatcher
            .run(targets, self.deadline, move |device| {
                let provider = provider.clone();
                let driver = driver.clone();
                async move {
                    if !dry_run {
                        provider.rebind(&device, &driver).await?;
                    }
                    Ok(DeviceReport::new(format!("rebind to {}", driver), dry_run))
                }
            })
            .await;
        results.extend(dispatched);

        metrics::FANOUT_CALLS
            .with_label_values(&["storage", "rebind"])
            .inc();
        Ok(FanoutResult::from_map(results))
    }

    /// Assign a newly inserted controller to an engine and record it in SMD
    pub async fn add_device(
        &self,
        request: AddDeviceRequest,
    ) -> Result<DeviceFanoutResult<DeviceReport>> {
        request.flags.require("nvme add-device")?;
        let inventory = self.inventory().await?;
        let (targets, mut results) = resolve_devices(&[request.device.clone()], &inventory)?;

        let registry = self.registry.clone();
        let smd = self.smd.clone();
        let assignments = self.engine_devices.clone();
        let rank = request.rank;
        let dry_run = request.flags.dry_run;
        let dispatched = self
            .dispatcher
            .run(targets, self.deadline, move |device| {
                let registry = registry.clone();
                let smd = smd.clone();
                let assignments = assignments.clone();
                async move {
                    registry.state(rank)?;
                    let owner = assignments
                        .read()
                        .iter()
                        .find(|(_, devices)| devices.contains(&device))
                        .map(|(owner, _)| *owner);
                    if let Some(owner) = owner {
                        return Err(Error::DeviceFailure {
                            device,
                            reason: format!("already assigned to rank {}", owner),
                        });
                    }

                    if !dry_run {
                        smd.insert(SmdDevice::new(device.clone(), rank))?;
                        assignments.write().entry(rank).or_default().insert(device);
                    }
                    Ok(DeviceReport::new(format!("add to rank {}", rank), dry_run))
                }
            })
            .await;
        results.extend(dispatched);

        metrics::FANOUT_CALLS
            .with_label_values(&["storage", "add_device"])
            .inc();
        Ok(FanoutResult::from_map(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FailureKind;
    use crate::fanout::KeyedLocks;
    use crate::hardware::StaticStorageProvider;
    use assert_matches::assert_matches;

    struct Fixture {
        manager: StorageManager,
        provider: Arc<StaticStorageProvider>,
        smd: Arc<SmdTable>,
    }

    fn fixture(controllers: usize) -> Fixture {
        let provider = Arc::new(StaticStorageProvider::with_sample_controllers(controllers));
        let registry = RankRegistry::new();
        registry.register(0).unwrap();
        let smd = Arc::new(SmdTable::new());
        let dispatcher = Dispatcher::new(
            "storage",
            Arc::new(KeyedLocks::new()),
            FailureKind::DeviceFailure,
        );
        let manager = StorageManager::new(
            provider.clone(),
            registry,
            smd.clone(),
            dispatcher,
            Duration::from_secs(1),
        );
        Fixture {
            manager,
            provider,
            smd,
        }
    }

    #[tokio::test]
    async fn test_scan_is_idempotent() {
        let f = fixture(3);
        let first = f.manager.scan(&StorageScanRequest::default()).await.unwrap();
        let second = f.manager.scan(&StorageScanRequest::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.controllers.len(), 3);
        assert_eq!(first.total_bytes, 3 * 1_600_321_314_816);
    }

    #[tokio::test]
    async fn test_format_requires_confirmation() {
        let f = fixture(1);
        assert_matches!(
            f.manager.format(FormatRequest::default()).await,
            Err(Error::ConfirmationRequired { .. })
        );
    }

    #[tokio::test]
    async fn test_format_partial_failure() {
        let f = fixture(3);
        f.provider.fail_on("0000:82:00.0", "media error");

        let result = f
            .manager
            .format(FormatRequest {
                devices: vec![],
                flags: DestructiveFlags::confirmed(),
                timeout_ms: None,
            })
            .await
            .unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(
            result.failed_targets(),
            vec!["0000:82:00.0".to_string()]
        );
        assert_eq!(f.provider.format_count("0000:81:00.0"), 1);
        assert_eq!(f.provider.format_count("0000:83:00.0"), 1);
    }

    #[tokio::test]
    async fn test_format_dry_run_changes_nothing() {
        let f = fixture(1);
        let result = f
            .manager
            .format(FormatRequest {
                devices: vec!["0000:81:00.0".into(), "0000:99:00.0".into()],
                flags: DestructiveFlags::dry_run(),
                timeout_ms: None,
            })
            .await
            .unwrap();

        assert!(result.get(&"0000:81:00.0".to_string()).unwrap().payload().unwrap().dry_run);
        assert_eq!(
            result.get(&"0000:99:00.0".to_string()).unwrap().failure_kind(),
            Some(FailureKind::NotFound)
        );
        assert_eq!(f.provider.format_count("0000:81:00.0"), 0);
    }

    #[tokio::test]
    async fn test_rebind_requires_driver() {
        let f = fixture(1);
        let request = RebindRequest {
            device: "0000:81:00.0".into(),
            driver: " ".into(),
            flags: DestructiveFlags::confirmed(),
        };
        assert_matches!(f.manager.rebind(request).await, Err(Error::MissingParameter(_)));
    }

    #[tokio::test]
    async fn test_add_device_assigns_once() {
        let f = fixture(2);
        let request = AddDeviceRequest {
            rank: Rank(0),
            device: "0000:81:00.0".into(),
            flags: DestructiveFlags::confirmed(),
        };

        let result = f.manager.add_device(request.clone()).await.unwrap();
        assert!(result.all_succeeded());
        assert!(f.manager.engine_devices(Rank(0)).contains("0000:81:00.0"));
        assert_eq!(f.smd.len(), 1);

        let again = f.manager.add_device(request).await.unwrap();
        assert_eq!(
            again.get(&"0000:81:00.0".to_string()).unwrap().failure_kind(),
            Some(FailureKind::DeviceFailure)
        );
    }

    #[tokio::test]
    async fn test_add_device_unknown_rank() {
        let f = fixture(1);
        let result = f
            .manager
            .add_device(AddDeviceRequest {
                rank: Rank(9),
                device: "0000:81:00.0".into(),
                flags: DestructiveFlags::confirmed(),
            })
            .await
            .unwrap();
        assert_eq!(
            result.get(&"0000:81:00.0".to_string()).unwrap().failure_kind(),
            Some(FailureKind::NotFound)
        );
        assert!(f.smd.is_empty());
    }
}
