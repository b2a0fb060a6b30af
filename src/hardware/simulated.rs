//! In-memory hardware for simulation mode and tests
//!
//! Device operations can be delayed or made to fail per PCI address.

use crate::domain::{
    FabricInterface, FabricScanner, FirmwareInfo, HealthStats, NvmeController, NvmeNamespace,
    StorageProvider,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Storage provider over a fixed controller inventory
#[derive(Debug, Default)]
pub struct StaticStorageProvider {
    controllers: RwLock<BTreeMap<String, NvmeController>>,
    failures: RwLock<HashMap<String, String>>,
    delays: RwLock<HashMap<String, Duration>>,
    formats: RwLock<HashMap<String, usize>>,
}

impl StaticStorageProvider {
    pub fn new(controllers: Vec<NvmeController>) -> Self {
        Self {
            controllers: RwLock::new(
                controllers
                    .into_iter()
                    .map(|c| (c.pci_address.clone(), c))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// Inventory of `count` identical controllers spread over two NUMA nodes
    pub fn with_sample_controllers(count: usize) -> Self {
        Self::new((0..count).map(sample_controller).collect())
    }

    /// Make every operation on `pci_address` fail with `reason`
    pub fn fail_on(&self, pci_address: &str, reason: &str) {
        self.failures
            .write()
            .insert(pci_address.to_string(), reason.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.write().clear();
    }

    pub fn delay(&self, pci_address: &str, delay: Duration) {
        self.delays.write().insert(pci_address.to_string(), delay);
    }

    /// How many times `pci_address` was formatted
    pub fn format_count(&self, pci_address: &str) -> usize {
        self.formats.read().get(pci_address).copied().unwrap_or(0)
    }

    async fn enter(&self, pci_address: &str) -> Result<NvmeController> {
        let controller = self
            .controllers
            .read()
            .get(pci_address)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                device: pci_address.to_string(),
            })?;

        let delay = self.delays.read().get(pci_address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.read().get(pci_address).cloned();
        match failure {
            Some(reason) => Err(Error::DeviceFailure {
                device: pci_address.to_string(),
                reason,
            }),
            None => Ok(controller),
        }
    }
}

#[async_trait]
impl StorageProvider for StaticStorageProvider {
    async fn scan(&self, include_health: bool) -> Result<Vec<NvmeController>> {
        Ok(self
            .controllers
            .read()
            .values()
            .cloned()
            .map(|mut c| {
                if !include_health {
                    c.health = None;
                }
                c
            })
            .collect())
    }

    async fn format(&self, pci_address: &str) -> Result<()> {
        self.enter(pci_address).await?;
        *self
            .formats
            .write()
            .entry(pci_address.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn rebind(&self, pci_address: &str, driver: &str) -> Result<()> {
        self.enter(pci_address).await?;
        if let Some(c) = self.controllers.write().get_mut(pci_address) {
            c.driver = driver.to_string();
        }
        Ok(())
    }

    async fn firmware(&self, pci_address: &str) -> Result<FirmwareInfo> {
        let c = self.enter(pci_address).await?;
        Ok(FirmwareInfo {
            pci_address: c.pci_address,
            model: c.model,
            revision: c.firmware_rev,
            active_slot: 1,
        })
    }

    /// The image's file stem becomes the new revision
    async fn update_firmware(&self, pci_address: &str, image: &Path) -> Result<FirmwareInfo> {
        self.enter(pci_address).await?;
        let revision = image
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| Error::DeviceFailure {
                device: pci_address.to_string(),
                reason: format!("invalid firmware image {}", image.display()),
            })?;

        if let Some(c) = self.controllers.write().get_mut(pci_address) {
            c.firmware_rev = revision;
        }
        self.firmware(pci_address).await
    }
}

fn sample_controller(index: usize) -> NvmeController {
    NvmeController {
        pci_address: format!("0000:{:02x}:00.0", 0x81 + index),
        model: "SIM NVMe 1.6TB".to_string(),
        serial: format!("SIM{:06}", index),
        firmware_rev: "SIM10100".to_string(),
        numa_node: (index % 2) as i32,
        driver: "nvme".to_string(),
        namespaces: vec![NvmeNamespace {
            id: 1,
            size_bytes: 1_600_321_314_816,
        }],
        health: Some(HealthStats {
            temperature_celsius: 35,
            percentage_used: 1,
            data_units_read: 0,
            data_units_written: 0,
            power_on_hours: 100,
            media_errors: 0,
            critical_warning: 0,
        }),
    }
}

/// Fabric scanner over a fixed interface list
#[derive(Debug, Clone, Default)]
pub struct StaticFabricScanner {
    interfaces: Vec<FabricInterface>,
}

impl StaticFabricScanner {
    pub fn new(mut interfaces: Vec<FabricInterface>) -> Self {
        interfaces.sort();
        Self { interfaces }
    }

    /// One TCP interface per NUMA node
    pub fn sample() -> Self {
        Self::new(
            (0..2)
                .map(|numa| FabricInterface {
                    interface: format!("eth{}", numa),
                    device: format!("eth{}", numa),
                    providers: vec!["ofi+tcp".to_string(), "ofi+tcp;ofi_rxm".to_string()],
                    numa_node: numa,
                })
                .collect(),
        )
    }
}

#[async_trait]
impl FabricScanner for StaticFabricScanner {
    async fn scan(&self, provider: Option<&str>) -> Result<Vec<FabricInterface>> {
        Ok(self
            .interfaces
            .iter()
            .filter(|i| provider.map_or(true, |p| i.providers.iter().any(|x| x == p)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sample_inventory() {
        let provider = StaticStorageProvider::with_sample_controllers(3);
        let controllers = provider.scan(false).await.unwrap();
        assert_eq!(controllers.len(), 3);
        assert_eq!(controllers[0].pci_address, "0000:81:00.0");
        assert!(controllers[0].health.is_none());
        assert!(provider.scan(true).await.unwrap()[0].health.is_some());
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let provider = StaticStorageProvider::with_sample_controllers(2);
        provider.fail_on("0000:82:00.0", "media error");
        assert!(provider.format("0000:81:00.0").await.is_ok());
        assert!(provider.format("0000:82:00.0").await.is_err());
        assert_eq!(provider.format_count("0000:81:00.0"), 1);
        assert_eq!(provider.format_count("0000:82:00.0"), 0);
    }

    #[tokio::test]
    async fn test_update_firmware_sets_revision() {
        let provider = StaticStorageProvider::with_sample_controllers(1);
        let info = provider
            .update_firmware("0000:81:00.0", Path::new("/tmp/SIM10200.bin"))
            .await
            .unwrap();
        assert_eq!(info.revision, "SIM10200");
    }
}
