//! NVMe Controller Scanner
//!
//! Enumerates NVMe controllers from the PCI tree in sysfs, whichever driver
//! they are bound to, and implements the storage provider port on top of
//! sysfs writes (driver rebind) and nvme-cli (health, format, firmware).

use super::nvme::{parse_nsid, NvmeCli, COMMIT_ACTIVATE_NOW};
use crate::domain::{FirmwareInfo, NvmeController, NvmeNamespace, StorageProvider};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// PCI class code of NVMe controllers
const NVME_CLASS_CODE: &str = "0x010802";

/// Driver reported for unbound controllers
const NO_DRIVER: &str = "none";

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Configuration for the sysfs storage provider
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
    /// Path to device nodes
    pub dev_path: PathBuf,
    /// nvme-cli executable
    pub nvme_cli: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            sysfs_path: PathBuf::from("/sys"),
            dev_path: PathBuf::from("/dev"),
            nvme_cli: "nvme".to_string(),
        }
    }
}

/// Controller found in sysfs together with its kernel name, if kernel-bound
#[derive(Debug, Clone)]
struct ScannedController {
    controller: NvmeController,
    kernel_name: Option<String>,
}

// =============================================================================
// Sysfs Storage Provider
// =============================================================================

/// Storage provider backed by sysfs and nvme-cli
#[derive(Debug, Clone)]
pub struct SysfsStorageProvider {
    config: ScannerConfig,
    cli: NvmeCli,
}

impl SysfsStorageProvider {
    pub fn new(config: ScannerConfig) -> Self {
        let cli = NvmeCli::new(config.nvme_cli.clone());
        Self { config, cli }
    }

    /// Create a provider with default configuration
    pub fn default_provider() -> Self {
        Self::new(ScannerConfig::default())
    }

    fn pci_devices(&self) -> PathBuf {
        self.config.sysfs_path.join("bus/pci/devices")
    }

    fn pci_device(&self, pci_address: &str) -> Result<PathBuf> {
        let path = self.pci_devices().join(pci_address);
        if path.exists() {
            Ok(path)
        } else {
            Err(Error::DeviceNotFound {
                device: pci_address.to_string(),
            })
        }
    }

    fn dev_node(&self, name: &str) -> String {
        self.config.dev_path.join(name).display().to_string()
    }

    /// Enumerate every NVMe-class PCI function, sorted by address
    fn scan_controllers(&self) -> Result<Vec<ScannedController>> {
        let devices = self.pci_devices();
        if !devices.exists() {
            debug!("No PCI sysfs path found at {:?}", devices);
            return Ok(Vec::new());
        }

        let mut controllers = Vec::new();
        for entry in fs::read_dir(&devices)? {
            let entry = entry?;
            match self.scan_controller(&entry.path()) {
                Ok(Some(scanned)) => controllers.push(scanned),
                Ok(None) => {}
                Err(e) => warn!("Skipping {:?}: {}", entry.path(), e),
            }
        }

        controllers.sort_by(|a, b| a.controller.pci_address.cmp(&b.controller.pci_address));
        Ok(controllers)
    }

    fn scan_controller(&self, pci_path: &Path) -> Result<Option<ScannedController>> {
        let class = read_attr(pci_path, "class")?;
        if class.trim() != NVME_CLASS_CODE {
            return Ok(None);
        }

        let pci_address = file_name(pci_path)?;
        let numa_node = read_attr(pci_path, "numa_node")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(-1);
        let driver = fs::read_link(pci_path.join("driver"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| NO_DRIVER.to_string());

        let kernel_name = kernel_controller(pci_path);
        let (model, serial, firmware_rev, namespaces) = match &kernel_name {
            Some(name) => {
                let ctrl_path = pci_path.join("nvme").join(name);
                (
                    read_attr(&ctrl_path, "model").unwrap_or_else(|_| "unknown".into()),
                    read_attr(&ctrl_path, "serial").unwrap_or_else(|_| "unknown".into()),
                    read_attr(&ctrl_path, "firmware_rev").unwrap_or_else(|_| "unknown".into()),
                    namespaces(&ctrl_path, name),
                )
            }
            // user-space drivers hide identify data from sysfs
            None => (
                "unknown".into(),
                "unknown".into(),
                "unknown".into(),
                Vec::new(),
            ),
        };

        Ok(Some(ScannedController {
            controller: NvmeController {
                pci_address,
                model: model.trim().to_string(),
                serial: serial.trim().to_string(),
                firmware_rev: firmware_rev.trim().to_string(),
                numa_node,
                driver,
                namespaces,
                health: None,
            },
            kernel_name,
        }))
    }

    fn find(&self, pci_address: &str) -> Result<ScannedController> {
        let path = self.pci_device(pci_address)?;
        self.scan_controller(&path)?
            .ok_or_else(|| Error::DeviceNotFound {
                device: pci_address.to_string(),
            })
    }

    /// Kernel controller name of a device; user-space bound devices are refused
    fn kernel_name(&self, scanned: &ScannedController) -> Result<String> {
        scanned.kernel_name.clone().ok_or_else(|| Error::DeviceFailure {
            device: scanned.controller.pci_address.clone(),
            reason: format!(
                "not bound to the kernel nvme driver (driver: {})",
                scanned.controller.driver
            ),
        })
    }
}

#[async_trait]
impl StorageProvider for SysfsStorageProvider {
    async fn scan(&self, include_health: bool) -> Result<Vec<NvmeController>> {
        let scanned = self.scan_controllers()?;
        info!("Found {} NVMe controllers", scanned.len());

        let mut controllers = Vec::with_capacity(scanned.len());
        for ScannedController {
            mut controller,
            kernel_name,
        } in scanned
        {
            if include_health {
                if let Some(name) = kernel_name {
                    match self.cli.smart_log(&self.dev_node(&name)).await {
                        Ok(health) => controller.health = Some(health),
                        Err(e) => warn!("SMART log unavailable for {}: {}", controller.pci_address, e),
                    }
                }
            }
            controllers.push(controller);
        }
        Ok(controllers)
    }

    async fn format(&self, pci_address: &str) -> Result<()> {
        let scanned = self.find(pci_address)?;
        let name = self.kernel_name(&scanned)?;

        if scanned.controller.namespaces.is_empty() {
            return Err(Error::DeviceFailure {
                device: pci_address.to_string(),
                reason: "controller has no namespaces".into(),
            });
        }

        for ns in &scanned.controller.namespaces {
            let node = self.dev_node(&format!("{}n{}", name, ns.id));
            self.cli.format(&node).await?;
        }
        info!("Formatted {} ({} namespaces)", pci_address, scanned.controller.namespaces.len());
        Ok(())
    }

    async fn rebind(&self, pci_address: &str, driver: &str) -> Result<()> {
        let device = self.pci_device(pci_address)?;
        let write = |path: PathBuf, value: &str| {
            fs::write(&path, value).map_err(|e| Error::DeviceFailure {
                device: pci_address.to_string(),
                reason: format!("write {}: {}", path.display(), e),
            })
        };

        if device.join("driver").exists() {
            write(device.join("driver/unbind"), pci_address)?;
        }
        write(device.join("driver_override"), driver)?;
        write(
            self.config.sysfs_path.join("bus/pci/drivers_probe"),
            pci_address,
        )?;

        info!("Rebound {} to {}", pci_address, driver);
        Ok(())
    }

    async fn firmware(&self, pci_address: &str) -> Result<FirmwareInfo> {
        let scanned = self.find(pci_address)?;
        let active_slot = match &scanned.kernel_name {
            Some(name) => self
                .cli
                .active_slot(&self.dev_node(name))
                .await
                .unwrap_or_else(|e| {
                    debug!("Firmware log unavailable for {}: {}", pci_address, e);
                    0
                }),
            None => 0,
        };

        Ok(FirmwareInfo {
            pci_address: scanned.controller.pci_address,
            model: scanned.controller.model,
            revision: scanned.controller.firmware_rev,
            active_slot,
        })
    }

    async fn update_firmware(&self, pci_address: &str, image: &Path) -> Result<FirmwareInfo> {
        let scanned = self.find(pci_address)?;
        let name = self.kernel_name(&scanned)?;

        if tokio::fs::metadata(image).await.is_err() {
            return Err(Error::DeviceFailure {
                device: pci_address.to_string(),
                reason: format!("firmware image {} not readable", image.display()),
            });
        }

        let node = self.dev_node(&name);
        self.cli.fw_download(&node, image).await?;
        self.cli.fw_commit(&node, 0, COMMIT_ACTIVATE_NOW).await?;
        info!("Updated firmware on {} from {}", pci_address, image.display());

        self.firmware(pci_address).await
    }
}

// =============================================================================
// Sysfs helpers
// =============================================================================

/// Read a sysfs attribute
fn read_attr(base_path: &Path, attr: &str) -> Result<String> {
    let path = base_path.join(attr);
    fs::read_to_string(&path).map_err(|e| {
        Error::HardwareDiscovery(format!("Failed to read {}: {}", path.display(), e))
    })
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::HardwareDiscovery("Invalid sysfs path".into()))
}

/// Name of the kernel controller (nvme0) under a PCI function, if bound
fn kernel_controller(pci_path: &Path) -> Option<String> {
    let mut names: Vec<String> = fs::read_dir(pci_path.join("nvme"))
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("nvme"))
        .collect();
    names.sort();
    names.into_iter().next()
}

/// Namespaces of a kernel controller; size is in 512-byte sectors
fn namespaces(ctrl_path: &Path, ctrl_name: &str) -> Vec<NvmeNamespace> {
    let Ok(entries) = fs::read_dir(ctrl_path) else {
        return Vec::new();
    };

    let mut namespaces: Vec<NvmeNamespace> = entries
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(ctrl_name) || name.contains('p') {
                return None;
            }
            let id = parse_nsid(&name)?;
            let sectors: u64 = read_attr(&entry.path(), "size").ok()?.trim().parse().ok()?;
            Some(NvmeNamespace {
                id,
                size_bytes: sectors * 512,
            })
        })
        .collect();
    namespaces.sort_by_key(|ns| ns.id);
    namespaces
}
