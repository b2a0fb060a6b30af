//! Fabric Interface Discovery
//!
//! Lists network interfaces backed by a physical device together with their
//! NUMA node and the fabric providers usable over them.

use crate::domain::{FabricInterface, FabricScanner};
use crate::error::Result;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Providers available over any physical interface
const TCP_PROVIDERS: &[&str] = &["ofi+tcp", "ofi+tcp;ofi_rxm"];

/// Additional providers when the interface sits on an RDMA device
const VERBS_PROVIDERS: &[&str] = &["ofi+verbs;ofi_rxm", "ucx+rc_v", "ucx+dc_x"];

/// Fabric scanner backed by `/sys/class/net`
#[derive(Debug, Clone)]
pub struct SysfsFabricScanner {
    sysfs_path: PathBuf,
}

impl Default for SysfsFabricScanner {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsFabricScanner {
    pub fn new(sysfs_path: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_path: sysfs_path.into(),
        }
    }

    fn interface(&self, path: &Path, name: String) -> Option<FabricInterface> {
        let device = path.join("device");
        // virtual interfaces have no backing device
        if !device.exists() {
            return None;
        }

        let numa_node = fs::read_to_string(device.join("numa_node"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(-1);

        let rdma_device = fs::read_dir(device.join("infiniband"))
            .ok()
            .and_then(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .min()
            });

        let mut providers: Vec<String> = TCP_PROVIDERS.iter().map(|p| p.to_string()).collect();
        if rdma_device.is_some() {
            providers.extend(VERBS_PROVIDERS.iter().map(|p| p.to_string()));
        }

        Some(FabricInterface {
            device: rdma_device.unwrap_or_else(|| name.clone()),
            interface: name,
            providers,
            numa_node,
        })
    }
}

#[async_trait]
impl FabricScanner for SysfsFabricScanner {
    async fn scan(&self, provider: Option<&str>) -> Result<Vec<FabricInterface>> {
        let net = self.sysfs_path.join("class/net");
        if !net.exists() {
            debug!("No network sysfs path found at {:?}", net);
            return Ok(Vec::new());
        }

        let mut interfaces = Vec::new();
        for entry in fs::read_dir(&net)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "lo" {
                continue;
            }
            if let Some(iface) = self.interface(&entry.path(), name) {
                interfaces.push(iface);
            }
        }

        if let Some(provider) = provider {
            interfaces.retain(|i| i.providers.iter().any(|p| p == provider));
        }
        interfaces.sort();
        Ok(interfaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn add_interface(root: &Path, name: &str, numa: i32, rdma: Option<&str>) {
        let device = root.join("class/net").join(name).join("device");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("numa_node"), format!("{}\n", numa)).unwrap();
        if let Some(rdma) = rdma {
            fs::create_dir_all(device.join("infiniband").join(rdma)).unwrap();
        }
    }

    fn fixture() -> (TempDir, SysfsFabricScanner) {
        let dir = TempDir::new().unwrap();
        add_interface(dir.path(), "ib0", 0, Some("mlx5_0"));
        add_interface(dir.path(), "eth0", 1, None);
        fs::create_dir_all(dir.path().join("class/net/lo")).unwrap();
        fs::create_dir_all(dir.path().join("class/net/docker0")).unwrap();
        let scanner = SysfsFabricScanner::new(dir.path());
        (dir, scanner)
    }

    #[tokio::test]
    async fn test_scan_physical_interfaces() {
        let (_dir, scanner) = fixture();
        let interfaces = scanner.scan(None).await.unwrap();

        let names: Vec<&str> = interfaces.iter().map(|i| i.interface.as_str()).collect();
        assert_eq!(names, vec!["eth0", "ib0"]);
        assert_eq!(interfaces[1].device, "mlx5_0");
        assert_eq!(interfaces[1].numa_node, 0);
    }

    #[tokio::test]
    async fn test_provider_filter() {
        let (_dir, scanner) = fixture();
        let verbs = scanner.scan(Some("ofi+verbs;ofi_rxm")).await.unwrap();
        assert_eq!(verbs.len(), 1);
        assert_eq!(verbs[0].interface, "ib0");

        let none = scanner.scan(Some("ofi+psm2")).await.unwrap();
        assert!(none.is_empty());
    }
}
