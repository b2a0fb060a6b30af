//! Network subsystem manager

use crate::domain::{FabricInterface, FabricScannerRef};
use crate::error::Result;
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkScanRequest {
    /// Only interfaces supporting this fabric provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkScanResponse {
    pub interfaces: Vec<FabricInterface>,
    /// Distinct NUMA nodes among the returned interfaces
    pub numa_nodes: usize,
}

pub struct NetworkManager {
    scanner: FabricScannerRef,
}

impl NetworkManager {
    pub fn new(scanner: FabricScannerRef) -> Self {
        Self { scanner }
    }

    pub async fn scan(&self, request: &NetworkScanRequest) -> Result<NetworkScanResponse> {
        let provider = request.provider.as_deref().filter(|p| !p.is_empty());
        let mut interfaces = self.scanner.scan(provider).await?;
        interfaces.sort();
        let numa_nodes = interfaces
            .iter()
            .map(|i| i.numa_node)
            .collect::<BTreeSet<_>>()
            .len();

        metrics::FANOUT_CALLS
            .with_label_values(&["network", "scan"])
            .inc();
        Ok(NetworkScanResponse {
            interfaces,
            numa_nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::StaticFabricScanner;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_scan_counts_numa_nodes() {
        let manager = NetworkManager::new(Arc::new(StaticFabricScanner::sample()));
        let response = manager.scan(&NetworkScanRequest::default()).await.unwrap();
        assert_eq!(response.interfaces.len(), 2);
        assert_eq!(response.numa_nodes, 2);

        let again = manager.scan(&NetworkScanRequest::default()).await.unwrap();
        assert_eq!(response, again);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_empty() {
        let manager = NetworkManager::new(Arc::new(StaticFabricScanner::sample()));
        let response = manager
            .scan(&NetworkScanRequest {
                provider: Some("ofi+psm2".into()),
            })
            .await
            .unwrap();
        assert!(response.interfaces.is_empty());
        assert_eq!(response.numa_nodes, 0);
    }
}
