//! Firmware subsystem manager
//!
//! Queries and updates controller firmware. Model and revision filters
//! narrow the target set before anything is dispatched, so a filtered-out
//! controller never appears in the result.

use super::{deadline, resolve_devices, DestructiveFlags, DeviceFanoutResult};
use crate::domain::{FanoutResult, FirmwareInfo, NvmeController, StorageProviderRef};
use crate::error::{Error, Result};
use crate::fanout::Dispatcher;
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareQueryRequest {
    #[serde(default)]
    pub devices: Vec<String>,
    /// Only controllers of this model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Only controllers currently running this revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareUpdateRequest {
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(flatten)]
    pub flags: DestructiveFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

pub struct FirmwareManager {
    provider: StorageProviderRef,
    dispatcher: Dispatcher<String>,
    deadline: Duration,
}

impl FirmwareManager {
    pub fn new(provider: StorageProviderRef, dispatcher: Dispatcher<String>, deadline: Duration) -> Self {
        Self {
            provider,
            dispatcher,
            deadline,
        }
    }

    /// Inventory after applying the model and revision filters
    async fn inventory(
        &self,
        model: Option<&str>,
        revision: Option<&str>,
    ) -> Result<BTreeSet<String>> {
        let controllers = self.provider.scan(false).await?;
        Ok(controllers
            .into_iter()
            .filter(|c| matches_filters(c, model, revision))
            .map(|c| c.pci_address)
            .collect())
    }

    pub async fn query(
        &self,
        request: FirmwareQueryRequest,
    ) -> Result<DeviceFanoutResult<FirmwareInfo>> {
        let deadline = deadline(request.timeout_ms, self.deadline)?;
        let inventory = self
            .inventory(request.model.as_deref(), request.revision.as_deref())
            .await?;
        let (targets, mut results) = resolve_devices(&request.devices, &inventory)?;

        let provider = self.provider.clone();
        let dispatched = self
            .dispatcher
            .run(targets, deadline, move |device| {
                let provider = provider.clone();
                async move { provider.firmware(&device).await }
            })
            .await;
        results.extend(dispatched);

        metrics::FANOUT_CALLS
            .with_label_values(&["firmware", "query"])
            .inc();
        Ok(FanoutResult::from_map(results))
    }

    pub async fn update(
        &self,
        request: FirmwareUpdateRequest,
    ) -> Result<DeviceFanoutResult<FirmwareInfo>> {
        let image = request
            .image_path
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| Error::MissingParameter("image_path".into()))?;
        request.flags.require("firmware update")?;
        let deadline = deadline(request.timeout_ms, self.deadline)?;

        let inventory = self
            .inventory(request.model.as_deref(), request.revision.as_deref())
            .await?;
        let (targets, mut results) = resolve_devices(&request.devices, &inventory)?;

        let provider = self.provider.clone();
        let image = Arc::new(image);
        let dry_run = request.flags.dry_run;
        let dispatched = self
            .dispatcher
            .run(targets, deadline, move |device| {
                let provider = provider.clone();
                let image = image.clone();
                async move {
                    if dry_run {
                        provider.firmware(&device).await
                    } else {
                        provider.update_firmware(&device, &image).await
                    }
                }
            })
            .await;
        results.extend(dispatched);

        metrics::FANOUT_CALLS
            .with_label_values(&["firmware", "update"])
            .inc();
        let result = FanoutResult::from_map(results);
        info!(
            devices = result.len(),
            failed = result.failed_targets().len(),
            dry_run,
            "Firmware update complete"
        );
        Ok(result)
    }
}

fn matches_filters(controller: &NvmeController, model: Option<&str>, revision: Option<&str>) -> bool {
    model.map_or(true, |m| controller.model == m)
        && revision.map_or(true, |r| controller.firmware_rev == r)
}
