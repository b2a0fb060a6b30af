//! nvme-cli wrapper
//!
//! Device operations that sysfs cannot express (SMART log, format, firmware
//! download and commit) go through nvme-cli with JSON output where it has one.

use crate::domain::HealthStats;
use crate::error::{Error, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Firmware commit action: replace the image in the slot and activate it now
pub const COMMIT_ACTIVATE_NOW: u8 = 3;

/// Runs nvme-cli commands
#[derive(Debug, Clone)]
pub struct NvmeCli {
    binary: String,
}

impl Default for NvmeCli {
    fn default() -> Self {
        Self::new("nvme")
    }
}

impl NvmeCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a command and return its stdout
    async fn run(&self, command: &str, args: &[&str]) -> Result<Vec<u8>> {
        debug!(binary = %self.binary, %command, ?args, "Running nvme-cli");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::NvmeCommand {
                command: command.into(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::NvmeCommand {
                command: command.into(),
                reason: stderr.trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    async fn run_json(&self, command: &str, args: &[&str]) -> Result<serde_json::Value> {
        let stdout = self.run(command, args).await?;
        serde_json::from_slice(&stdout).map_err(|e| Error::NvmeCommand {
            command: command.into(),
            reason: format!("JSON parse error: {}", e),
        })
    }

    /// Health counters of a controller, e.g. `/dev/nvme0`
    pub async fn smart_log(&self, controller: &str) -> Result<HealthStats> {
        let json = self
            .run_json("smart-log", &["smart-log", controller, "-o", "json"])
            .await?;
        Ok(parse_smart_log(&json))
    }

    /// Active firmware slot of a controller
    pub async fn active_slot(&self, controller: &str) -> Result<u8> {
        let json = self
            .run_json("fw-log", &["fw-log", controller, "-o", "json"])
            .await?;
        Ok(parse_active_slot(&json))
    }

    /// Low-level format of one namespace, e.g. `/dev/nvme0n1`
    pub async fn format(&self, namespace: &str) -> Result<()> {
        self.run("format", &["format", namespace, "--force"])
            .await
            .map(|_| ())
    }

    /// Transfer a firmware image to the controller
    pub async fn fw_download(&self, controller: &str, image: &Path) -> Result<()> {
        let fw = format!("--fw={}", image.display());
        self.run("fw-download", &["fw-download", controller, &fw])
            .await
            .map(|_| ())
    }

    /// Commit a downloaded image to `slot` using `action`
    pub async fn fw_commit(&self, controller: &str, slot: u8, action: u8) -> Result<()> {
        let slot = format!("--slot={}", slot);
        let action = format!("--action={}", action);
        self.run("fw-commit", &["fw-commit", controller, &slot, &action])
            .await
            .map(|_| ())
    }
}

/// Parse `nvme smart-log -o json`; temperature is reported in Kelvin
pub fn parse_smart_log(json: &serde_json::Value) -> HealthStats {
    HealthStats {
        temperature_celsius: (json["temperature"].as_i64().unwrap_or(273) - 273) as i32,
        percentage_used: json["percent_used"].as_u64().unwrap_or(0) as u8,
        data_units_read: json["data_units_read"].as_u64().unwrap_or(0),
        data_units_written: json["data_units_written"].as_u64().unwrap_or(0),
        power_on_hours: json["power_on_hours"].as_u64().unwrap_or(0),
        media_errors: json["media_errors"].as_u64().unwrap_or(0),
        critical_warning: json["critical_warning"].as_u64().unwrap_or(0) as u8,
    }
}

/// Parse `nvme fw-log -o json`; the active slot is the low three bits of `afi`
pub fn parse_active_slot(json: &serde_json::Value) -> u8 {
    // fw-log output is keyed by device name
    let log = json
        .as_object()
        .and_then(|map| map.values().find(|v| v.is_object()))
        .unwrap_or(json);
    (log["Active Firmware Slot (afi)"]
        .as_u64()
        .or_else(|| log["afi"].as_u64())
        .unwrap_or(0)
        & 0x7) as u8
}

/// Parse the namespace id from a namespace name (nvme0n1 -> 1)
pub fn parse_nsid(name: &str) -> Option<u32> {
    let name = name.strip_prefix("/dev/").unwrap_or(name);
    let rest = name.strip_prefix("nvme")?;
    let idx = rest.find('n')?;
    rest[idx + 1..].split('p').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_nsid() {
        assert_eq!(parse_nsid("nvme0n1"), Some(1));
        assert_eq!(parse_nsid("nvme0n2"), Some(2));
        assert_eq!(parse_nsid("/dev/nvme1n1"), Some(1));
        assert_eq!(parse_nsid("nvme0n1p1"), Some(1));
        assert_eq!(parse_nsid("nvme0"), None);
        assert_eq!(parse_nsid("sda"), None);
    }

    #[test]
    fn test_parse_smart_log() {
        let json = json!({
            "critical_warning": 0,
            "temperature": 310,
            "percent_used": 3,
            "data_units_read": 1000,
            "data_units_written": 2000,
            "power_on_hours": 42,
            "media_errors": 1
        });
        let stats = parse_smart_log(&json);
        assert_eq!(stats.temperature_celsius, 37);
        assert_eq!(stats.percentage_used, 3);
        assert_eq!(stats.media_errors, 1);
    }

    #[test]
    fn test_parse_active_slot() {
        let keyed = json!({ "nvme0": { "Active Firmware Slot (afi)": 0x12 } });
        assert_eq!(parse_active_slot(&keyed), 2);

        let flat = json!({ "afi": 1 });
        assert_eq!(parse_active_slot(&flat), 1);
    }

    #[tokio::test]
    async fn test_missing_binary_is_command_error() {
        let cli = NvmeCli::new("/nonexistent/nvme");
        let err = cli.smart_log("/dev/nvme0").await.unwrap_err();
        assert!(matches!(err, Error::NvmeCommand { .. }));
    }
}
