//! Server Metadata (SMD) device table
//!
//! Tracks role, health and LED state of every device assigned to a local
//! rank. Readers take an `Arc` snapshot of the whole table and never wait on
//! writers; writers copy the table, change one device and swap it in, while a
//! per-device lock keeps two manage requests off the same device.

use super::deadline;
use crate::domain::{FailureKind, FanoutResult, Outcome, Rank, RankSet};
use crate::error::{Error, Result};
use crate::fanout::{Dispatcher, KeyedLocks};
use crate::metrics;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

// =============================================================================
// Device Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Added but not yet in use
    #[default]
    New,
    Normal,
    Faulty,
    /// Removed from its slot
    Unplugged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    Data,
    Meta,
    Wal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LedState {
    #[default]
    Off,
    Identify,
    Fault,
}

/// One row of the SMD table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmdDevice {
    pub uuid: Uuid,
    /// PCI address of the controller
    pub address: String,
    /// Owning rank
    pub rank: Rank,
    pub roles: BTreeSet<DeviceRole>,
    pub state: DeviceState,
    pub led: LedState,
    pub updated_at: DateTime<Utc>,
}

impl SmdDevice {
    pub fn new(address: impl Into<String>, rank: Rank) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            address: address.into(),
            rank,
            roles: BTreeSet::from([DeviceRole::Data]),
            state: DeviceState::New,
            led: LedState::Off,
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Select rows of the table; empty filters select everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmdQueryRequest {
    #[serde(default)]
    pub ranks: RankSet,
    #[serde(default)]
    pub uuids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DeviceState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmdQueryResponse {
    pub devices: Vec<SmdDevice>,
}

/// Change applied to each target device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SmdAction {
    SetFaulty,
    /// Replace a faulty device with a new one in the same role
    Replace {
        new_uuid: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_address: Option<String>,
    },
    SetRoles {
        roles: BTreeSet<DeviceRole>,
    },
    LedIdentify,
    LedReset,
}

impl SmdAction {
    pub fn name(&self) -> &'static str {
        match self {
            SmdAction::SetFaulty => "set_faulty",
            SmdAction::Replace { .. } => "replace",
            SmdAction::SetRoles { .. } => "set_roles",
            SmdAction::LedIdentify => "led_identify",
            SmdAction::LedReset => "led_reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmdManageRequest {
    pub devices: Vec<Uuid>,
    #[serde(flatten)]
    pub action: SmdAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

// =============================================================================
// Table
// =============================================================================

type Table = BTreeMap<Uuid, SmdDevice>;

/// Copy-on-write device table
#[derive(Debug, Default)]
pub struct SmdTable {
    inner: RwLock<Arc<Table>>,
}

impl SmdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current table; later writes do not affect the returned snapshot
    pub fn snapshot(&self) -> Arc<Table> {
        self.inner.read().clone()
    }

    pub fn get(&self, uuid: &Uuid) -> Option<SmdDevice> {
        self.inner.read().get(uuid).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Apply `f` to a private copy and publish it only if `f` succeeds
    pub fn modify<T>(&self, f: impl FnOnce(&mut Table) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.write();
        let mut table = Table::clone(&guard);
        let out = f(&mut table)?;
        *guard = Arc::new(table);
        Ok(out)
    }

    pub fn insert(&self, device: SmdDevice) -> Result<()> {
        self.modify(|table| {
            if table.contains_key(&device.uuid) {
                return Err(Error::DeviceFailure {
                    device: device.uuid.to_string(),
                    reason: "uuid already in the SMD table".into(),
                });
            }
            table.insert(device.uuid, device);
            Ok(())
        })
    }
}

// =============================================================================
// SMD Manager
// =============================================================================

/// Query and manage the SMD table
pub struct SmdManager {
    table: Arc<SmdTable>,
    dispatcher: Dispatcher<Uuid>,
    deadline: Duration,
}

impl SmdManager {
    pub fn new(table: Arc<SmdTable>, deadline: Duration) -> Self {
        Self {
            table,
            dispatcher: Dispatcher::new("smd", Arc::new(KeyedLocks::new()), FailureKind::DeviceFailure),
            deadline,
        }
    }

    pub fn table(&self) -> &Arc<SmdTable> {
        &self.table
    }

    /// Rows matching the request, ascending by uuid
    pub fn query(&self, request: &SmdQueryRequest) -> SmdQueryResponse {
        let snapshot = self.table.snapshot();
        let uuids: BTreeSet<&Uuid> = request.uuids.iter().collect();

        let devices = snapshot
            .values()
            .filter(|d| request.ranks.is_empty() || request.ranks.contains(d.rank))
            .filter(|d| uuids.is_empty() || uuids.contains(&d.uuid))
            .filter(|d| request.state.map_or(true, |s| d.state == s))
            .cloned()
            .collect();
        SmdQueryResponse { devices }
    }

    /// Apply an action to each requested device
    pub async fn manage(&self, request: SmdManageRequest) -> Result<FanoutResult<Uuid, SmdDevice>> {
        validate(&request)?;
        let deadline = deadline(request.timeout_ms, self.deadline)?;

        let snapshot = self.table.snapshot();
        let requested: BTreeSet<Uuid> = request.devices.iter().copied().collect();
        let mut results = BTreeMap::new();
        let mut targets = Vec::new();
        for uuid in requested {
            if snapshot.contains_key(&uuid) {
                targets.push(uuid);
            } else {
                let err = Error::DeviceNotFound {
                    device: uuid.to_string(),
                };
                results.insert(uuid, Outcome::from_error(&err));
            }
        }

        let table = self.table.clone();
        let action = request.action.clone();
        let dispatched = self
            .dispatcher
            .run(targets, deadline, move |uuid| {
                let table = table.clone();
                let action = action.clone();
                async move { table.modify(|t| apply(t, uuid, &action)) }
            })
            .await;
        results.extend(dispatched);

        metrics::FANOUT_CALLS
            .with_label_values(&["smd", request.action.name()])
            .inc();
        let result = FanoutResult::from_map(results);
        info!(
            action = request.action.name(),
            devices = result.len(),
            failed = result.failed_targets().len(),
            "SMD manage complete"
        );
        Ok(result)
    }
}

fn validate(request: &SmdManageRequest) -> Result<()> {
    if request.devices.is_empty() {
        return Err(Error::MissingParameter("devices".into()));
    }
    match &request.action {
        SmdAction::SetRoles { roles } if roles.is_empty() => {
            Err(Error::MissingParameter("roles".into()))
        }
        SmdAction::Replace { .. } if request.devices.len() != 1 => Err(Error::InvalidRequest(
            "replace takes exactly one device".into(),
        )),
        _ => Ok(()),
    }
}

fn apply(table: &mut Table, uuid: Uuid, action: &SmdAction) -> Result<SmdDevice> {
    let device_error = |reason: &str| Error::DeviceFailure {
        device: uuid.to_string(),
        reason: reason.to_string(),
    };
    let device = table.get_mut(&uuid).ok_or_else(|| Error::DeviceNotFound {
        device: uuid.to_string(),
    })?;
    let now = Utc::now();

    match action {
        SmdAction::SetFaulty => {
            device.state = DeviceState::Faulty;
            device.led = LedState::Fault;
        }
        SmdAction::SetRoles { roles } => {
            if device.state == DeviceState::Faulty {
                return Err(device_error("cannot change roles of a faulty device"));
            }
            device.roles = roles.clone();
        }
        SmdAction::LedIdentify => device.led = LedState::Identify,
        SmdAction::LedReset => {
            device.led = if device.state == DeviceState::Faulty {
                LedState::Fault
            } else {
                LedState::Off
            };
        }
        SmdAction::Replace {
            new_uuid,
            new_address,
        } => {
            if device.state != DeviceState::Faulty {
                return Err(device_error("only faulty devices can be replaced"));
            }
            let old = device.clone();
            if table.contains_key(new_uuid) {
                return Err(device_error("replacement uuid already in the SMD table"));
            }

            let replacement = SmdDevice {
                uuid: *new_uuid,
                address: new_address.clone().unwrap_or(old.address),
                rank: old.rank,
                roles: old.roles,
                state: DeviceState::Normal,
                led: LedState::Off,
                updated_at: now,
            };
            table.remove(&uuid);
            table.insert(*new_uuid, replacement.clone());
            return Ok(replacement);
        }
    }

    device.updated_at = now;
    Ok(device.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn manager_with(devices: &[(&str, u32)]) -> (SmdManager, Vec<Uuid>) {
        let table = Arc::new(SmdTable::new());
        let mut uuids = Vec::new();
        for (address, rank) in devices {
            let mut device = SmdDevice::new(*address, Rank(*rank));
            device.state = DeviceState::Normal;
            uuids.push(device.uuid);
            table.insert(device).unwrap();
        }
        (SmdManager::new(table, Duration::from_secs(1)), uuids)
    }

    fn manage(devices: Vec<Uuid>, action: SmdAction) -> SmdManageRequest {
        SmdManageRequest {
            devices,
            action,
            timeout_ms: None,
        }
    }

    #[test]
    fn test_query_filters_and_is_repeatable() {
        let (manager, _) = manager_with(&[("0000:81:00.0", 0), ("0000:82:00.0", 1)]);

        let all = manager.query(&SmdQueryRequest::default());
        assert_eq!(all.devices.len(), 2);
        assert_eq!(manager.query(&SmdQueryRequest::default()), all);

        let rank1 = manager.query(&SmdQueryRequest {
            ranks: "1".parse().unwrap(),
            ..Default::default()
        });
        assert_eq!(rank1.devices.len(), 1);
        assert_eq!(rank1.devices[0].address, "0000:82:00.0");
    }

    #[tokio::test]
    async fn test_set_faulty_and_led_reset() {
        let (manager, uuids) = manager_with(&[("0000:81:00.0", 0)]);
        let result = manager
            .manage(manage(uuids.clone(), SmdAction::SetFaulty))
            .await
            .unwrap();
        let device = result.get(&uuids[0]).unwrap().payload().unwrap();
        assert_eq!(device.state, DeviceState::Faulty);
        assert_eq!(device.led, LedState::Fault);

        manager
            .manage(manage(uuids.clone(), SmdAction::LedIdentify))
            .await
            .unwrap();
        manager
            .manage(manage(uuids.clone(), SmdAction::LedReset))
            .await
            .unwrap();
        assert_eq!(manager.table().get(&uuids[0]).unwrap().led, LedState::Fault);
    }

    #[tokio::test]
    async fn test_replace_requires_faulty() {
        let (manager, uuids) = manager_with(&[("0000:81:00.0", 0)]);
        let new_uuid = Uuid::new_v4();
        let replace = SmdAction::Replace {
            new_uuid,
            new_address: None,
        };

        let result = manager
            .manage(manage(uuids.clone(), replace.clone()))
            .await
            .unwrap();
        assert_eq!(
            result.get(&uuids[0]).unwrap().failure_kind(),
            Some(FailureKind::DeviceFailure)
        );

        manager
            .manage(manage(uuids.clone(), SmdAction::SetFaulty))
            .await
            .unwrap();
        let result = manager.manage(manage(uuids.clone(), replace)).await.unwrap();
        assert!(result.all_succeeded());
        assert!(manager.table().get(&uuids[0]).is_none());
        let replacement = manager.table().get(&new_uuid).unwrap();
        assert_eq!(replacement.state, DeviceState::Normal);
        assert_eq!(replacement.address, "0000:81:00.0");
    }

    #[tokio::test]
    async fn test_unknown_device_and_malformed_requests() {
        let (manager, _) = manager_with(&[("0000:81:00.0", 0)]);
        let stranger = Uuid::new_v4();
        let result = manager
            .manage(manage(vec![stranger], SmdAction::LedIdentify))
            .await
            .unwrap();
        assert_eq!(
            result.get(&stranger).unwrap().failure_kind(),
            Some(FailureKind::NotFound)
        );

        assert_matches!(
            manager.manage(manage(vec![], SmdAction::SetFaulty)).await,
            Err(Error::MissingParameter(_))
        );
        assert_matches!(
            manager
                .manage(manage(
                    vec![stranger],
                    SmdAction::SetRoles {
                        roles: BTreeSet::new()
                    }
                ))
                .await,
            Err(Error::MissingParameter(_))
        );
    }

    #[test]
    fn test_snapshot_is_isolated_from_writes() {
        let (manager, uuids) = manager_with(&[("0000:81:00.0", 0)]);
        let before = manager.table().snapshot();
        manager
            .table()
            .modify(|t| apply(t, uuids[0], &SmdAction::SetFaulty))
            .unwrap();
        assert_eq!(before[&uuids[0]].state, DeviceState::Normal);
        assert_eq!(manager.table().get(&uuids[0]).unwrap().state, DeviceState::Faulty);
    }
}
