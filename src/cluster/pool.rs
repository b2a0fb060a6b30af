//! Pool service
//!
//! Leader-side pool metadata: membership of ranks in each pool, properties,
//! access control, containers and open client handles. The engines holding
//! the pool data are black boxes here.

use super::leader::LeaderResolver;
use crate::domain::{Rank, RankSet};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Layout version written by [`PoolService::upgrade`]
pub const POOL_LAYOUT_VERSION: u32 = 3;

// =============================================================================
// Pool Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolRankState {
    Up,
    /// Being emptied before exclusion
    Drain,
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AclEntry {
    /// `OWNER@`, `GROUP@`, `EVERYONE@` or a user/group name
    pub principal: String,
    /// Permission letters, e.g. `rw`
    pub permissions: String,
}

impl AclEntry {
    pub fn new(principal: impl Into<String>, permissions: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            permissions: permissions.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub uuid: Uuid,
    pub label: String,
    pub owner: String,
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub uuid: Uuid,
    pub label: String,
    pub owner: String,
    pub group: String,
    pub ranks: BTreeMap<Rank, PoolRankState>,
    pub props: BTreeMap<String, String>,
    pub acl: Vec<AclEntry>,
    pub containers: BTreeMap<Uuid, Container>,
    /// Machines holding open handles, with handle counts
    pub handles: BTreeMap<String, usize>,
    pub layout_version: u32,
    pub created_at: DateTime<Utc>,
}

impl Pool {
    fn ranks_in(&self, state: PoolRankState) -> RankSet {
        self.ranks
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(r, _)| *r)
            .collect()
    }

    fn summary(&self) -> PoolSummary {
        PoolSummary {
            uuid: self.uuid,
            label: self.label.clone(),
            up_ranks: self.ranks_in(PoolRankState::Up),
            draining_ranks: self.ranks_in(PoolRankState::Drain),
            excluded_ranks: self.ranks_in(PoolRankState::Excluded),
            containers: self.containers.len(),
            open_handles: self.handles.values().sum(),
            layout_version: self.layout_version,
        }
    }

    fn container_mut(&mut self, id: &str) -> Result<&mut Container> {
        let pool = self.label.clone();
        self.containers
            .values_mut()
            .find(|c| c.label == id || c.uuid.to_string() == id)
            .ok_or(Error::ContainerNotFound {
                pool,
                container: id.to_string(),
            })
    }
}

fn default_acl() -> Vec<AclEntry> {
    vec![AclEntry::new("OWNER@", "rw"), AclEntry::new("GROUP@", "r")]
}

// =============================================================================
// Requests and Responses
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCreateRequest {
    pub label: String,
    /// Ranks to place the pool on; empty means every ready rank
    #[serde(default)]
    pub ranks: RankSet,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
    #[serde(default)]
    pub acl: Vec<AclEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub uuid: Uuid,
    pub label: String,
    pub up_ranks: RankSet,
    pub draining_ranks: RankSet,
    pub excluded_ranks: RankSet,
    pub containers: usize,
    pub open_handles: usize,
    pub layout_version: u32,
}

/// Ranks argument of exclude, drain, reintegrate and extend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRanksRequest {
    pub ranks: RankSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDestroyRequest {
    /// Destroy even with open handles
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEvictRequest {
    /// Only this machine's handles; all handles when absent
    #[serde(default)]
    pub machine: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPropRequest {
    /// Property names; empty returns every property
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRequest {
    pub entries: Vec<AclEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAclRequest {
    pub principal: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCreateRequest {
    pub label: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContSetOwnerRequest {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub machine: String,
}

// =============================================================================
// Service
// =============================================================================

pub struct PoolService {
    pools: RwLock<BTreeMap<Uuid, Pool>>,
    leader: Arc<dyn LeaderResolver>,
}

impl PoolService {
    pub fn new(leader: Arc<dyn LeaderResolver>) -> Self {
        Self {
            pools: RwLock::new(BTreeMap::new()),
            leader,
        }
    }

    /// Look a pool up by label or uuid and apply `f` to it
    fn with_pool<T>(&self, id: &str, f: impl FnOnce(&mut Pool) -> Result<T>) -> Result<T> {
        self.leader.require_leader()?;
        let mut pools = self.pools.write();
        let pool = pools
            .values_mut()
            .find(|p| p.label == id || p.uuid.to_string() == id)
            .ok_or_else(|| Error::PoolNotFound {
                pool: id.to_string(),
            })?;
        f(pool)
    }

    /// Create a pool on ranks that are all ready.
    ///
    /// `ready` is the set of ranks currently reported ready by the system.
    pub fn create(&self, request: PoolCreateRequest, ready: &BTreeSet<Rank>) -> Result<PoolSummary> {
        self.leader.require_leader()?;
        if request.label.trim().is_empty() {
            return Err(Error::MissingParameter("label".into()));
        }

        let ranks: BTreeSet<Rank> = if request.ranks.is_empty() {
            ready.clone()
        } else {
            request.ranks.as_set().clone()
        };
        if ranks.is_empty() {
            return Err(Error::SystemRefused("no ready ranks to create pool on".into()));
        }
        let not_ready: RankSet = ranks.iter().filter(|r| !ready.contains(*r)).copied().collect();
        if !not_ready.is_empty() {
            return Err(Error::SystemRefused(format!(
                "ranks {} are not ready",
                not_ready
            )));
        }

        let mut pools = self.pools.write();
        if pools.values().any(|p| p.label == request.label) {
            return Err(Error::PoolExists {
                pool: request.label,
            });
        }

        let pool = Pool {
            uuid: Uuid::new_v4(),
            label: request.label,
            owner: request.owner.unwrap_or_else(|| "root".to_string()),
            group: request.group.unwrap_or_else(|| "root".to_string()),
            ranks: ranks.into_iter().map(|r| (r, PoolRankState::Up)).collect(),
            props: request.props,
            acl: if request.acl.is_empty() {
                default_acl()
            } else {
                request.acl
            },
            containers: BTreeMap::new(),
            handles: BTreeMap::new(),
            layout_version: POOL_LAYOUT_VERSION,
            created_at: Utc::now(),
        };
        let summary = pool.summary();
        pools.insert(pool.uuid, pool);

        info!(pool = %summary.label, uuid = %summary.uuid, ranks = %summary.up_ranks, "Pool created");
        Ok(summary)
    }

    pub fn destroy(&self, id: &str, request: &PoolDestroyRequest) -> Result<PoolSummary> {
        let summary = self.with_pool(id, |pool| {
            if pool.handles.values().sum::<usize>() > 0 && !request.force {
                return Err(Error::SystemRefused(format!(
                    "pool {} has open handles",
                    pool.label
                )));
            }
            Ok(pool.summary())
        })?;
        self.pools.write().remove(&summary.uuid);
        info!(pool = %summary.label, "Pool destroyed");
        Ok(summary)
    }

    /// Drop open handles; returns how many were evicted
    pub fn evict(&self, id: &str, request: &PoolEvictRequest) -> Result<usize> {
        self.with_pool(id, |pool| match &request.machine {
            Some(machine) => Ok(pool.handles.remove(machine).unwrap_or(0)),
            None => {
                let evicted = pool.handles.values().sum();
                pool.handles.clear();
                Ok(evicted)
            }
        })
    }

    fn set_rank_state(
        &self,
        id: &str,
        ranks: &RankSet,
        state: PoolRankState,
    ) -> Result<PoolSummary> {
        if ranks.is_empty() {
            return Err(Error::MissingParameter("ranks".into()));
        }
        self.with_pool(id, |pool| {
            let foreign: RankSet = ranks
                .iter()
                .filter(|r| !pool.ranks.contains_key(r))
                .collect();
            if !foreign.is_empty() {
                return Err(Error::InvalidRequest(format!(
                    "ranks {} are not in pool {}",
                    foreign, pool.label
                )));
            }
            for rank in ranks.iter() {
                pool.ranks.insert(rank, state);
            }
            Ok(pool.summary())
        })
    }

    pub fn exclude(&self, id: &str, request: &PoolRanksRequest) -> Result<PoolSummary> {
        self.set_rank_state(id, &request.ranks, PoolRankState::Excluded)
    }

    pub fn drain(&self, id: &str, request: &PoolRanksRequest) -> Result<PoolSummary> {
        self.set_rank_state(id, &request.ranks, PoolRankState::Drain)
    }

    pub fn reintegrate(&self, id: &str, request: &PoolRanksRequest) -> Result<PoolSummary> {
        self.set_rank_state(id, &request.ranks, PoolRankState::Up)
    }

    /// Add ranks to a pool; every new rank must be ready
    pub fn extend(
        &self,
        id: &str,
        request: &PoolRanksRequest,
        ready: &BTreeSet<Rank>,
    ) -> Result<PoolSummary> {
        if request.ranks.is_empty() {
            return Err(Error::MissingParameter("ranks".into()));
        }
        let not_ready: RankSet = request.ranks.iter().filter(|r| !ready.contains(r)).collect();
        if !not_ready.is_empty() {
            return Err(Error::SystemRefused(format!(
                "ranks {} are not ready",
                not_ready
            )));
        }
        self.with_pool(id, |pool| {
            for rank in request.ranks.iter() {
                pool.ranks.entry(rank).or_insert(PoolRankState::Up);
            }
            Ok(pool.summary())
        })
    }

    pub fn query(&self, id: &str) -> Result<PoolSummary> {
        self.with_pool(id, |pool| Ok(pool.summary()))
    }

    pub fn list_pools(&self) -> Result<Vec<PoolSummary>> {
        self.leader.require_leader()?;
        let mut pools: Vec<PoolSummary> = self.pools.read().values().map(Pool::summary).collect();
        pools.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(pools)
    }

    pub fn set_prop(&self, id: &str, props: BTreeMap<String, String>) -> Result<()> {
        if props.is_empty() {
            return Err(Error::MissingParameter("props".into()));
        }
        if props.contains_key("label") {
            return Err(Error::InvalidRequest("label cannot be changed".into()));
        }
        self.with_pool(id, |pool| {
            pool.props.extend(props);
            Ok(())
        })
    }

    pub fn get_prop(&self, id: &str, request: &GetPropRequest) -> Result<BTreeMap<String, String>> {
        self.with_pool(id, |pool| {
            let mut props = pool.props.clone();
            props.insert("label".to_string(), pool.label.clone());
            if !request.names.is_empty() {
                props.retain(|name, _| request.names.contains(name));
            }
            Ok(props)
        })
    }

    pub fn get_acl(&self, id: &str) -> Result<Vec<AclEntry>> {
        self.with_pool(id, |pool| Ok(pool.acl.clone()))
    }

    /// Replace the whole ACL
    pub fn overwrite_acl(&self, id: &str, request: AclRequest) -> Result<Vec<AclEntry>> {
        self.with_pool(id, |pool| {
            pool.acl = request.entries;
            pool.acl.sort();
            Ok(pool.acl.clone())
        })
    }

    /// Add entries, replacing those with the same principal
    pub fn update_acl(&self, id: &str, request: AclRequest) -> Result<Vec<AclEntry>> {
        if request.entries.is_empty() {
            return Err(Error::MissingParameter("entries".into()));
        }
        self.with_pool(id, |pool| {
            for entry in request.entries {
                pool.acl.retain(|e| e.principal != entry.principal);
                pool.acl.push(entry);
            }
            pool.acl.sort();
            Ok(pool.acl.clone())
        })
    }

    pub fn delete_acl(&self, id: &str, request: &DeleteAclRequest) -> Result<Vec<AclEntry>> {
        self.with_pool(id, |pool| {
            let before = pool.acl.len();
            pool.acl.retain(|e| e.principal != request.principal);
            if pool.acl.len() == before {
                return Err(Error::InvalidRequest(format!(
                    "no ACL entry for {}",
                    request.principal
                )));
            }
            Ok(pool.acl.clone())
        })
    }

    /// Bring the pool layout to the current version; returns the version
    pub fn upgrade(&self, id: &str) -> Result<u32> {
        self.with_pool(id, |pool| {
            if pool.layout_version < POOL_LAYOUT_VERSION {
                info!(pool = %pool.label, from = pool.layout_version, to = POOL_LAYOUT_VERSION, "Pool upgraded");
                pool.layout_version = POOL_LAYOUT_VERSION;
            }
            Ok(pool.layout_version)
        })
    }

    pub fn create_container(&self, id: &str, request: ContainerCreateRequest) -> Result<Container> {
        if request.label.trim().is_empty() {
            return Err(Error::MissingParameter("label".into()));
        }
        self.with_pool(id, |pool| {
            if pool.containers.values().any(|c| c.label == request.label) {
                return Err(Error::InvalidRequest(format!(
                    "container {} already exists",
                    request.label
                )));
            }
            let container = Container {
                uuid: Uuid::new_v4(),
                label: request.label,
                owner: request.owner.unwrap_or_else(|| pool.owner.clone()),
                group: request.group.unwrap_or_else(|| pool.group.clone()),
            };
            pool.containers.insert(container.uuid, container.clone());
            Ok(container)
        })
    }

    pub fn list_containers(&self, id: &str) -> Result<Vec<Container>> {
        self.with_pool(id, |pool| {
            let mut containers: Vec<Container> = pool.containers.values().cloned().collect();
            containers.sort_by(|a, b| a.label.cmp(&b.label));
            Ok(containers)
        })
    }

    pub fn cont_set_owner(
        &self,
        id: &str,
        container: &str,
        request: ContSetOwnerRequest,
    ) -> Result<Container> {
        if request.owner.is_none() && request.group.is_none() {
            return Err(Error::MissingParameter("owner or group".into()));
        }
        self.with_pool(id, |pool| {
            let cont = pool.container_mut(container)?;
            if let Some(owner) = request.owner {
                cont.owner = owner;
            }
            if let Some(group) = request.group {
                cont.group = group;
            }
            Ok(cont.clone())
        })
    }

    /// Record an open handle from `machine`
    pub fn connect(&self, id: &str, request: &ConnectRequest) -> Result<PoolSummary> {
        if request.machine.trim().is_empty() {
            return Err(Error::MissingParameter("machine".into()));
        }
        self.with_pool(id, |pool| {
            *pool.handles.entry(request.machine.clone()).or_insert(0) += 1;
            Ok(pool.summary())
        })
    }

    /// Evict `machine`'s handles from every pool; returns evicted counts by pool label
    pub fn cleanup(&self, machine: &str) -> Result<BTreeMap<String, usize>> {
        self.leader.require_leader()?;
        let mut evicted = BTreeMap::new();
        for pool in self.pools.write().values_mut() {
            if let Some(count) = pool.handles.remove(machine) {
                evicted.insert(pool.label.clone(), count);
            }
        }
        Ok(evicted)
    }

    /// Forget every pool, after the storage under them was erased
    pub fn clear(&self) -> usize {
        let mut pools = self.pools.write();
        let count = pools.len();
        pools.clear();
        count
    }
}
