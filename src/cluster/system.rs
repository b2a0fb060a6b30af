//! System service
//!
//! Cluster-wide rank operations run by the leader. Each call groups the
//! requested ranks by owning host, relays one rank fanout per host through
//! the aggregator and merges the answers into one rank result.

use super::aggregator::{merge_ranks, with_unknown_ranks, HostAggregator};
use super::leader::{LeaderInfo, LeaderResolver};
use super::membership::{JoinRequest, JoinResponse, Membership};
use super::pool::{PoolCreateRequest, PoolRanksRequest, PoolService, PoolSummary};
use super::transport::HostRequest;
use crate::domain::{
    EngineState, FailureKind, FanoutRequest, FanoutResult, Outcome, Rank, RankFanoutResult,
    RankOp, RankSet,
};
use crate::error::{Error, Result};
use crate::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemQueryRequest {
    #[serde(default)]
    pub ranks: RankSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStopRequest {
    #[serde(default)]
    pub ranks: RankSet,
    /// Stop ranks whose shutdown preparation failed, escalating to kill
    #[serde(default)]
    pub force: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStartRequest {
    #[serde(default)]
    pub ranks: RankSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCleanupRequest {
    pub machine: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCleanupResponse {
    /// Evicted handle count by pool label
    pub pools: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEraseResponse {
    pub ranks: RankFanoutResult,
    pub pools_removed: usize,
}

/// Event raised by a host about one of its engines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    EngineDied {
        rank: Rank,
        host: String,
        reason: String,
    },
}

/// Rank location handed to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankUri {
    pub rank: Rank,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachInfo {
    pub leader: String,
    pub ranks: Vec<RankUri>,
}

/// Where a host sends its cluster events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: ClusterEvent) -> Result<()>;
}

pub struct SystemService {
    membership: Arc<Membership>,
    aggregator: HostAggregator,
    leader: Arc<dyn LeaderResolver>,
    pools: Arc<PoolService>,
}

impl SystemService {
    pub fn new(
        membership: Arc<Membership>,
        aggregator: HostAggregator,
        leader: Arc<dyn LeaderResolver>,
    ) -> Self {
        let pools = Arc::new(PoolService::new(leader.clone()));
        Self {
            membership,
            aggregator,
            leader,
            pools,
        }
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn pools(&self) -> &Arc<PoolService> {
        &self.pools
    }

    pub fn leader(&self) -> LeaderInfo {
        self.leader.info()
    }

    /// Relay `op` to the hosts owning `ranks` and merge the results
    async fn rank_fanout(
        &self,
        ranks: &RankSet,
        op: RankOp,
        force: bool,
        timeout_ms: Option<u64>,
    ) -> RankFanoutResult {
        let groups = self.membership.group(ranks);
        let requests = groups
            .by_host
            .iter()
            .map(|(host, ranks)| {
                let request = FanoutRequest {
                    ranks: ranks.clone(),
                    op: op.clone(),
                    force,
                    timeout_ms,
                };
                (host.clone(), HostRequest::Ranks(request))
            })
            .collect();

        metrics::FANOUT_CALLS
            .with_label_values(&["cluster", op.name()])
            .inc();
        let aggregate = self.aggregator.cluster_fanout(requests).await;
        let result = with_unknown_ranks(merge_ranks(aggregate, &groups.by_host), groups.unknown);

        for target in &result.results {
            if let Some(report) = target.outcome.payload() {
                self.membership.record_state(target.target, report.state);
            }
        }
        result
    }

    pub async fn query(&self, request: &SystemQueryRequest) -> Result<RankFanoutResult> {
        self.leader.require_leader()?;
        Ok(self
            .rank_fanout(&request.ranks, RankOp::Query, false, None)
            .await)
    }

    /// Ranks currently reporting `Ready`
    async fn ready_ranks(&self) -> Result<BTreeSet<Rank>> {
        let result = self.query(&SystemQueryRequest::default()).await?;
        Ok(result
            .results
            .iter()
            .filter(|r| matches!(r.outcome.payload(), Some(report) if report.state == EngineState::Ready))
            .map(|r| r.target)
            .collect())
    }

    /// Two-phase stop: prepare every rank for shutdown, then stop those that
    /// prepared. A forced stop also stops ranks whose preparation failed.
    pub async fn stop(&self, request: SystemStopRequest) -> Result<RankFanoutResult> {
        self.leader.require_leader()?;

        let prep = self
            .rank_fanout(&request.ranks, RankOp::PrepShutdown, false, request.timeout_ms)
            .await;

        let mut results = BTreeMap::new();
        let mut to_stop = RankSet::new();
        for (rank, outcome) in prep.into_map() {
            let proceed = match outcome.failure_kind() {
                None => true,
                // already stopped or errored; the stop phase decides
                Some(FailureKind::InvalidState) => true,
                Some(FailureKind::NotFound) => false,
                Some(_) => request.force,
            };
            if proceed {
                to_stop.insert(rank);
            } else {
                results.insert(rank, outcome);
            }
        }

        if !to_stop.is_empty() {
            let stopped = self
                .rank_fanout(&to_stop, RankOp::Stop, request.force, request.timeout_ms)
                .await;
            results.extend(stopped.into_map());
        }

        let result = FanoutResult::from_map(results);
        info!(
            ranks = result.len(),
            failed = result.failed_targets().len(),
            force = request.force,
            "System stop complete"
        );
        Ok(result)
    }

    pub async fn start(&self, request: SystemStartRequest) -> Result<RankFanoutResult> {
        self.leader.require_leader()?;
        Ok(self
            .rank_fanout(&request.ranks, RankOp::Start, false, request.timeout_ms)
            .await)
    }

    /// Reset every rank's format and forget all pools.
    ///
    /// Refused unless every rank answers and none is running.
    pub async fn erase(&self) -> Result<SystemEraseResponse> {
        self.leader.require_leader()?;
        let query = self
            .rank_fanout(&RankSet::new(), RankOp::Query, false, None)
            .await;

        let mut blocking = Vec::new();
        for target in &query.results {
            match &target.outcome {
                Outcome::Success {
                    payload: Some(report),
                } if !report.state.is_running() => {}
                Outcome::Success { payload: Some(report) } => {
                    blocking.push(format!("{} is {}", target.target, report.state))
                }
                Outcome::Success { payload: None } => {
                    blocking.push(format!("{} state unknown", target.target))
                }
                Outcome::Failure { kind, .. } => {
                    blocking.push(format!("{} {}", target.target, kind))
                }
            }
        }
        if !blocking.is_empty() {
            return Err(Error::SystemRefused(format!(
                "all ranks must be stopped before erase: {}",
                blocking.join(", ")
            )));
        }

        let ranks = self
            .rank_fanout(&RankSet::new(), RankOp::ResetFormat, false, None)
            .await;
        let pools_removed = self.pools.clear();
        warn!(ranks = ranks.len(), pools_removed, "System erased");
        Ok(SystemEraseResponse {
            ranks,
            pools_removed,
        })
    }

    pub fn cleanup(&self, request: &SystemCleanupRequest) -> Result<SystemCleanupResponse> {
        if request.machine.trim().is_empty() {
            return Err(Error::MissingParameter("machine".into()));
        }
        let pools = self.pools.cleanup(&request.machine)?;
        info!(machine = %request.machine, pools = pools.len(), "System cleanup");
        Ok(SystemCleanupResponse { pools })
    }

    pub fn join(&self, request: JoinRequest) -> Result<JoinResponse> {
        self.leader.require_leader()?;
        self.membership.join(request)
    }

    pub fn event(&self, event: ClusterEvent) -> Result<()> {
        self.leader.require_leader()?;
        match event {
            ClusterEvent::EngineDied { rank, host, reason } => {
                match self.membership.host_of(rank) {
                    Some(owner) if owner == host => {}
                    _ => {
                        return Err(Error::InvalidRequest(format!(
                            "rank {} does not belong to host {}",
                            rank, host
                        )))
                    }
                }
                warn!(%rank, %host, %reason, "Engine died");
                self.membership.record_state(rank, EngineState::Errored);
            }
        }
        Ok(())
    }

    pub fn attach_info(&self) -> Result<AttachInfo> {
        self.leader.require_leader()?;
        let ranks = self
            .membership
            .hosts()
            .into_iter()
            .flat_map(|m| {
                let host = m.host;
                m.ranks
                    .iter()
                    .map(|rank| {
                        let uri = RankUri {
                            rank,
                            host: host.clone(),
                        };
                        (rank, uri)
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<BTreeMap<Rank, RankUri>>()
            .into_values()
            .collect();
        Ok(AttachInfo {
            leader: self.leader.info().leader,
            ranks,
        })
    }

    /// Create a pool on ranks reported ready by a fresh system query
    pub async fn create_pool(&self, request: PoolCreateRequest) -> Result<PoolSummary> {
        let ready = self.ready_ranks().await?;
        self.pools.create(request, &ready)
    }

    pub async fn extend_pool(&self, id: &str, request: &PoolRanksRequest) -> Result<PoolSummary> {
        let ready = self.ready_ranks().await?;
        self.pools.extend(id, request, &ready)
    }
}

#[async_trait]
impl EventSink for SystemService {
    async fn send(&self, event: ClusterEvent) -> Result<()> {
        self.event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::leader::StaticLeader;
    use crate::cluster::transport::{HostEndpoint, HostResponse, LocalTransport};
    use crate::domain::RankReport;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Host whose ranks hold a fixed state and accept every operation
    struct FakeHost {
        states: Mutex<BTreeMap<Rank, EngineState>>,
    }

    impl FakeHost {
        fn new(ranks: &[u32], state: EngineState) -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(ranks.iter().map(|r| (Rank(*r), state)).collect()),
            })
        }
    }

    #[async_trait]
    impl HostEndpoint for FakeHost {
        async fn handle(&self, request: HostRequest) -> Result<HostResponse> {
            let HostRequest::Ranks(request) = request else {
                return Err(Error::InvalidRequest("ranks only".into()));
            };
            let mut states = self.states.lock();
            let map = request
                .ranks
                .iter()
                .map(|rank| {
                    let state = states.entry(rank).or_default();
                    *state = match request.op {
                        RankOp::PrepShutdown => EngineState::Stopping,
                        RankOp::Stop => EngineState::Stopped,
                        RankOp::Start => EngineState::Ready,
                        RankOp::ResetFormat => EngineState::Unknown,
                        _ => *state,
                    };
                    (rank, Outcome::success(RankReport::new(*state)))
                })
                .collect();
            Ok(HostResponse::Ranks(FanoutResult::from_map(map)))
        }
    }

    fn system(hosts: &[(&str, Arc<FakeHost>, &str)]) -> SystemService {
        let transport = Arc::new(LocalTransport::new());
        let membership = Arc::new(Membership::new());
        for (host, endpoint, ranks) in hosts {
            transport.register(*host, endpoint.clone());
            membership
                .join(JoinRequest {
                    host: host.to_string(),
                    ranks: ranks.parse().unwrap(),
                })
                .unwrap();
        }
        SystemService::new(
            membership,
            HostAggregator::new(transport, Duration::from_secs(1)),
            Arc::new(StaticLeader::solo("a")),
        )
    }

    #[tokio::test]
    async fn test_query_spans_hosts() {
        let system = system(&[
            ("a", FakeHost::new(&[0, 1], EngineState::Ready), "0-1"),
            ("b", FakeHost::new(&[2], EngineState::Stopped), "2"),
        ]);
        let request = SystemQueryRequest {
            ranks: "0-2,5".parse().unwrap(),
        };
        let result = system.query(&request).await.unwrap();

        assert_eq!(result.len(), 4);
        assert_eq!(
            result.get(&Rank(5)).unwrap().failure_kind(),
            Some(FailureKind::NotFound)
        );
        assert_eq!(system.membership().last_state(Rank(2)), Some(EngineState::Stopped));
    }

    #[tokio::test]
    async fn test_stop_then_start() {
        let system = system(&[("a", FakeHost::new(&[0, 1], EngineState::Ready), "0-1")]);
        let stopped = system.stop(SystemStopRequest::default()).await.unwrap();
        assert!(stopped.all_succeeded());
        assert_eq!(
            stopped.get(&Rank(0)).unwrap().payload().unwrap().state,
            EngineState::Stopped
        );

        let started = system.start(SystemStartRequest::default()).await.unwrap();
        assert!(started.all_succeeded());
    }

    #[tokio::test]
    async fn test_erase_refused_while_running() {
        let system = system(&[("a", FakeHost::new(&[0], EngineState::Ready), "0")]);
        assert_matches!(system.erase().await, Err(Error::SystemRefused(_)));

        system.stop(SystemStopRequest::default()).await.unwrap();
        let erased = system.erase().await.unwrap();
        assert!(erased.ranks.all_succeeded());
    }

    #[tokio::test]
    async fn test_create_pool_on_ready_ranks() {
        let system = system(&[
            ("a", FakeHost::new(&[0], EngineState::Ready), "0"),
            ("b", FakeHost::new(&[1], EngineState::Stopped), "1"),
        ]);
        let pool = system
            .create_pool(PoolCreateRequest {
                label: "tank".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pool.up_ranks, "0".parse().unwrap());

        let extend = PoolRanksRequest {
            ranks: "1".parse().unwrap(),
        };
        assert_matches!(
            system.extend_pool("tank", &extend).await,
            Err(Error::SystemRefused(_))
        );
    }

    #[tokio::test]
    async fn test_engine_died_event() {
        let system = system(&[("a", FakeHost::new(&[0], EngineState::Ready), "0")]);
        let died = ClusterEvent::EngineDied {
            rank: Rank(0),
            host: "a".into(),
            reason: "exit status 139".into(),
        };
        system.send(died).await.unwrap();
        assert_eq!(system.membership().last_state(Rank(0)), Some(EngineState::Errored));

        let wrong_host = ClusterEvent::EngineDied {
            rank: Rank(0),
            host: "b".into(),
            reason: "".into(),
        };
        assert_matches!(system.event(wrong_host), Err(Error::InvalidRequest(_)));
    }

    #[test]
    fn test_attach_info_lists_ranks() {
        let system = system(&[
            ("a", FakeHost::new(&[0], EngineState::Ready), "0"),
            ("b", FakeHost::new(&[1], EngineState::Ready), "1"),
        ]);
        let info = system.attach_info().unwrap();
        assert_eq!(info.leader, "a");
        assert_eq!(info.ranks.len(), 2);
        assert_eq!(info.ranks[1].host, "b");
    }
}
