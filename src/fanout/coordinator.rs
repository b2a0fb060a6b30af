//! Rank Fanout Coordinator
//!
//! Turns one request into concurrent per-rank engine operations and folds
//! the outcomes into a single response with exactly one entry per requested
//! rank, in ascending rank order.

use super::dispatch::Dispatcher;
use super::locks::KeyedLocks;
use crate::domain::{
    EngineProcessRef, FailureKind, FanoutRequest, FanoutResult, Outcome, Rank, RankFanoutResult,
    RankOp, RankReport,
};
use crate::engine::{EngineHandle, HandleConfig, RankRegistry};
use crate::error::{Error, Result};
use crate::metrics;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline for a fanout call when the request carries none
    pub fanout_timeout: Duration,
    /// Timeouts of the engine handles created by the coordinator
    pub handle: HandleConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fanout_timeout: Duration::from_secs(10),
            handle: HandleConfig::default(),
        }
    }
}

/// Fans rank operations out to local engines
pub struct RankCoordinator {
    registry: Arc<RankRegistry>,
    handles: RwLock<BTreeMap<Rank, Arc<EngineHandle>>>,
    dispatcher: Dispatcher<Rank>,
    config: CoordinatorConfig,
}

impl std::fmt::Debug for RankCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankCoordinator")
            .field("ranks", &self.handles.read().len())
            .field("config", &self.config)
            .finish()
    }
}

impl RankCoordinator {
    pub fn new(registry: Arc<RankRegistry>, config: CoordinatorConfig) -> Self {
        Self {
            registry,
            handles: RwLock::new(BTreeMap::new()),
            dispatcher: Dispatcher::new(
                "ranks",
                Arc::new(KeyedLocks::new()),
                FailureKind::EngineFailure,
            ),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<RankRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Register an engine's rank and create its handle
    pub fn add_engine(&self, process: EngineProcessRef) -> Result<Arc<EngineHandle>> {
        let rank = process.rank();
        self.registry.register(rank)?;

        let handle = Arc::new(EngineHandle::new(
            process,
            self.registry.clone(),
            self.config.handle.clone(),
        ));
        self.handles.write().insert(rank, handle.clone());
        info!(%rank, "Engine added");
        Ok(handle)
    }

    pub fn handle(&self, rank: Rank) -> Option<Arc<EngineHandle>> {
        self.handles.read().get(&rank).cloned()
    }

    /// True while an operation holds the rank
    pub fn is_busy(&self, rank: Rank) -> bool {
        self.dispatcher.locks().is_locked(&rank)
    }

    /// Fan `request` out to its target ranks.
    ///
    /// Fails as a whole only for malformed requests. Every requested rank
    /// gets exactly one outcome; an empty rank set targets every known rank.
    pub async fn fanout(&self, request: FanoutRequest) -> Result<RankFanoutResult> {
        validate(&request)?;
        let started = Instant::now();

        let requested: BTreeSet<Rank> = if request.ranks.is_empty() {
            self.registry.known_ranks()
        } else {
            request.ranks.as_set().clone()
        };

        let mut results: BTreeMap<Rank, Outcome<RankReport>> = BTreeMap::new();
        let mut handles = BTreeMap::new();
        {
            let registered = self.handles.read();
            for rank in &requested {
                match registered.get(rank) {
                    Some(handle) if self.registry.contains(*rank) => {
                        handles.insert(*rank, handle.clone());
                    }
                    _ => {
                        let err = Error::RankNotFound { rank: *rank };
                        results.insert(*rank, Outcome::from_error(&err));
                    }
                }
            }
        }

        let deadline = request.timeout().unwrap_or(self.config.fanout_timeout);
        let targets: Vec<Rank> = handles.keys().copied().collect();
        let op = request.op.clone();
        let force = request.force;

        let dispatched = self
            .dispatcher
            .run(targets, deadline, move |rank| {
                let handle = handles.get(&rank).cloned();
                let op = op.clone();
                async move {
                    match handle {
                        Some(handle) => run_op(&handle, op, force).await,
                        None => Err(Error::RankNotFound { rank }),
                    }
                }
            })
            .await;
        results.extend(dispatched);

        let result = FanoutResult::from_map(results);
        metrics::FANOUT_CALLS
            .with_label_values(&["ranks", request.op.name()])
            .inc();
        metrics::FANOUT_DURATION
            .with_label_values(&["ranks"])
            .observe(started.elapsed().as_secs_f64());
        metrics::RANKS_READY.set(self.registry.stats().ready_ranks as i64);

        info!(
            op = %request.op,
            ranks = result.len(),
            failed = result.failed_targets().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rank fanout complete"
        );
        Ok(result)
    }
}

/// Reject requests that cannot be dispatched at all
fn validate(request: &FanoutRequest) -> Result<()> {
    if request.timeout_ms == Some(0) {
        return Err(Error::InvalidRequest("timeout must be positive".into()));
    }

    match &request.op {
        RankOp::SetLogMasks(masks) if masks.masks.trim().is_empty() => {
            Err(Error::MissingParameter("masks".into()))
        }
        RankOp::CollectLog { max_lines: 0 } => Err(Error::InvalidRequest(
            "max_lines must be at least 1".into(),
        )),
        _ => Ok(()),
    }
}

async fn run_op(handle: &EngineHandle, op: RankOp, force: bool) -> Result<RankReport> {
    let report = match op {
        RankOp::Start => RankReport::new(handle.start().await?),
        RankOp::PrepShutdown => RankReport::new(handle.prep_shutdown().await?),
        RankOp::Stop => RankReport::new(handle.stop(force).await?),
        RankOp::ResetFormat => RankReport::new(handle.reset_format().await?),
        RankOp::Query => RankReport::new(handle.query().await?),
        RankOp::SetLogMasks(masks) => {
            RankReport::new(handle.set_log_masks(&masks).await?).with_detail(masks.masks)
        }
        RankOp::CollectLog { max_lines } => {
            let log = handle.collect_log(max_lines).await?;
            RankReport::new(handle.state()?).with_detail(log)
        }
    };
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EngineState, LogMasks, RankSet};
    use crate::engine::MockEngine;
    use assert_matches::assert_matches;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            fanout_timeout: Duration::from_secs(2),
            handle: HandleConfig {
                operation_timeout: Duration::from_secs(1),
                stop_grace: Duration::from_millis(50),
                health_poll_initial: Duration::from_millis(5),
                health_poll_max: Duration::from_millis(20),
            },
        }
    }

    fn coordinator_with(ranks: &[u32]) -> (RankCoordinator, Vec<Arc<MockEngine>>) {
        let coordinator = RankCoordinator::new(RankRegistry::new(), fast_config());
        let engines: Vec<Arc<MockEngine>> = ranks
            .iter()
            .map(|&r| Arc::new(MockEngine::new(r)))
            .collect();
        for engine in &engines {
            coordinator.add_engine(engine.clone()).unwrap();
        }
        (coordinator, engines)
    }

    fn ranks(s: &str) -> RankSet {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_empty_rank_set_targets_all_known() {
        let (coordinator, _) = coordinator_with(&[0, 1, 2]);
        let result = coordinator
            .fanout(FanoutRequest::all(RankOp::Start))
            .await
            .unwrap();

        assert_eq!(result.len(), 3);
        assert!(result.all_succeeded());
        for entry in &result.results {
            assert_eq!(entry.outcome.payload().unwrap().state, EngineState::Ready);
        }
    }

    #[tokio::test]
    async fn test_unknown_ranks_are_not_found() {
        let (coordinator, _) = coordinator_with(&[0, 1]);
        let result = coordinator
            .fanout(FanoutRequest::new(ranks("1,5"), RankOp::Query))
            .await
            .unwrap();

        assert!(result.covers_exactly(&ranks("1,5").into_set()));
        assert!(result.get(&Rank(1)).unwrap().is_success());
        assert_eq!(
            result.get(&Rank(5)).unwrap().failure_kind(),
            Some(FailureKind::NotFound)
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_reported_per_rank() {
        let (coordinator, engines) = coordinator_with(&[0, 1]);
        coordinator
            .fanout(FanoutRequest::new(ranks("0"), RankOp::Start))
            .await
            .unwrap();

        let result = coordinator
            .fanout(FanoutRequest::all(RankOp::PrepShutdown))
            .await
            .unwrap();
        assert!(result.get(&Rank(0)).unwrap().is_success());
        assert_eq!(
            result.get(&Rank(1)).unwrap().failure_kind(),
            Some(FailureKind::InvalidState)
        );
        assert_eq!(engines[1].calls("prep_shutdown"), 0);
    }

    #[tokio::test]
    async fn test_malformed_requests_fail_whole_call() {
        let (coordinator, _) = coordinator_with(&[0]);
        let masks = LogMasks {
            masks: "  ".into(),
            streams: None,
            subsystems: None,
        };
        assert_matches!(
            coordinator
                .fanout(FanoutRequest::all(RankOp::SetLogMasks(masks)))
                .await,
            Err(Error::MissingParameter(_))
        );
        assert_matches!(
            coordinator
                .fanout(FanoutRequest::all(RankOp::CollectLog { max_lines: 0 }))
                .await,
            Err(Error::InvalidRequest(_))
        );
    }

    #[tokio::test]
    async fn test_set_log_masks_and_collect_log() {
        let (coordinator, engines) = coordinator_with(&[0, 1]);
        coordinator
            .fanout(FanoutRequest::all(RankOp::Start))
            .await
            .unwrap();

        let masks = LogMasks {
            masks: "DEBUG".into(),
            streams: Some("io".into()),
            subsystems: None,
        };
        let result = coordinator
            .fanout(FanoutRequest::all(RankOp::SetLogMasks(masks)))
            .await
            .unwrap();
        assert!(result.all_succeeded());
        assert_eq!(engines[0].current_masks().as_deref(), Some("DEBUG"));

        let result = coordinator
            .fanout(FanoutRequest::new(
                ranks("1"),
                RankOp::CollectLog { max_lines: 5 },
            ))
            .await
            .unwrap();
        let report = result.get(&Rank(1)).unwrap().payload().unwrap();
        assert!(report.detail.as_deref().unwrap().contains("log masks set to DEBUG"));
    }
}
