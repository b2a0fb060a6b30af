//! Engine Handle
//!
//! Drives one engine process through its lifecycle. Each operation is
//! validated against the transition table, bounded by the engine operation
//! timeout and recorded in the rank registry. A failed operation leaves the
//! rank `Errored` but addressable, so it can be restarted or reformatted.

use super::registry::RankRegistry;
use crate::domain::{EngineProcessRef, EngineState, LogMasks, Rank, Transition};
use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Timeouts applied by an engine handle
#[derive(Debug, Clone)]
pub struct HandleConfig {
    /// Upper bound for any single engine operation
    pub operation_timeout: Duration,
    /// How long a graceful stop may take before it counts as failed
    pub stop_grace: Duration,
    /// First delay between health checks while starting
    pub health_poll_initial: Duration,
    /// Largest delay between health checks while starting
    pub health_poll_max: Duration,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            health_poll_initial: Duration::from_millis(250),
            health_poll_max: Duration::from_secs(2),
        }
    }
}

/// Lifecycle driver for one rank
pub struct EngineHandle {
    rank: Rank,
    process: EngineProcessRef,
    registry: Arc<RankRegistry>,
    config: HandleConfig,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("rank", &self.rank)
            .field("config", &self.config)
            .finish()
    }
}

impl EngineHandle {
    /// Create a handle for an engine whose rank is already registered
    pub fn new(process: EngineProcessRef, registry: Arc<RankRegistry>, config: HandleConfig) -> Self {
        Self {
            rank: process.rank(),
            process,
            registry,
            config,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn process(&self) -> &EngineProcessRef {
        &self.process
    }

    /// Registry state of this rank
    pub fn state(&self) -> Result<EngineState> {
        self.registry.state(self.rank)
    }

    /// Run `fut` within the operation timeout
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        match tokio::time::timeout(self.config.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: format!("{} on rank {}", operation, self.rank),
                elapsed: started.elapsed(),
            }),
        }
    }

    /// Record a failed operation and hand the error back
    fn fail(&self, operation: &str, err: Error) -> Error {
        warn!(rank = %self.rank, %operation, error = %err, "Engine operation failed");
        if let Err(e) = self.registry.mark_errored(self.rank, err.to_string()) {
            warn!(rank = %self.rank, error = %e, "Failed to record engine error");
        }
        err
    }

    /// Launch the engine and wait for it to pass its health check
    pub async fn start(&self) -> Result<EngineState> {
        let current = self.registry.state(self.rank)?;
        if current.is_noop(Transition::Start) {
            debug!(rank = %self.rank, "Engine already running");
            return Ok(current);
        }

        self.registry.transition(self.rank, Transition::Start)?;
        info!(rank = %self.rank, "Starting engine");

        let launched = self
            .bounded("start", async {
                self.process.start().await?;
                self.wait_healthy().await
            })
            .await;

        match launched {
            Ok(()) => self
                .registry
                .transition(self.rank, Transition::HealthCheckPassed),
            Err(e) => Err(self.fail("start", e)),
        }
    }

    async fn wait_healthy(&self) -> Result<()> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.health_poll_initial)
            .with_max_interval(self.config.health_poll_max)
            .with_max_elapsed_time(None)
            .build();
        let rank = self.rank;
        let process = &self.process;

        backoff::future::retry(policy, move || async move {
            match process.health_check().await {
                Ok(true) => Ok(()),
                Ok(false) => Err(backoff::Error::transient(Error::EngineFailure {
                    rank,
                    reason: "health check not passing yet".to_string(),
                })),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    /// Prepare the engine for shutdown
    pub async fn prep_shutdown(&self) -> Result<EngineState> {
        self.registry.check(self.rank, Transition::PrepShutdown)?;

        match self
            .bounded("prep_shutdown", self.process.prep_shutdown())
            .await
        {
            Ok(()) => self.registry.transition(self.rank, Transition::PrepShutdown),
            Err(e) => Err(self.fail("prep_shutdown", e)),
        }
    }

    /// Stop the engine.
    ///
    /// A forced stop escalates to a kill when the graceful stop fails, and
    /// succeeds as long as the process is gone afterwards.
    pub async fn stop(&self, force: bool) -> Result<EngineState> {
        let transition = Transition::Stop { force };
        let current = self.registry.state(self.rank)?;
        self.registry.check(self.rank, transition)?;

        if current == EngineState::Stopped && !self.process.is_running().await {
            return Ok(current);
        }

        let graceful = self
            .bounded("stop", self.process.stop(self.config.stop_grace))
            .await;

        let stopped = match graceful {
            Ok(()) => Ok(()),
            Err(e) if force => {
                warn!(rank = %self.rank, error = %e, "Graceful stop failed, killing engine");
                let _ = self.bounded("kill", self.process.kill()).await;
                if self.process.is_running().await {
                    Err(e)
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        };

        match stopped {
            Ok(()) => {
                info!(rank = %self.rank, force, "Engine stopped");
                self.registry.transition(self.rank, transition)
            }
            Err(e) => Err(self.fail("stop", e)),
        }
    }

    /// Clear the engine's formatted flag
    pub async fn reset_format(&self) -> Result<EngineState> {
        self.registry.check(self.rank, Transition::ResetFormat)?;

        match self
            .bounded("reset_format", self.process.reset_format())
            .await
        {
            Ok(()) => self.registry.transition(self.rank, Transition::ResetFormat),
            Err(e) => Err(self.fail("reset_format", e)),
        }
    }

    /// Ask the engine for its state and reconcile the registry with the answer
    pub async fn query(&self) -> Result<EngineState> {
        match self.bounded("query", self.process.query_state()).await {
            Ok(observed) => {
                self.registry.set_state(self.rank, observed)?;
                Ok(observed)
            }
            Err(e) => Err(self.fail("query", e)),
        }
    }

    /// Adjust log verbosity; the lifecycle state is left alone
    pub async fn set_log_masks(&self, masks: &LogMasks) -> Result<EngineState> {
        self.bounded("set_log_masks", self.process.set_log_masks(masks))
            .await?;
        debug!(rank = %self.rank, masks = %masks.masks, "Log masks applied");
        self.registry.state(self.rank)
    }

    /// Tail the engine log
    pub async fn collect_log(&self, max_lines: usize) -> Result<String> {
        self.bounded("collect_log", self.process.collect_log(max_lines))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EngineProcess;
    use crate::engine::mock::MockEngine;
    use assert_matches::assert_matches;

    fn fast_config() -> HandleConfig {
        HandleConfig {
            operation_timeout: Duration::from_millis(500),
            stop_grace: Duration::from_millis(50),
            health_poll_initial: Duration::from_millis(5),
            health_poll_max: Duration::from_millis(20),
        }
    }

    fn handle_for(engine: Arc<MockEngine>) -> (EngineHandle, Arc<RankRegistry>) {
        let registry = RankRegistry::new();
        registry.register(engine.rank()).unwrap();
        let handle = EngineHandle::new(engine, registry.clone(), fast_config());
        (handle, registry)
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let engine = Arc::new(MockEngine::new(Rank(0)).healthy_after(2));
        let (handle, registry) = handle_for(engine.clone());

        assert_eq!(handle.start().await.unwrap(), EngineState::Ready);
        assert_eq!(handle.prep_shutdown().await.unwrap(), EngineState::Stopping);
        assert_eq!(handle.stop(false).await.unwrap(), EngineState::Stopped);
        assert_eq!(handle.reset_format().await.unwrap(), EngineState::Unknown);
        assert_eq!(registry.state(Rank(0)).unwrap(), EngineState::Unknown);
        assert!(engine.calls("health_check") >= 3);
    }

    #[tokio::test]
    async fn test_invalid_transition_does_not_dispatch() {
        let engine = Arc::new(MockEngine::new(Rank(1)));
        let (handle, registry) = handle_for(engine.clone());

        assert_matches!(
            handle.prep_shutdown().await,
            Err(Error::InvalidTransition { .. })
        );
        assert_eq!(engine.calls("prep_shutdown"), 0);
        assert_eq!(registry.state(Rank(1)).unwrap(), EngineState::Unknown);
    }

    #[tokio::test]
    async fn test_start_failure_marks_errored_and_restart_recovers() {
        let engine = Arc::new(MockEngine::new(Rank(2)));
        engine.fail_on("start", "binary missing");
        let (handle, registry) = handle_for(engine.clone());

        assert_matches!(handle.start().await, Err(Error::EngineFailure { .. }));
        assert_eq!(registry.state(Rank(2)).unwrap(), EngineState::Errored);

        engine.clear_failures();
        assert_eq!(handle.start().await.unwrap(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_operation_timeout_marks_errored() {
        let engine = Arc::new(MockEngine::new(Rank(3)));
        let (handle, registry) = handle_for(engine.clone());
        handle.start().await.unwrap();

        engine.delay("prep_shutdown", Duration::from_secs(5));
        assert_matches!(handle.prep_shutdown().await, Err(Error::Timeout { .. }));
        assert_eq!(registry.state(Rank(3)).unwrap(), EngineState::Errored);
    }

    #[tokio::test]
    async fn test_forced_stop_escalates_to_kill() {
        let engine = Arc::new(MockEngine::new(Rank(4)));
        let (handle, registry) = handle_for(engine.clone());
        handle.start().await.unwrap();

        engine.fail_on("stop", "engine ignored SIGTERM");
        assert_matches!(handle.stop(false).await, Err(Error::InvalidTransition { .. }));

        assert_eq!(handle.stop(true).await.unwrap(), EngineState::Stopped);
        assert_eq!(engine.calls("kill"), 1);
        assert!(!engine.is_running().await);
        assert_eq!(registry.state(Rank(4)).unwrap(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_start_is_noop_when_ready() {
        let engine = Arc::new(MockEngine::new(Rank(5)));
        let (handle, _registry) = handle_for(engine.clone());
        handle.start().await.unwrap();
        handle.start().await.unwrap();
        assert_eq!(engine.calls("start"), 1);
    }

    #[tokio::test]
    async fn test_query_reconciles_registry() {
        let engine = Arc::new(MockEngine::new(Rank(6)));
        let (handle, registry) = handle_for(engine.clone());
        handle.start().await.unwrap();

        engine.crash();
        assert_eq!(handle.query().await.unwrap(), EngineState::Errored);
        assert_eq!(registry.state(Rank(6)).unwrap(), EngineState::Errored);
    }

    #[tokio::test]
    async fn test_log_operations_leave_state_alone() {
        let engine = Arc::new(MockEngine::new(Rank(7)));
        let (handle, _registry) = handle_for(engine.clone());
        handle.start().await.unwrap();

        let masks = LogMasks {
            masks: "ERR,mgmt=DEBUG".into(),
            streams: None,
            subsystems: None,
        };
        assert_eq!(handle.set_log_masks(&masks).await.unwrap(), EngineState::Ready);
        assert_eq!(engine.current_masks().as_deref(), Some("ERR,mgmt=DEBUG"));

        let log = handle.collect_log(1).await.unwrap();
        assert_eq!(log.lines().count(), 1);
    }
}
