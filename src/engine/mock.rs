//! Scripted in-memory engine
//!
//! Stands in for a real engine process in simulation mode and in tests.
//! Operations can be delayed or made to fail per operation name, which is
//! how slow, stuck and crashing engines are reproduced.

use crate::domain::{EngineProcess, EngineState, LogMasks, Rank};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug)]
struct MockState {
    running: bool,
    crashed: bool,
    started_once: bool,
    formatted: bool,
    health_polls: u32,
    masks: Option<String>,
    log: Vec<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            running: false,
            crashed: false,
            started_once: false,
            formatted: true,
            health_polls: 0,
            masks: None,
            log: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct MockScript {
    failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
}

/// In-memory engine with scripted behaviour
#[derive(Debug)]
pub struct MockEngine {
    rank: Rank,
    healthy_after: u32,
    state: Mutex<MockState>,
    script: Mutex<MockScript>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockEngine {
    pub fn new(rank: impl Into<Rank>) -> Self {
        Self {
            rank: rank.into(),
            healthy_after: 0,
            state: Mutex::new(MockState::default()),
            script: Mutex::new(MockScript::default()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Number of health polls that report "not ready" after each start
    pub fn healthy_after(mut self, polls: u32) -> Self {
        self.healthy_after = polls;
        self
    }

    /// Make `op` fail with `message` until cleared
    pub fn fail_on(&self, op: &str, message: &str) {
        self.script
            .lock()
            .failures
            .insert(op.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.script.lock().failures.clear();
    }

    /// Delay `op` by `delay` before it takes effect
    pub fn delay(&self, op: &str, delay: Duration) {
        self.script.lock().delays.insert(op.to_string(), delay);
    }

    pub fn clear_delays(&self) {
        self.script.lock().delays.clear();
    }

    /// Simulate the engine dying on its own
    pub fn crash(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.crashed = true;
        state.log.push(format!("rank {}: engine terminated by signal", self.rank));
    }

    /// How many times `op` was invoked
    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    pub fn current_masks(&self) -> Option<String> {
        self.state.lock().masks.clone()
    }

    pub fn is_formatted(&self) -> bool {
        self.state.lock().formatted
    }

    /// Count the call, apply the scripted delay, then the scripted failure
    async fn enter(&self, op: &str) -> Result<()> {
        *self.calls.lock().entry(op.to_string()).or_insert(0) += 1;

        let (delay, failure) = {
            let script = self.script.lock();
            (
                script.delays.get(op).copied(),
                script.failures.get(op).cloned(),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(reason) => Err(Error::EngineFailure {
                rank: self.rank,
                reason,
            }),
            None => Ok(()),
        }
    }

    fn require_running(&self) -> Result<()> {
        if self.state.lock().running {
            Ok(())
        } else {
            Err(Error::EngineFailure {
                rank: self.rank,
                reason: "engine not running".to_string(),
            })
        }
    }

    fn log(&self, line: impl Into<String>) {
        let line = line.into();
        self.state.lock().log.push(format!("rank {}: {}", self.rank, line));
    }
}

#[async_trait]
impl EngineProcess for MockEngine {
    fn rank(&self) -> Rank {
        self.rank
    }

    async fn start(&self) -> Result<()> {
        self.enter("start").await?;
        {
            let mut state = self.state.lock();
            state.running = true;
            state.crashed = false;
            state.started_once = true;
            state.formatted = true;
            state.health_polls = 0;
        }
        self.log("engine started");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        self.enter("health_check").await?;
        self.require_running()?;
        let mut state = self.state.lock();
        state.health_polls += 1;
        Ok(state.health_polls > self.healthy_after)
    }

    async fn prep_shutdown(&self) -> Result<()> {
        self.enter("prep_shutdown").await?;
        self.require_running()?;
        self.log("prepared for shutdown");
        Ok(())
    }

    async fn stop(&self, _grace: Duration) -> Result<()> {
        self.enter("stop").await?;
        self.state.lock().running = false;
        self.log("engine stopped");
        Ok(())
    }

    async fn kill(&self) -> Result<()> {
        self.enter("kill").await?;
        self.state.lock().running = false;
        self.log("engine killed");
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.state.lock().running
    }

    async fn reset_format(&self) -> Result<()> {
        self.enter("reset_format").await?;
        if self.state.lock().running {
            return Err(Error::EngineFailure {
                rank: self.rank,
                reason: "cannot reset format of a running engine".to_string(),
            });
        }
        self.state.lock().formatted = false;
        self.log("format flag cleared");
        Ok(())
    }

    async fn query_state(&self) -> Result<EngineState> {
        self.enter("query").await?;
        let state = self.state.lock();
        let observed = if state.crashed {
            EngineState::Errored
        } else if state.running {
            if state.health_polls > self.healthy_after {
                EngineState::Ready
            } else {
                EngineState::Starting
            }
        } else if state.started_once && state.formatted {
            EngineState::Stopped
        } else {
            EngineState::Unknown
        };
        Ok(observed)
    }

    async fn set_log_masks(&self, masks: &LogMasks) -> Result<()> {
        self.enter("set_log_masks").await?;
        self.require_running()?;
        self.state.lock().masks = Some(masks.masks.clone());
        self.log(format!("log masks set to {}", masks.masks));
        Ok(())
    }

    async fn collect_log(&self, max_lines: usize) -> Result<String> {
        self.enter("collect_log").await?;
        let state = self.state.lock();
        let skip = state.log.len().saturating_sub(max_lines);
        Ok(state.log[skip..].join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failure() {
        let engine = MockEngine::new(0);
        engine.fail_on("start", "no hugepages");
        assert!(engine.start().await.is_err());
        assert_eq!(engine.calls("start"), 1);
        assert!(!engine.is_running().await);

        engine.clear_failures();
        engine.start().await.unwrap();
        assert!(engine.is_running().await);
    }

    #[tokio::test]
    async fn test_health_after_polls() {
        let engine = MockEngine::new(1).healthy_after(2);
        engine.start().await.unwrap();
        assert!(!engine.health_check().await.unwrap());
        assert!(!engine.health_check().await.unwrap());
        assert!(engine.health_check().await.unwrap());
        assert_eq!(engine.query_state().await.unwrap(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_reset_format_requires_stopped_engine() {
        let engine = MockEngine::new(2);
        engine.start().await.unwrap();
        assert!(engine.reset_format().await.is_err());

        engine.stop(Duration::from_millis(10)).await.unwrap();
        engine.reset_format().await.unwrap();
        assert!(!engine.is_formatted());
        assert_eq!(engine.query_state().await.unwrap(), EngineState::Unknown);
    }
}
