//! Engine processes launched on the local host
//!
//! The engine binary is a black box. It is spawned with `tokio::process`,
//! told about shutdown preparation and log masks through a line-oriented
//! control file, and signalled with `kill` when it has to go away.

use crate::domain::{EngineProcess, EngineState, LogMasks, Rank};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// How long to wait for the process to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Launch description of one engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSpec {
    pub rank: Rank,
    /// Engine executable
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Engine stdout/stderr are appended here
    pub log_file: PathBuf,
    /// Control commands are appended here, one per line
    pub control_file: PathBuf,
    /// Present while the engine's storage is formatted
    pub format_marker: PathBuf,
    /// Created by the engine once it serves requests; absent means a live
    /// process counts as healthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_file: Option<PathBuf>,
}

/// Sent when an engine process exits, whether asked to or not.
///
/// `clean` is true for a zero exit status and for any exit that follows a
/// stop or kill we requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotice {
    pub rank: Rank,
    pub clean: bool,
}

struct Running {
    pid: Option<u32>,
    /// `Some(clean)` once the process has exited
    exit: watch::Receiver<Option<bool>>,
    kill: Option<oneshot::Sender<()>>,
    /// Set before we signal the process
    stop_requested: Arc<AtomicBool>,
}

/// Engine backed by a child process
pub struct ProcessEngine {
    spec: EngineSpec,
    running: Mutex<Option<Running>>,
    exit_notices: Option<mpsc::UnboundedSender<ExitNotice>>,
}

impl std::fmt::Debug for ProcessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngine")
            .field("rank", &self.spec.rank)
            .field("binary", &self.spec.binary)
            .finish()
    }
}

impl ProcessEngine {
    pub fn new(spec: EngineSpec) -> Self {
        Self {
            spec,
            running: Mutex::new(None),
            exit_notices: None,
        }
    }

    /// Forward exit notices to `sender`
    pub fn with_exit_notices(mut self, sender: mpsc::UnboundedSender<ExitNotice>) -> Self {
        self.exit_notices = Some(sender);
        self
    }

    pub fn spec(&self) -> &EngineSpec {
        &self.spec
    }

    fn engine_error(&self, reason: impl Into<String>) -> Error {
        Error::EngineFailure {
            rank: self.spec.rank,
            reason: reason.into(),
        }
    }

    /// `None` if never launched, `Some(None)` while alive, `Some(Some(clean))` after exit
    fn exit_status(&self) -> Option<Option<bool>> {
        self.running.lock().as_ref().map(|r| *r.exit.borrow())
    }

    fn alive(&self) -> bool {
        matches!(self.exit_status(), Some(None))
    }

    fn require_running(&self) -> Result<()> {
        if self.alive() {
            Ok(())
        } else {
            Err(self.engine_error("engine not running"))
        }
    }

    async fn send_control(&self, command: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spec.control_file)
            .await?;
        file.write_all(format!("{}\n", command).as_bytes()).await?;
        file.flush().await?;
        debug!(rank = %self.spec.rank, %command, "Control command sent");
        Ok(())
    }

    async fn signal(&self, pid: u32, signal: &str) -> Result<()> {
        let output = Command::new("kill")
            .args([signal, &pid.to_string()])
            .output()
            .await
            .map_err(|e| self.engine_error(format!("kill {}: {}", signal, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.engine_error(format!("kill {}: {}", signal, stderr.trim())));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineProcess for ProcessEngine {
    fn rank(&self) -> Rank {
        self.spec.rank
    }

    async fn start(&self) -> Result<()> {
        if self.alive() {
            return Ok(());
        }

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spec.log_file)?;
        let err_log = log.try_clone()?;

        let mut child = Command::new(&self.spec.binary)
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.engine_error(format!(
                    "failed to launch {}: {}",
                    self.spec.binary.display(),
                    e
                ))
            })?;

        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let notices = self.exit_notices.clone();
        let rank = self.spec.rank;
        let stop_requested = Arc::new(AtomicBool::new(false));
        let requested = stop_requested.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let requested = requested.load(Ordering::SeqCst);
            let clean = requested || matches!(&status, Ok(s) if s.success());
            match &status {
                Ok(s) => info!(%rank, status = %s, requested, "Engine exited"),
                Err(e) => warn!(%rank, error = %e, "Failed to reap engine"),
            }
            exit_tx.send_replace(Some(clean));
            if let Some(tx) = notices {
                let _ = tx.send(ExitNotice { rank, clean });
            }
        });

        *self.running.lock() = Some(Running {
            pid,
            exit: exit_rx,
            kill: Some(kill_tx),
            stop_requested,
        });
        info!(rank = %self.spec.rank, ?pid, binary = %self.spec.binary.display(), "Engine launched");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.exit_status() {
            Some(None) => {}
            Some(Some(_)) => return Err(self.engine_error("engine exited during startup")),
            None => return Err(self.engine_error("engine not launched")),
        }

        match &self.spec.ready_file {
            Some(path) => Ok(tokio::fs::metadata(path).await.is_ok()),
            None => Ok(true),
        }
    }

    async fn prep_shutdown(&self) -> Result<()> {
        self.require_running()?;
        self.send_control("prep_shutdown").await
    }

    async fn stop(&self, grace: Duration) -> Result<()> {
        let (pid, mut exit, requested) = {
            let running = self.running.lock();
            match running.as_ref() {
                Some(r) if r.exit.borrow().is_none() => {
                    (r.pid, r.exit.clone(), r.stop_requested.clone())
                }
                _ => return Ok(()),
            }
        };

        let pid = pid.ok_or_else(|| self.engine_error("engine pid unavailable"))?;
        requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.signal(pid, "-TERM").await {
            requested.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let exited = tokio::time::timeout(grace, exit.wait_for(|s| s.is_some()))
            .await
            .map(|r| r.is_ok());
        match exited {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::Timeout {
                operation: format!("graceful stop of rank {}", self.spec.rank),
                elapsed: grace,
            }),
        }
    }

    async fn kill(&self) -> Result<()> {
        let (sender, mut exit) = {
            let mut running = self.running.lock();
            match running.as_mut() {
                Some(r) if r.exit.borrow().is_none() => {
                    r.stop_requested.store(true, Ordering::SeqCst);
                    (r.kill.take(), r.exit.clone())
                }
                _ => return Ok(()),
            }
        };

        if let Some(sender) = sender {
            let _ = sender.send(());
        }

        tokio::time::timeout(KILL_WAIT, exit.wait_for(|s| s.is_some()))
            .await
            .map_err(|_| self.engine_error("engine survived SIGKILL"))?
            .map_err(|_| self.engine_error("engine watcher went away"))?;
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.alive()
    }

    async fn reset_format(&self) -> Result<()> {
        if self.alive() {
            return Err(self.engine_error("cannot reset format of a running engine"));
        }

        match tokio::fs::remove_file(&self.spec.format_marker).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // forget the exited process so the state reads unknown again
        *self.running.lock() = None;
        Ok(())
    }

    async fn query_state(&self) -> Result<EngineState> {
        let state = match self.exit_status() {
            None => EngineState::Unknown,
            Some(Some(true)) => EngineState::Stopped,
            Some(Some(false)) => EngineState::Errored,
            Some(None) => {
                if self.health_check().await? {
                    EngineState::Ready
                } else {
                    EngineState::Starting
                }
            }
        };
        Ok(state)
    }

    async fn set_log_masks(&self, masks: &LogMasks) -> Result<()> {
        self.require_running()?;

        let mut command = format!("log_masks {}", masks.masks);
        if let Some(streams) = &masks.streams {
            command.push_str(&format!(" streams={}", streams));
        }
        if let Some(subsystems) = &masks.subsystems {
            command.push_str(&format!(" subsystems={}", subsystems));
        }
        self.send_control(&command).await
    }

    async fn collect_log(&self, max_lines: usize) -> Result<String> {
        let content = match tokio::fs::read_to_string(&self.spec.log_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().collect();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines[skip..].join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineHandle, HandleConfig, RankRegistry};
    use tempfile::TempDir;

    fn spec_in(dir: &TempDir, binary: &str, args: &[&str]) -> EngineSpec {
        EngineSpec {
            rank: Rank(0),
            binary: PathBuf::from(binary),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            log_file: dir.path().join("engine.log"),
            control_file: dir.path().join("engine.ctl"),
            format_marker: dir.path().join("formatted"),
            ready_file: None,
        }
    }

    #[tokio::test]
    async fn test_unlaunched_engine() {
        let dir = TempDir::new().unwrap();
        let engine = ProcessEngine::new(spec_in(&dir, "/bin/sleep", &["30"]));
        assert!(!engine.is_running().await);
        assert_eq!(engine.query_state().await.unwrap(), EngineState::Unknown);
        assert!(engine.prep_shutdown().await.is_err());
        assert_eq!(engine.collect_log(10).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_launch_and_kill() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine =
            ProcessEngine::new(spec_in(&dir, "/bin/sleep", &["30"])).with_exit_notices(tx);

        engine.start().await.unwrap();
        assert!(engine.is_running().await);
        assert!(engine.health_check().await.unwrap());

        engine.prep_shutdown().await.unwrap();
        let control = std::fs::read_to_string(dir.path().join("engine.ctl")).unwrap();
        assert_eq!(control.trim(), "prep_shutdown");

        engine.kill().await.unwrap();
        assert!(!engine.is_running().await);
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.rank, Rank(0));
        assert!(notice.clean);
        assert_eq!(engine.query_state().await.unwrap(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_graceful_stop_stays_stopped() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine: Arc<ProcessEngine> = Arc::new(
            ProcessEngine::new(spec_in(&dir, "/bin/sleep", &["30"])).with_exit_notices(tx),
        );
        let registry = RankRegistry::new();
        registry.register(Rank(0)).unwrap();
        let config = HandleConfig {
            operation_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            health_poll_initial: Duration::from_millis(5),
            health_poll_max: Duration::from_millis(20),
        };
        let handle = EngineHandle::new(engine.clone(), registry.clone(), config);

        assert_eq!(handle.start().await.unwrap(), EngineState::Ready);
        assert_eq!(handle.prep_shutdown().await.unwrap(), EngineState::Stopping);
        assert_eq!(handle.stop(false).await.unwrap(), EngineState::Stopped);

        let notice = rx.recv().await.unwrap();
        assert!(notice.clean);
        assert_eq!(registry.notify_exit(notice.rank, notice.clean).unwrap(), EngineState::Stopped);
        assert_eq!(handle.query().await.unwrap(), EngineState::Stopped);
        assert_eq!(registry.state(Rank(0)).unwrap(), EngineState::Stopped);

        assert_eq!(handle.reset_format().await.unwrap(), EngineState::Unknown);
        assert_eq!(engine.query_state().await.unwrap(), EngineState::Unknown);
    }

    #[tokio::test]
    async fn test_unrequested_exit_is_unclean() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = ProcessEngine::new(spec_in(&dir, "/bin/false", &[])).with_exit_notices(tx);

        engine.start().await.unwrap();
        let notice = rx.recv().await.unwrap();
        assert!(!notice.clean);
        assert_eq!(engine.query_state().await.unwrap(), EngineState::Errored);
    }

    #[tokio::test]
    async fn test_reset_format_removes_marker() {
        let dir = TempDir::new().unwrap();
        let spec = spec_in(&dir, "/bin/true", &[]);
        std::fs::write(&spec.format_marker, b"").unwrap();
        let engine = ProcessEngine::new(spec.clone());

        engine.reset_format().await.unwrap();
        assert!(!spec.format_marker.exists());
        // already gone is fine
        engine.reset_format().await.unwrap();
    }

    #[tokio::test]
    async fn test_collect_log_tails() {
        let dir = TempDir::new().unwrap();
        let spec = spec_in(&dir, "/bin/true", &[]);
        std::fs::write(&spec.log_file, "one\ntwo\nthree\n").unwrap();
        let engine = ProcessEngine::new(spec);

        assert_eq!(engine.collect_log(2).await.unwrap(), "two\nthree");
    }
}
