//! Deadline-bounded concurrent dispatch
//!
//! Shared by the rank coordinator and the device-level subsystem managers.
//! Each locked target's operation runs as a detached task that owns the
//! target's lock guard. The caller waits for outcomes until the deadline;
//! anything later is reported as `Timeout` while its task keeps running and
//! releases the lock only when the operation really finishes.

use super::locks::KeyedLocks;
use crate::domain::{FailureKind, Outcome};
use crate::error::Result;
use crate::metrics;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Runs one operation per target under per-target locks
#[derive(Debug)]
pub struct Dispatcher<K: Eq + Hash> {
    surface: &'static str,
    locks: Arc<KeyedLocks<K>>,
    /// Reported when an operation task dies without an outcome
    fault_kind: FailureKind,
}

impl<K> Dispatcher<K>
where
    K: Ord + Hash + Clone + Display + Send + Sync + 'static,
{
    pub fn new(surface: &'static str, locks: Arc<KeyedLocks<K>>, fault_kind: FailureKind) -> Self {
        Self {
            surface,
            locks,
            fault_kind,
        }
    }

    pub fn locks(&self) -> &Arc<KeyedLocks<K>> {
        &self.locks
    }

    /// Dispatch `op` to every target concurrently and collect one outcome per target.
    ///
    /// Never fails as a whole: busy targets, failed operations and late
    /// targets each become that target's outcome.
    pub async fn run<P, F, Fut>(
        &self,
        targets: impl IntoIterator<Item = K>,
        deadline: Duration,
        op: F,
    ) -> BTreeMap<K, Outcome<P>>
    where
        P: Send + 'static,
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<P>> + Send + 'static,
    {
        let deadline_at = Instant::now() + deadline;
        let mut results = BTreeMap::new();
        let mut pending = Vec::new();

        for target in targets {
            let Some(guard) = self.locks.try_acquire(&target) else {
                debug!(surface = self.surface, %target, "Target busy");
                results.insert(
                    target.clone(),
                    Outcome::failure(
                        FailureKind::Busy,
                        format!("{} busy: operation already in progress", target),
                    ),
                );
                continue;
            };

            let (tx, rx) = oneshot::channel();
            let operation = op(target.clone());
            let surface = self.surface;
            let label = target.to_string();

            tokio::spawn(async move {
                let _guard = guard;
                let outcome = Outcome::from_result(operation.await);
                if let Outcome::Failure { kind, message } = &outcome {
                    warn!(surface, target = %label, %kind, %message, "Target operation failed");
                }
                // receiver is gone once the caller's deadline passed
                let _ = tx.send(outcome);
            });
            pending.push((target, rx));
        }

        let fault_kind = self.fault_kind;
        let waits = pending.into_iter().map(|(target, rx)| async move {
            let outcome = match tokio::time::timeout_at(deadline_at, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Outcome::failure(fault_kind, "operation task aborted"),
                Err(_) => Outcome::failure(
                    FailureKind::Timeout,
                    format!("no outcome from {} within {:?}", target, deadline),
                ),
            };
            (target, outcome)
        });

        for (target, outcome) in join_all(waits).await {
            results.insert(target, outcome);
        }

        for outcome in results.values() {
            metrics::record_outcome(self.surface, outcome);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn dispatcher() -> Dispatcher<u32> {
        Dispatcher::new("test", Arc::new(KeyedLocks::new()), FailureKind::DeviceFailure)
    }

    #[tokio::test]
    async fn test_one_outcome_per_target() {
        let results = dispatcher()
            .run([3u32, 1, 2], Duration::from_secs(1), |t| async move {
                if t == 2 {
                    Err(Error::DeviceFailure {
                        device: t.to_string(),
                        reason: "format failed".into(),
                    })
                } else {
                    Ok(t * 10)
                }
            })
            .await;

        let keys: Vec<u32> = results.keys().copied().collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(results[&1].payload(), Some(&10));
        assert_eq!(results[&2].failure_kind(), Some(FailureKind::DeviceFailure));
    }

    #[tokio::test]
    async fn test_late_target_times_out_and_keeps_lock() {
        let dispatcher = dispatcher();
        let results = dispatcher
            .run([1u32, 2], Duration::from_millis(50), |t| async move {
                if t == 2 {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                Ok(())
            })
            .await;

        assert!(results[&1].is_success());
        assert_eq!(results[&2].failure_kind(), Some(FailureKind::Timeout));

        // the slow operation still owns its target
        assert!(dispatcher.locks().is_locked(&2));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!dispatcher.locks().is_locked(&2));
    }

    #[tokio::test]
    async fn test_held_target_is_busy() {
        let dispatcher = dispatcher();
        let _held = dispatcher.locks().try_acquire(&7).unwrap();

        let results = dispatcher
            .run([7u32, 8], Duration::from_secs(1), |_| async { Ok(()) })
            .await;
        assert_eq!(results[&7].failure_kind(), Some(FailureKind::Busy));
        assert!(results[&8].is_success());
    }
}
