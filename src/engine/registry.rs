//! Rank Registry
//!
//! Holds the ranks served by this host and the lifecycle state of each one.
//! Every state change is a check-and-set under the registry's write lock, so
//! concurrent fanouts, exit notifications and background completions never
//! interleave on the same rank.

use super::events::RankEvent;
use crate::domain::{EngineState, Rank, Transition};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Rank Entry
// =============================================================================

/// Registry record of a single rank
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankEntry {
    pub rank: Rank,
    pub state: EngineState,
    /// Message of the last failed operation, cleared on the next success
    pub last_error: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RankEntry {
    fn new(rank: Rank) -> Self {
        let now = Utc::now();
        Self {
            rank,
            state: EngineState::Unknown,
            last_error: None,
            registered_at: now,
            updated_at: now,
        }
    }

    fn set(&mut self, state: EngineState) -> EngineState {
        let previous = self.state;
        self.state = state;
        self.updated_at = Utc::now();
        if state != EngineState::Errored {
            self.last_error = None;
        }
        previous
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct RegistryStats {
    registrations: AtomicU64,
    transitions: AtomicU64,
    rejected_transitions: AtomicU64,
    errors: AtomicU64,
    exits: AtomicU64,
}

/// Snapshot of registry counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatsSnapshot {
    pub total_ranks: u64,
    pub ready_ranks: u64,
    pub errored_ranks: u64,
    pub registrations: u64,
    pub transitions: u64,
    pub rejected_transitions: u64,
    pub errors: u64,
    pub exits: u64,
}

// =============================================================================
// Rank Registry
// =============================================================================

/// Registry of local ranks and their lifecycle state
pub struct RankRegistry {
    ranks: RwLock<BTreeMap<Rank, RankEntry>>,
    stats: RegistryStats,
    event_sender: broadcast::Sender<RankEvent>,
}

impl std::fmt::Debug for RankRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankRegistry")
            .field("ranks", &self.ranks.read().len())
            .finish()
    }
}

impl RankRegistry {
    /// Create a new, empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RankEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: RankEvent) {
        // no subscribers is fine
        let _ = self.event_sender.send(event);
    }

    /// Register a rank in state `Unknown`
    pub fn register(&self, rank: impl Into<Rank>) -> Result<()> {
        let rank = rank.into();
        {
            let mut ranks = self.ranks.write();
            if ranks.contains_key(&rank) {
                return Err(Error::RankAlreadyRegistered { rank });
            }
            ranks.insert(rank, RankEntry::new(rank));
        }

        self.stats.registrations.fetch_add(1, Ordering::Relaxed);
        self.emit(RankEvent::RankRegistered { rank });
        Ok(())
    }

    /// Current state of a rank
    pub fn state(&self, rank: Rank) -> Result<EngineState> {
        self.ranks
            .read()
            .get(&rank)
            .map(|e| e.state)
            .ok_or(Error::RankNotFound { rank })
    }

    /// Full registry record of a rank
    pub fn entry(&self, rank: Rank) -> Result<RankEntry> {
        self.ranks
            .read()
            .get(&rank)
            .cloned()
            .ok_or(Error::RankNotFound { rank })
    }

    /// Check if a rank is registered
    pub fn contains(&self, rank: Rank) -> bool {
        self.ranks.read().contains_key(&rank)
    }

    /// All registered ranks
    pub fn known_ranks(&self) -> BTreeSet<Rank> {
        self.ranks.read().keys().copied().collect()
    }

    /// Copy of every entry, ascending by rank
    pub fn snapshot(&self) -> Vec<RankEntry> {
        self.ranks.read().values().cloned().collect()
    }

    /// Overwrite a rank's state with an observed value.
    ///
    /// Used for reconciliation after a query; lifecycle operations go through
    /// [`RankRegistry::transition`] instead. Returns the previous state.
    pub fn set_state(&self, rank: Rank, state: EngineState) -> Result<EngineState> {
        let previous = {
            let mut ranks = self.ranks.write();
            let entry = ranks.get_mut(&rank).ok_or(Error::RankNotFound { rank })?;
            entry.set(state)
        };

        if previous != state {
            self.stats.transitions.fetch_add(1, Ordering::Relaxed);
            debug!(%rank, from = %previous, to = %state, "Rank state reconciled");
            self.emit(RankEvent::StateChanged {
                rank,
                from: previous,
                to: state,
            });
        }
        Ok(previous)
    }

    /// Validate a transition against the current state without applying it
    pub fn check(&self, rank: Rank, transition: Transition) -> Result<EngineState> {
        let state = self.state(rank)?;
        state.apply(transition).ok_or_else(|| {
            self.stats.rejected_transitions.fetch_add(1, Ordering::Relaxed);
            Error::InvalidTransition {
                rank,
                operation: transition.to_string(),
                state,
            }
        })
    }

    /// Validate and apply a transition atomically. Returns the new state.
    pub fn transition(&self, rank: Rank, transition: Transition) -> Result<EngineState> {
        let (from, to) = {
            let mut ranks = self.ranks.write();
            let entry = ranks.get_mut(&rank).ok_or(Error::RankNotFound { rank })?;
            let from = entry.state;
            let to = match from.apply(transition) {
                Some(to) => to,
                None => {
                    self.stats.rejected_transitions.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::InvalidTransition {
                        rank,
                        operation: transition.to_string(),
                        state: from,
                    });
                }
            };
            entry.set(to);
            (from, to)
        };

        if from != to {
            self.stats.transitions.fetch_add(1, Ordering::Relaxed);
            debug!(%rank, %from, %to, %transition, "Rank transition");
            self.emit(RankEvent::StateChanged { rank, from, to });
        }
        Ok(to)
    }

    /// Record a failed operation; the rank stays addressable
    pub fn mark_errored(&self, rank: Rank, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let from = {
            let mut ranks = self.ranks.write();
            let entry = ranks.get_mut(&rank).ok_or(Error::RankNotFound { rank })?;
            let from = entry.set(EngineState::Errored);
            entry.last_error = Some(reason.clone());
            from
        };

        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        warn!(%rank, %from, %reason, "Rank errored");
        if from != EngineState::Errored {
            self.emit(RankEvent::StateChanged {
                rank,
                from,
                to: EngineState::Errored,
            });
        }
        self.emit(RankEvent::RankErrored { rank, reason });
        Ok(())
    }

    /// Process-exit notification.
    ///
    /// A clean exit, or any exit while the rank is stopping or stopped, lands
    /// in `Stopped`; everything else lands in `Errored`.
    pub fn notify_exit(&self, rank: Rank, clean: bool) -> Result<EngineState> {
        let (from, to) = {
            let mut ranks = self.ranks.write();
            let entry = ranks.get_mut(&rank).ok_or(Error::RankNotFound { rank })?;
            let from = entry.state;
            let expected = matches!(from, EngineState::Stopping | EngineState::Stopped);
            let to = if clean || expected {
                EngineState::Stopped
            } else {
                EngineState::Errored
            };
            entry.set(to);
            if to == EngineState::Errored {
                entry.last_error = Some("engine exited unexpectedly".to_string());
            }
            (from, to)
        };

        self.stats.exits.fetch_add(1, Ordering::Relaxed);
        self.emit(RankEvent::EngineExited { rank, clean });
        if from != to {
            self.emit(RankEvent::StateChanged { rank, from, to });
        }
        Ok(to)
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        let ranks = self.ranks.read();
        let count = |state: EngineState| ranks.values().filter(|e| e.state == state).count() as u64;

        RegistryStatsSnapshot {
            total_ranks: ranks.len() as u64,
            ready_ranks: count(EngineState::Ready),
            errored_ranks: count(EngineState::Errored),
            registrations: self.stats.registrations.load(Ordering::Relaxed),
            transitions: self.stats.transitions.load(Ordering::Relaxed),
            rejected_transitions: self.stats.rejected_transitions.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            exits: self.stats.exits.load(Ordering::Relaxed),
        }
    }
}

impl Default for RankRegistry {
    fn default() -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            ranks: RwLock::new(BTreeMap::new()),
            stats: RegistryStats::default(),
            event_sender,
        }
    }
}
