//! Rank Events
//!
//! Events emitted by the rank registry for external consumers to react to
//! engine lifecycle changes.

use crate::domain::{EngineState, Rank};
use serde::{Deserialize, Serialize};

/// Events emitted by the rank registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankEvent {
    /// A rank was registered
    RankRegistered { rank: Rank },

    /// A rank moved between lifecycle states
    StateChanged {
        rank: Rank,
        from: EngineState,
        to: EngineState,
    },

    /// An operation on the rank failed
    RankErrored { rank: Rank, reason: String },

    /// The engine process went away on its own
    EngineExited { rank: Rank, clean: bool },
}

impl RankEvent {
    /// Get the rank associated with this event
    pub fn rank(&self) -> Rank {
        match self {
            RankEvent::RankRegistered { rank } => *rank,
            RankEvent::StateChanged { rank, .. } => *rank,
            RankEvent::RankErrored { rank, .. } => *rank,
            RankEvent::EngineExited { rank, .. } => *rank,
        }
    }

    /// Check if this event reports a fault
    pub fn is_failure(&self) -> bool {
        match self {
            RankEvent::RankErrored { .. } => true,
            RankEvent::EngineExited { clean, .. } => !clean,
            RankEvent::StateChanged { to, .. } => *to == EngineState::Errored,
            RankEvent::RankRegistered { .. } => false,
        }
    }
}
