//! Engine lifecycle state machine
//!
//! Every state change a fanout operation may request goes through
//! [`EngineState::apply`]. Transitions missing from the table are rejected
//! before anything is dispatched to the engine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one engine rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Unknown,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Errored,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Unknown => write!(f, "unknown"),
            EngineState::Starting => write!(f, "starting"),
            EngineState::Ready => write!(f, "ready"),
            EngineState::Stopping => write!(f, "stopping"),
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Errored => write!(f, "errored"),
        }
    }
}

/// Requested lifecycle step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Launch the engine process
    Start,
    /// Engine passed its health check after launch
    HealthCheckPassed,
    /// Prepare for controlled shutdown
    PrepShutdown,
    /// Stop the engine; forced stops are accepted from any live state
    Stop { force: bool },
    /// Clear the engine's formatted flag
    ResetFormat,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Start => write!(f, "start"),
            Transition::HealthCheckPassed => write!(f, "health_check"),
            Transition::PrepShutdown => write!(f, "prep_shutdown"),
            Transition::Stop { force: true } => write!(f, "stop(force)"),
            Transition::Stop { force: false } => write!(f, "stop"),
            Transition::ResetFormat => write!(f, "reset_format"),
        }
    }
}

impl EngineState {
    /// Look up the transition table.
    ///
    /// Returns the state the rank moves to when `transition` succeeds, or
    /// `None` when the transition is not permitted from `self`. Failures are
    /// not in the table: any failed operation moves a rank to `Errored`.
    pub fn apply(self, transition: Transition) -> Option<EngineState> {
        use EngineState::*;

        match (self, transition) {
            (Unknown | Errored | Stopped, Transition::Start) => Some(Starting),
            // already running, nothing to launch
            (Ready, Transition::Start) => Some(Ready),

            (Starting, Transition::HealthCheckPassed) => Some(Ready),

            (Ready, Transition::PrepShutdown) => Some(Stopping),

            (Stopping | Stopped, Transition::Stop { .. }) => Some(Stopped),
            (Ready | Starting | Errored | Unknown, Transition::Stop { force: true }) => {
                Some(Stopped)
            }

            (Stopped | Errored, Transition::ResetFormat) => Some(Unknown),

            _ => None,
        }
    }

    /// Check whether the transition is in the table
    pub fn permits(self, transition: Transition) -> bool {
        self.apply(transition).is_some()
    }

    /// True when the transition would leave the state unchanged
    pub fn is_noop(self, transition: Transition) -> bool {
        self.apply(transition) == Some(self)
    }

    /// True for states where an engine process is expected to be alive
    pub fn is_running(self) -> bool {
        matches!(
            self,
            EngineState::Starting | EngineState::Ready | EngineState::Stopping
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EngineState::*;

    #[test]
    fn test_documented_lifecycle() {
        let s = Unknown.apply(Transition::Start).unwrap();
        assert_eq!(s, Starting);
        let s = s.apply(Transition::HealthCheckPassed).unwrap();
        assert_eq!(s, Ready);
        let s = s.apply(Transition::PrepShutdown).unwrap();
        assert_eq!(s, Stopping);
        let s = s.apply(Transition::Stop { force: false }).unwrap();
        assert_eq!(s, Stopped);
        let s = s.apply(Transition::ResetFormat).unwrap();
        assert_eq!(s, Unknown);
    }

    #[test]
    fn test_errored_is_recoverable() {
        assert_eq!(Errored.apply(Transition::Start), Some(Starting));
        assert_eq!(Errored.apply(Transition::ResetFormat), Some(Unknown));
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!Stopped.permits(Transition::PrepShutdown));
        assert!(!Ready.permits(Transition::Stop { force: false }));
        assert!(!Ready.permits(Transition::ResetFormat));
        assert!(!Unknown.permits(Transition::HealthCheckPassed));
        assert!(!Starting.permits(Transition::Start));
    }

    #[test]
    fn test_forced_stop_from_live_states() {
        for from in [Ready, Starting, Errored, Unknown, Stopping] {
            assert_eq!(from.apply(Transition::Stop { force: true }), Some(Stopped));
        }
    }

    #[test]
    fn test_noop_transitions() {
        assert!(Ready.is_noop(Transition::Start));
        assert!(Stopped.is_noop(Transition::Stop { force: false }));
        assert!(!Unknown.is_noop(Transition::Start));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", Ready), "ready");
        assert_eq!(format!("{}", Errored), "errored");
        assert_eq!(format!("{}", Transition::Stop { force: true }), "stop(force)");
    }
}
