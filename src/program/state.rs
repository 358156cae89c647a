//! Program lifecycle and per-cycle bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a program run.
///
/// ```text
/// Idle -> Connecting -> Running <-> Paused
///            |             |          |
///            +-------------+----------+--> Stopping -> Stopped
///            +-------------+----------+--> Failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramState {
    /// Built but not started
    Idle,
    /// Bringing up every device
    Connecting,
    /// Executing the thermal profile
    Running,
    /// Holding at a poll boundary; devices stay connected
    Paused,
    /// Disconnecting after completion or a stop request
    Stopping,
    /// Finished, either completed or stopped by the operator
    Stopped,
    /// Ended by an unrecoverable error
    Failed,
}

impl ProgramState {
    /// Stopped or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether the lifecycle allows moving to `next`.
    pub fn can_transition_to(self, next: ProgramState) -> bool {
        use ProgramState::*;
        match (self, next) {
            (Idle, Connecting) => true,
            (Connecting, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Connecting | Running | Paused, Stopping) => true,
            (Stopping, Stopped) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ProgramState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Mutable state of the cycle being executed. Owned by the control loop.
///
/// The temperature history used by the settle decision lives in the active
/// [`SettlePredicate`](super::predicate::SettlePredicate).
#[derive(Clone, Debug, PartialEq)]
pub struct CycleState {
    /// Cycle number, starting at 1.
    pub cycle: u32,
    /// 1-based attempt of this cycle.
    pub attempt: u32,
    /// Index into the strategy setpoints.
    pub setpoint_index: usize,
    /// Faulted polls skipped in a row.
    pub consecutive_skips: u32,
    /// Most recent device fault of this cycle.
    pub last_error: Option<String>,
}

impl CycleState {
    /// Fresh state at the first setpoint.
    pub fn new(cycle: u32, attempt: u32) -> Self {
        Self {
            cycle,
            attempt,
            setpoint_index: 0,
            consecutive_skips: 0,
            last_error: None,
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_skips = 0;
    }

    pub(crate) fn record_skip(&mut self, error: &str) -> u32 {
        self.consecutive_skips += 1;
        self.last_error = Some(error.to_string());
        self.consecutive_skips
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ProgramState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Paused.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Failed));

        assert!(!Idle.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Stopped));
    }

    #[test]
    fn test_skips_reset_on_success() {
        let mut state = CycleState::new(2, 1);
        assert_eq!(state.record_skip("bus fault"), 1);
        assert_eq!(state.record_skip("bus fault"), 2);
        state.record_success();
        assert_eq!(state.consecutive_skips, 0);
        assert_eq!(state.last_error.as_deref(), Some("bus fault"));
    }
}
