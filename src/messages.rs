//! Control requests carried from a [`RunnerHandle`](crate::program::RunnerHandle)
//! to a running program.
//!
//! Requests are folded into a [`ControlFlags`] value published on a
//! `tokio::sync::watch` channel. The loop only ever looks at the latest
//! flags, so repeated requests collapse and a stop stays requested once set.

use serde::{Deserialize, Serialize};

/// Operator request to a running program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    /// Hold at the next poll boundary; devices stay connected.
    Pause,
    /// Continue after a pause.
    Resume,
    /// Finish the in-flight poll, then disconnect and stop.
    Stop,
}

/// Latest control intent as seen by the loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlFlags {
    /// Hold before the next poll.
    pub paused: bool,
    /// Stop at the next checkpoint. Never cleared.
    pub stop_requested: bool,
}

impl ControlFlags {
    /// Folds `request` into the flags. Returns `false` when nothing changed.
    pub fn apply(&mut self, request: ControlRequest) -> bool {
        let before = *self;
        match request {
            ControlRequest::Pause => self.paused = true,
            ControlRequest::Resume => self.paused = false,
            ControlRequest::Stop => self.stop_requested = true,
        }
        before != *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_sticky_and_idempotent() {
        let mut flags = ControlFlags::default();
        assert!(flags.apply(ControlRequest::Stop));
        assert!(!flags.apply(ControlRequest::Stop));
        flags.apply(ControlRequest::Resume);
        assert!(flags.stop_requested);
    }

    #[test]
    fn test_pause_resume_toggle() {
        let mut flags = ControlFlags::default();
        assert!(flags.apply(ControlRequest::Pause));
        assert!(flags.paused);
        assert!(!flags.apply(ControlRequest::Pause));
        assert!(flags.apply(ControlRequest::Resume));
        assert!(!flags.paused);
    }
}
