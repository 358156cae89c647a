//! Control-loop engine.
//!
//! [`ProgramRunner`] owns a [`DeviceSet`](crate::instrument::DeviceSet) and
//! drives it through a thermal profile. What the profile looks like, when a
//! setpoint counts as reached and how faults are handled is supplied by a
//! [`ProgramStrategy`]:
//!
//! - [`CalibrationStrategy`]: stability window, extra points, cycle
//!   conditioning, faulted cycles are aborted and repeated.
//! - [`BakingStrategy`]: drift-rate settling, long dwells sampled at a low
//!   cadence, faulted polls are skipped.

pub mod acquisition;
pub mod baking;
pub mod calibration;
pub mod predicate;
pub mod runner;
pub mod state;

pub use baking::BakingStrategy;
pub use calibration::CalibrationStrategy;
pub use predicate::{SettlePredicate, Verdict};
pub use runner::{ProgramRunner, RunnerHandle};
pub use state::{CycleState, ProgramState};

use crate::config::ProgramConfig;
use crate::core::{ProgramKind, ReadingKind};
use crate::error::AppResult;
use std::time::Duration;

/// What a setpoint is visited for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetpointRole {
    /// Main thermal profile
    Profile,
    /// Calibration point outside the main profile
    Extra,
    /// Reached but never recorded
    Conditioning,
}

impl SetpointRole {
    /// Classification of accepted readings, `None` when nothing is recorded.
    pub fn reading_kind(self) -> Option<ReadingKind> {
        match self {
            Self::Profile => Some(ReadingKind::Real),
            Self::Extra => Some(ReadingKind::Extra),
            Self::Conditioning => None,
        }
    }
}

/// One stop of a cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Setpoint {
    /// Oven setpoint, °C.
    pub target_c: f64,
    /// Main profile or extra point.
    pub role: SetpointRole,
    /// Point index of the first batch recorded here.
    pub first_point: u32,
}

/// Batches recorded once a setpoint has settled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordingPlan {
    /// Batches to record.
    pub batches: u32,
    /// Pause between two batches.
    pub interval: Duration,
}

/// Reaction to a device fault that survived the call-site retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Report, drop the faulted poll and try again at the next interval.
    SkipPoint,
    /// Report and abandon the whole cycle.
    AbortCycle,
}

/// Program-specific half of the control loop.
pub trait ProgramStrategy: Send + Sync + Sized + 'static {
    /// Fails with a configuration error if `config` is for another program kind.
    fn from_config(config: &ProgramConfig) -> AppResult<Self>;

    /// Kind written to the manifest.
    fn kind(&self) -> ProgramKind;

    /// Setpoints of one cycle, in visiting order.
    fn setpoints(&self) -> &[Setpoint];

    /// Fresh settle decision for `setpoint`.
    fn predicate(&self, setpoint: &Setpoint) -> Box<dyn SettlePredicate>;

    /// How many batches `setpoint` records once settled.
    fn recording(&self, setpoint: &Setpoint) -> RecordingPlan;

    /// What a persistent device fault costs.
    fn fault_policy(&self) -> FaultPolicy;

    /// Attempts per cycle under [`FaultPolicy::AbortCycle`].
    fn max_cycle_attempts(&self) -> u32 {
        1
    }

    /// Skips in a row tolerated under [`FaultPolicy::SkipPoint`].
    fn max_consecutive_skips(&self) -> u32 {
        0
    }

    /// Re-send the oven setpoint this often while waiting or dwelling.
    fn setpoint_refresh(&self) -> Option<Duration> {
        None
    }

    /// Whether the coolant may be opened for downward steps.
    fn use_cooling(&self) -> bool;
}

/// Calibration program runner.
pub type CalibrationRunner = ProgramRunner<CalibrationStrategy>;

/// Baking program runner.
pub type BakingRunner = ProgramRunner<BakingStrategy>;
