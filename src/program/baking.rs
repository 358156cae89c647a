//! Baking: hold each target for a long dwell and sample it at a low cadence.
//!
//! A target is reached when the drift rate (least-squares slope of the
//! chamber temperature over a trailing window) has stayed below the
//! threshold for `settle_polls` polls. The dwell then yields
//! `dwell / sample_interval` recorded batches, each stamped with the current
//! drift rate. Point indices run `target * samples_per_target + sample`.
//!
//! A poll or sample that still fails after the call-site retries is skipped
//! and taken again at the next interval, so a cycle never has holes.

use super::predicate::{DriftPredicate, SettlePredicate, MIN_DRIFT_SAMPLES};
use super::{FaultPolicy, ProgramStrategy, RecordingPlan, Setpoint, SetpointRole};
use crate::config::{BakingSettings, ProgramConfig, ProgramMode};
use crate::core::ProgramKind;
use crate::error::{AppResult, DaqError};
use std::time::Duration;

/// Drift-settled dwell at each target.
#[derive(Debug)]
pub struct BakingStrategy {
    settings: BakingSettings,
    setpoints: Vec<Setpoint>,
}

impl BakingStrategy {
    /// Settings the strategy was built from.
    pub fn settings(&self) -> &BakingSettings {
        &self.settings
    }
}

impl ProgramStrategy for BakingStrategy {
    fn from_config(config: &ProgramConfig) -> AppResult<Self> {
        let ProgramMode::Baking(settings) = &config.mode else {
            return Err(DaqError::Configuration(format!(
                "program {} is not a baking program",
                config.id
            )));
        };

        let needed = config.timing.poll_interval * (MIN_DRIFT_SAMPLES as u32 - 1);
        if settings.drift_window < needed {
            return Err(DaqError::Configuration(format!(
                "drift_window of {:?} holds fewer than {MIN_DRIFT_SAMPLES} polls at a {:?} poll interval",
                settings.drift_window, config.timing.poll_interval
            )));
        }

        let per_target = settings.samples_per_target();
        let setpoints = config
            .targets_c
            .iter()
            .zip(0u32..)
            .map(|(&target_c, index)| Setpoint {
                target_c,
                role: SetpointRole::Profile,
                first_point: index * per_target,
            })
            .collect();

        Ok(Self {
            settings: settings.clone(),
            setpoints,
        })
    }

    fn kind(&self) -> ProgramKind {
        ProgramKind::Baking
    }

    fn setpoints(&self) -> &[Setpoint] {
        &self.setpoints
    }

    fn predicate(&self, _setpoint: &Setpoint) -> Box<dyn SettlePredicate> {
        Box::new(DriftPredicate::new(
            self.settings.drift_threshold_c_per_min,
            self.settings.drift_window,
            self.settings.settle_polls,
        ))
    }

    fn recording(&self, _setpoint: &Setpoint) -> RecordingPlan {
        RecordingPlan {
            batches: self.settings.samples_per_target(),
            interval: self.settings.sample_interval,
        }
    }

    fn fault_policy(&self) -> FaultPolicy {
        FaultPolicy::SkipPoint
    }

    fn max_consecutive_skips(&self) -> u32 {
        self.settings.max_consecutive_skips
    }

    fn setpoint_refresh(&self) -> Option<Duration> {
        Some(self.settings.setpoint_refresh)
    }

    fn use_cooling(&self) -> bool {
        self.settings.use_cooling
    }
}
