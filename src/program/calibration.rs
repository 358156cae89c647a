//! Calibration: visit every target once per cycle and record one batch when
//! the chamber is stable.
//!
//! A cycle is laid out as
//!
//! ```text
//! [conditioning] -> extra points before -> targets -> extra points after
//! ```
//!
//! Conditioning drives the oven to `first setpoint - conditioning_offset_c`
//! and waits until the chamber is at or below it, so every cycle approaches
//! the profile from the same side. It is left out when the offset is zero.

use super::predicate::{ConditioningPredicate, SettlePredicate, StabilityPredicate};
use super::{FaultPolicy, ProgramStrategy, RecordingPlan, Setpoint, SetpointRole};
use crate::config::{CalibrationSettings, ProgramConfig, ProgramMode};
use crate::core::ProgramKind;
use crate::error::{AppResult, DaqError};
use std::time::Duration;

/// Stability-settled single point at each temperature.
#[derive(Debug)]
pub struct CalibrationStrategy {
    settings: CalibrationSettings,
    setpoints: Vec<Setpoint>,
}

impl CalibrationStrategy {
    /// Settings the strategy was built from.
    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }
}

fn recorded(targets: &[f64], role: SetpointRole, next_point: &mut u32) -> Vec<Setpoint> {
    targets
        .iter()
        .map(|&target_c| {
            let setpoint = Setpoint {
                target_c,
                role,
                first_point: *next_point,
            };
            *next_point += 1;
            setpoint
        })
        .collect()
}

impl ProgramStrategy for CalibrationStrategy {
    fn from_config(config: &ProgramConfig) -> AppResult<Self> {
        let ProgramMode::Calibration(settings) = &config.mode else {
            return Err(DaqError::Configuration(format!(
                "program {} is not a calibration program",
                config.id
            )));
        };

        let mut next_point = 0;
        let mut points = recorded(&settings.extra_points.before, SetpointRole::Extra, &mut next_point);
        points.extend(recorded(&config.targets_c, SetpointRole::Profile, &mut next_point));
        points.extend(recorded(&settings.extra_points.after, SetpointRole::Extra, &mut next_point));

        let mut setpoints = Vec::with_capacity(points.len() + 1);
        if settings.conditioning_offset_c > 0.0 {
            if let Some(first) = points.first() {
                setpoints.push(Setpoint {
                    target_c: first.target_c - settings.conditioning_offset_c,
                    role: SetpointRole::Conditioning,
                    first_point: 0,
                });
            }
        }
        setpoints.extend(points);

        Ok(Self {
            settings: settings.clone(),
            setpoints,
        })
    }

    fn kind(&self) -> ProgramKind {
        ProgramKind::Calibration
    }

    fn setpoints(&self) -> &[Setpoint] {
        &self.setpoints
    }

    fn predicate(&self, setpoint: &Setpoint) -> Box<dyn SettlePredicate> {
        match setpoint.role {
            SetpointRole::Conditioning => Box::new(ConditioningPredicate::new(setpoint.target_c)),
            SetpointRole::Profile | SetpointRole::Extra => Box::new(StabilityPredicate::new(
                self.settings.stability_tolerance_c,
                self.settings.stability_window,
                self.settings.min_dwell,
            )),
        }
    }

    fn recording(&self, setpoint: &Setpoint) -> RecordingPlan {
        let batches = match setpoint.role {
            SetpointRole::Conditioning => 0,
            _ => 1,
        };
        RecordingPlan {
            batches,
            interval: Duration::ZERO,
        }
    }

    fn fault_policy(&self) -> FaultPolicy {
        FaultPolicy::AbortCycle
    }

    fn max_cycle_attempts(&self) -> u32 {
        self.settings.max_cycle_attempts
    }

    fn use_cooling(&self) -> bool {
        self.settings.use_cooling
    }
}
