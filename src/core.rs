//! Core data types shared by the control loop, the stores and the drivers.
//!
//! # Data Flow
//!
//! ```text
//! DeviceSet --[PeakScan, °C]--> ProgramRunner --[Vec<Reading>]--> RecordStore
//!                                     |
//!                                     +--[Message]--> ReportChannel --> operator surface
//! ```
//!
//! Readings are handed to the store by value and never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one program run. Resuming uses the same id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(String);

impl ProgramId {
    /// Wraps a program name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as written in the configuration.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sensor serial number, used as the channel key everywhere.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Wraps a sensor serial number.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The serial number.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which program produced a data set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramKind {
    /// Stability-driven calibration.
    Calibration,
    /// Drift-driven baking.
    Baking,
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Calibration => write!(f, "calibration"),
            Self::Baking => write!(f, "baking"),
        }
    }
}

/// Classification of a persisted reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    /// Accepted point on the main thermal profile (or a baking dwell sample).
    Real,
    /// Accepted point at an auxiliary calibration temperature.
    Extra,
    /// Poll taken while waiting for stability; never counts towards a cycle.
    Transient,
}

impl ReadingKind {
    /// Accepted readings count towards cycle completeness.
    pub fn is_accepted(self) -> bool {
        !matches!(self, Self::Transient)
    }
}

impl fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real => write!(f, "real"),
            Self::Extra => write!(f, "extra"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

/// One sample for one sensor channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Sensor serial number
    pub channel: ChannelId,
    /// Thermal cycle number, starting at 1
    pub cycle: u32,
    /// Index of the recorded point inside the cycle
    pub point: u32,
    /// Wall-clock time of the optical scan
    pub timestamp: DateTime<Utc>,
    /// Accepted or transient
    pub kind: ReadingKind,
    /// Mean oven temperature around the optical scan
    pub temperature_c: f64,
    /// Averaged interrogator peak
    pub wavelength_nm: f64,
    /// Power of the averaged peak
    pub power_dbm: f64,
    /// Temperature slope in °C/min when the point was taken, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift_rate: Option<f64>,
}

/// Peaks reported by an interrogator in one scan, grouped by its optical channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeakScan {
    /// `channels[i]` holds the `(wavelength_nm, power_dbm)` peaks of channel `i + 1`.
    pub channels: Vec<Vec<(f64, f64)>>,
}

impl PeakScan {
    /// First peak on a 1-based interrogator channel.
    pub fn first_peak(&self, channel: u8) -> Option<(f64, f64)> {
        let index = usize::from(channel).checked_sub(1)?;
        self.channels.get(index)?.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_peak_is_one_based() {
        let scan = PeakScan {
            channels: vec![vec![(1550.1, -12.0)], vec![], vec![(1540.0, -9.5), (1560.0, -9.0)]],
        };
        assert_eq!(scan.first_peak(1), Some((1550.1, -12.0)));
        assert_eq!(scan.first_peak(2), None);
        assert_eq!(scan.first_peak(3), Some((1540.0, -9.5)));
        assert_eq!(scan.first_peak(0), None);
        assert_eq!(scan.first_peak(5), None);
    }

    #[test]
    fn test_transient_is_not_accepted() {
        assert!(ReadingKind::Real.is_accepted());
        assert!(ReadingKind::Extra.is_accepted());
        assert!(!ReadingKind::Transient.is_accepted());
    }
}
