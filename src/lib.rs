//! Core library for the fbg_daq application.
//!
//! Thermal calibration and baking of fiber Bragg grating sensors: instrument
//! drivers, the control-loop engine that drives them through a thermal
//! profile, reading persistence and the operator message channel.
//!
//! The entry point is [`program::ProgramRunner`], specialized as
//! [`program::CalibrationRunner`] and [`program::BakingRunner`].

pub mod adapters;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod messages;
pub mod program;
pub mod report;
