//! Settings and program configuration
//!
//! Configuration is loaded with Figment from (in order of precedence):
//! 1. Environment variables prefixed with `FBGDAQ_` (nested keys split on `__`)
//! 2. A TOML settings file
//!
//! ```text
//! FBGDAQ_APPLICATION__LOG_LEVEL=debug
//! FBGDAQ_PROGRAM__CYCLES=3
//! FBGDAQ_STORAGE__ROOT=/data/fbg
//! ```
//!
//! [`ProgramConfig`] is the part the control loop consumes. It is validated
//! once, when the settings are loaded or a runner is built, and never changes
//! afterwards.

use crate::adapters::BusConfig;
use crate::core::{ChannelId, ProgramId, ProgramKind};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::report::DelayClass;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Interrogator optical channels are numbered 1..=4.
pub const INTERROGATOR_CHANNELS: u8 = 4;

/// Top-level settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Logging and naming.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument buses.
    pub devices: DevicesConfig,
    /// The run to execute.
    pub program: ProgramConfig,
    /// Operator message channel.
    #[serde(default)]
    pub report: ReportConfig,
    /// Reading persistence.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Simulated bench, used with `--simulate`.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Name shown in the startup log line.
    pub name: String,
    /// trace, debug, info, warn or error. `RUST_LOG` wins when set.
    pub log_level: String,
    /// Emit JSON log lines instead of the human readable format.
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "fbg_daq".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Where each instrument is attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Delta Design oven controller.
    pub oven: BusConfig,
    /// LakeShore temperature controller reading the chamber sensor.
    pub temperature_controller: BusConfig,
    /// Controller input the oven sensor is wired to.
    #[serde(default = "default_temperature_input")]
    pub temperature_input: char,
    /// Micron Optics SM125 interrogator.
    pub interrogator: BusConfig,
    /// Optical switch in front of one interrogator channel, if fitted.
    #[serde(default)]
    pub switch: Option<SwitchConfig>,
    /// Bus-level reply deadline used inside the drivers.
    #[serde(default = "default_reply_timeout", with = "humantime_serde")]
    pub reply_timeout: Duration,
}

/// Optical switch attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Where the switch is attached.
    pub bus: BusConfig,
    /// Number of output positions.
    #[serde(default = "default_switch_positions")]
    pub positions: u8,
    /// Wait after each position change before a scan is trusted.
    #[serde(default = "default_switch_settle", with = "humantime_serde")]
    pub settle: Duration,
}

/// One FBG sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Sensor serial number.
    pub sensor_id: ChannelId,
    /// Interrogator channel the sensor is read on, 1..=4.
    pub interrogator_channel: u8,
    /// Switch position routing the sensor, when it shares a channel.
    #[serde(default)]
    pub switch_position: Option<u8>,
    /// Polled and recorded. Channels not under test are only configured.
    #[serde(default = "default_true")]
    pub under_test: bool,
}

/// Poll cadence and bounded waits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause between polls while waiting for a setpoint.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Upper bound for one stability or drift wait.
    #[serde(with = "humantime_serde")]
    pub settle_timeout: Duration,
    /// Deadline for a single device call, including the driver's own bus reads.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            settle_timeout: Duration::from_secs(2 * 3600),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// How one recorded batch is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Temperature reads taken before and again after the optical scan.
    pub temperature_samples: usize,
    /// Interrogator scans averaged per sensor.
    pub scans_per_reading: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            temperature_samples: 2,
            scans_per_reading: 5,
        }
    }
}

/// Auxiliary calibration temperatures outside the main profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtraPoints {
    /// Visited before the main profile, °C.
    pub before: Vec<f64>,
    /// Visited after the main profile, °C.
    pub after: Vec<f64>,
}

impl ExtraPoints {
    /// Total number of extra points.
    pub fn len(&self) -> usize {
        self.before.len() + self.after.len()
    }

    /// No extra point configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stability criteria and profile of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Max spread of the stability window, °C.
    pub stability_tolerance_c: f64,
    /// Number of most recent samples that must agree.
    pub stability_window: usize,
    /// Minimum time since the setpoint command before a point may be accepted.
    #[serde(default, with = "humantime_serde")]
    pub min_dwell: Duration,
    /// Extra temperatures recorded once per cycle.
    #[serde(default)]
    pub extra_points: ExtraPoints,
    /// Each cycle starts by cooling to `first target - offset`.
    #[serde(default = "default_conditioning_offset")]
    pub conditioning_offset_c: f64,
    /// Whether the chamber may be actively cooled.
    #[serde(default)]
    pub use_cooling: bool,
    /// A faulted cycle is discarded and re-run at most this many times in total.
    #[serde(default = "default_max_cycle_attempts")]
    pub max_cycle_attempts: u32,
}

/// Drift criteria and dwell of a baking run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BakingSettings {
    /// Settled when |slope| stays below this, °C per minute.
    pub drift_threshold_c_per_min: f64,
    /// Trailing window used for the slope fit.
    #[serde(with = "humantime_serde")]
    pub drift_window: Duration,
    /// Consecutive polls under the threshold required to settle.
    pub settle_polls: u32,
    /// Dwell at each target once settled.
    #[serde(with = "humantime_serde")]
    pub dwell: Duration,
    /// Cadence of recorded samples during the dwell.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Targets that may be skipped in a row before the run fails.
    #[serde(default = "default_max_consecutive_skips")]
    pub max_consecutive_skips: u32,
    /// The oven setpoint is re-sent this often during long waits.
    #[serde(default = "default_setpoint_refresh", with = "humantime_serde")]
    pub setpoint_refresh: Duration,
    /// Whether the chamber may be actively cooled.
    #[serde(default)]
    pub use_cooling: bool,
}

impl BakingSettings {
    /// Recorded samples per target.
    pub fn samples_per_target(&self) -> u32 {
        let interval = self.sample_interval.as_secs_f64();
        if interval <= 0.0 {
            return 1;
        }
        ((self.dwell.as_secs_f64() / interval).floor() as u32).max(1)
    }
}

/// Program specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgramMode {
    /// Stability-driven calibration.
    Calibration(CalibrationSettings),
    /// Drift-driven baking.
    Baking(BakingSettings),
}

/// Immutable description of one calibration or baking run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Data set name; re-using it resumes the program.
    pub id: ProgramId,
    /// Main thermal profile, visited in order.
    pub targets_c: Vec<f64>,
    /// Every sensor on the bench.
    pub channels: Vec<ChannelConfig>,
    /// Number of passes over the profile.
    pub cycles: u32,
    /// Calibration or baking, with its settings.
    pub mode: ProgramMode,
    /// Poll cadence and bounded waits.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Sampling of one recorded batch.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Retry policy for reads and commands during the run.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Retry policy for the initial connection of each device.
    #[serde(default)]
    pub connect_retry: RetryPolicy,
    /// Persist polls taken while waiting for stability.
    #[serde(default)]
    pub record_transient: bool,
}

impl ProgramConfig {
    /// Calibration or baking.
    pub fn kind(&self) -> ProgramKind {
        match self.mode {
            ProgramMode::Calibration(_) => ProgramKind::Calibration,
            ProgramMode::Baking(_) => ProgramKind::Baking,
        }
    }

    /// Channels that are polled and recorded.
    pub fn channels_under_test(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.under_test)
    }

    /// Switch positions to visit, in configured order.
    pub fn switch_positions(&self) -> Vec<u8> {
        let mut positions = Vec::new();
        for position in self.channels_under_test().filter_map(|c| c.switch_position) {
            if !positions.contains(&position) {
                positions.push(position);
            }
        }
        positions
    }

    /// Accepted batches that make up one complete cycle.
    pub fn points_per_cycle(&self) -> u32 {
        let targets = self.targets_c.len() as u32;
        match &self.mode {
            ProgramMode::Calibration(c) => targets + c.extra_points.len() as u32,
            ProgramMode::Baking(b) => targets * b.samples_per_target(),
        }
    }

    /// Checks every invariant of the program. Errors are fatal and never retried.
    pub fn validate(&self) -> AppResult<()> {
        if self.id.as_str().trim().is_empty() {
            return invalid("program id must not be empty");
        }
        if self.cycles == 0 {
            return invalid("cycles must be at least 1");
        }
        self.validate_targets()?;
        self.validate_channels()?;

        match &self.mode {
            ProgramMode::Calibration(c) => {
                positive("stability_tolerance_c", c.stability_tolerance_c)?;
                if c.stability_window == 0 {
                    return invalid("stability_window must be at least 1 sample");
                }
                if !c.conditioning_offset_c.is_finite() || c.conditioning_offset_c < 0.0 {
                    return invalid("conditioning_offset_c must be >= 0");
                }
                if c.max_cycle_attempts == 0 {
                    return invalid("max_cycle_attempts must be at least 1");
                }
            }
            ProgramMode::Baking(b) => {
                positive("drift_threshold_c_per_min", b.drift_threshold_c_per_min)?;
                nonzero("drift_window", b.drift_window)?;
                nonzero("sample_interval", b.sample_interval)?;
                nonzero("setpoint_refresh", b.setpoint_refresh)?;
                if b.settle_polls == 0 {
                    return invalid("settle_polls must be at least 1");
                }
                if b.dwell < b.sample_interval {
                    return invalid("dwell must be at least one sample_interval");
                }
            }
        }

        nonzero("poll_interval", self.timing.poll_interval)?;
        nonzero("settle_timeout", self.timing.settle_timeout)?;
        nonzero("call_timeout", self.timing.call_timeout)?;
        if self.acquisition.temperature_samples == 0 || self.acquisition.scans_per_reading == 0 {
            return invalid("temperature_samples and scans_per_reading must be at least 1");
        }
        self.retry.validate("retry")?;
        self.connect_retry.validate("connect_retry")?;
        Ok(())
    }

    fn validate_targets(&self) -> AppResult<()> {
        if self.targets_c.is_empty() {
            return invalid("at least one target temperature is required");
        }
        let mut all = self.targets_c.clone();
        if let ProgramMode::Calibration(c) = &self.mode {
            all.extend(c.extra_points.before.iter().chain(&c.extra_points.after));
        }
        if let Some(bad) = all.iter().find(|t| !t.is_finite()) {
            return invalid(format!("target temperature {bad} is not a number"));
        }
        for (i, a) in all.iter().enumerate() {
            if all[i + 1..].iter().any(|b| a == b) {
                return invalid(format!("target temperature {a} °C appears more than once"));
            }
        }
        Ok(())
    }

    fn validate_channels(&self) -> AppResult<()> {
        if self.channels_under_test().next().is_none() {
            return invalid("at least one channel must be under test");
        }

        let mut serials = HashSet::new();
        let mut positions = HashSet::new();
        let mut switched_channel = None;
        for channel in &self.channels {
            let serial = channel.sensor_id.as_str();
            if serial.trim().is_empty() {
                return invalid("sensor serial numbers must not be empty");
            }
            if !serials.insert(serial) {
                return invalid(format!("sensor serial {serial} is used more than once"));
            }
            if !(1..=INTERROGATOR_CHANNELS).contains(&channel.interrogator_channel) {
                return invalid(format!(
                    "sensor {serial}: interrogator channel must be 1..={INTERROGATOR_CHANNELS}"
                ));
            }
            if let Some(position) = channel.switch_position {
                if position == 0 {
                    return invalid(format!("sensor {serial}: switch positions start at 1"));
                }
                if !positions.insert(position) {
                    return invalid(format!("switch position {position} is used more than once"));
                }
                match switched_channel {
                    None => switched_channel = Some(channel.interrogator_channel),
                    Some(ch) if ch != channel.interrogator_channel => {
                        return invalid(
                            "only one interrogator channel may be connected to the optical switch",
                        );
                    }
                    Some(_) => {}
                }
            }
        }

        for channel in &self.channels {
            let shared = self
                .channels
                .iter()
                .filter(|c| c.interrogator_channel == channel.interrogator_channel)
                .count()
                > 1;
            if shared && channel.switch_position.is_none() {
                return invalid(format!(
                    "sensor {} shares interrogator channel {} and needs a switch position",
                    channel.sensor_id, channel.interrogator_channel
                ));
            }
        }
        Ok(())
    }
}

/// Per-severity anti-flood configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Soft bound of the message queue.
    pub capacity: usize,
    /// Anti-flood class of developer messages.
    pub developer: DelayClass,
    /// Anti-flood class of informational messages.
    pub info: DelayClass,
    /// Anti-flood class of warnings.
    pub warning: DelayClass,
    /// Anti-flood class of errors.
    pub error: DelayClass,
    /// Anti-flood class of critical messages.
    pub critical: DelayClass,
    /// Window steps used by [`DelayClass::Escalating`].
    #[serde(with = "duration_list")]
    pub escalation: Vec<Duration>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            developer: DelayClass::Fixed(Duration::from_secs(60)),
            info: DelayClass::Immediate,
            warning: DelayClass::Escalating,
            error: DelayClass::Escalating,
            critical: DelayClass::Immediate,
            escalation: [60, 300, 600, 3600]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

impl ReportConfig {
    /// Rejects an empty queue or an empty escalation ladder.
    pub fn validate(&self) -> AppResult<()> {
        if self.capacity == 0 {
            return invalid("report capacity must be at least 1");
        }
        if self.escalation.is_empty() {
            return invalid("report escalation needs at least one step");
        }
        Ok(())
    }
}

/// Where readings are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// One CSV file per program under `root`.
    Csv,
    /// Process memory only; lost on exit.
    Memory,
}

/// Reading persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage implementation.
    pub backend: StorageBackend,
    /// One sub-directory per program is created here.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Csv,
            root: PathBuf::from("data"),
        }
    }
}

/// Parameters of the simulated bench used by `run --simulate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Chamber temperature at startup, °C.
    pub start_c: f64,
    /// First-order time constant of the chamber.
    #[serde(with = "humantime_serde")]
    pub time_constant: Duration,
    /// Peak amplitude of the uniform temperature noise, °C.
    pub noise_c: f64,
    /// Settle time of the simulated switch.
    #[serde(with = "humantime_serde")]
    pub switch_settle: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start_c: 25.0,
            time_constant: Duration::from_secs(120),
            noise_c: 0.02,
            switch_settle: Duration::from_millis(1200),
        }
    }
}

/// Serde helpers for a list of humantime durations.
mod duration_list {
    use humantime_serde::Serde;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(steps: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(steps.iter().map(|d| Serde::from(*d)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        let steps: Vec<Serde<Duration>> = Vec::deserialize(deserializer)?;
        Ok(steps.into_iter().map(Serde::into_inner).collect())
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_temperature_input() -> char {
    'B'
}

fn default_reply_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_switch_positions() -> u8 {
    16
}

fn default_switch_settle() -> Duration {
    Duration::from_millis(1200)
}

fn default_conditioning_offset() -> f64 {
    5.0
}

fn default_max_cycle_attempts() -> u32 {
    2
}

fn default_max_consecutive_skips() -> u32 {
    3
}

fn default_setpoint_refresh() -> Duration {
    Duration::from_secs(180)
}

fn invalid<T>(message: impl Into<String>) -> AppResult<T> {
    Err(DaqError::Configuration(message.into()))
}

fn positive(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        invalid(format!("{name} must be > 0, got {value}"))
    }
}

fn nonzero(name: &str, value: Duration) -> AppResult<()> {
    if value.is_zero() {
        invalid(format!("{name} must be greater than zero"))
    } else {
        Ok(())
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Settings {
    /// Loads `path` merged with `FBGDAQ_` environment overrides, then validates.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("FBGDAQ_").split("__")),
        )
    }

    /// Parses settings from a TOML string, without environment overrides.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates the whole settings tree, including the program.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        self.program.validate()?;
        self.report.validate()?;

        let switched = !self.program.switch_positions().is_empty();
        match &self.devices.switch {
            None if switched => {
                return invalid("channels use switch positions but no optical switch is configured")
            }
            Some(switch) => {
                if let Some(p) = self
                    .program
                    .switch_positions()
                    .into_iter()
                    .find(|p| *p > switch.positions)
                {
                    return invalid(format!(
                        "switch position {p} exceeds the {} positions of the optical switch",
                        switch.positions
                    ));
                }
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn channel(serial: &str, interrogator_channel: u8, position: Option<u8>) -> ChannelConfig {
        ChannelConfig {
            sensor_id: ChannelId::new(serial),
            interrogator_channel,
            switch_position: position,
            under_test: true,
        }
    }

    pub(crate) fn calibration(targets: Vec<f64>) -> ProgramConfig {
        ProgramConfig {
            id: ProgramId::new("cal-test"),
            targets_c: targets,
            channels: vec![channel("FBG-1", 1, None), channel("FBG-2", 2, None)],
            cycles: 1,
            mode: ProgramMode::Calibration(CalibrationSettings {
                stability_tolerance_c: 0.5,
                stability_window: 3,
                min_dwell: Duration::ZERO,
                extra_points: ExtraPoints::default(),
                conditioning_offset_c: 5.0,
                use_cooling: false,
                max_cycle_attempts: 2,
            }),
            timing: TimingConfig::default(),
            acquisition: AcquisitionConfig::default(),
            retry: RetryPolicy::default(),
            connect_retry: RetryPolicy::default(),
            record_transient: false,
        }
    }

    const SETTINGS: &str = r#"
        [application]
        log_level = "debug"

        [devices]
        reply_timeout = "2s"
        oven = { kind = "serial", port = "/dev/ttyUSB0" }
        temperature_controller = { kind = "tcp", address = "10.0.0.50:1234" }
        interrogator = { kind = "tcp", address = "10.0.0.122:50000" }
        switch = { bus = { kind = "serial", port = "/dev/ttyUSB1" }, positions = 8 }

        [program]
        id = "batch-42"
        targets_c = [25.0, 50.0, 75.0]
        cycles = 2
        channels = [
            { sensor_id = "FBG-1", interrogator_channel = 1, switch_position = 1 },
            { sensor_id = "FBG-2", interrogator_channel = 1, switch_position = 2 },
            { sensor_id = "FBG-3", interrogator_channel = 2, under_test = false },
        ]

        [program.mode]
        kind = "calibration"
        stability_tolerance_c = 0.1
        stability_window = 5
        min_dwell = "10m"
        extra_points = { after = [100.0] }

        [program.timing]
        poll_interval = "30s"

        [report]
        warning = { fixed = "2m" }
    "#;

    #[test]
    fn test_settings_from_toml() {
        let settings = Settings::from_toml_str(SETTINGS).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.devices.reply_timeout, Duration::from_secs(2));
        assert_eq!(settings.devices.temperature_input, 'B');
        let switch = settings.devices.switch.as_ref().unwrap();
        assert_eq!(switch.settle, Duration::from_millis(1200));

        let program = &settings.program;
        assert_eq!(program.kind(), ProgramKind::Calibration);
        assert_eq!(program.channels_under_test().count(), 2);
        assert_eq!(program.switch_positions(), vec![1, 2]);
        assert_eq!(program.points_per_cycle(), 4);
        assert_eq!(program.timing.poll_interval, Duration::from_secs(30));
        assert_eq!(program.timing.call_timeout, Duration::from_secs(10));
        match &program.mode {
            ProgramMode::Calibration(c) => {
                assert_eq!(c.min_dwell, Duration::from_secs(600));
                assert_eq!(c.extra_points.after, vec![100.0]);
                assert_eq!(c.conditioning_offset_c, 5.0);
            }
            other => panic!("unexpected mode {other:?}"),
        }
        assert_eq!(
            settings.report.warning,
            DelayClass::Fixed(Duration::from_secs(120))
        );
        assert_eq!(settings.storage.backend, StorageBackend::Csv);
    }

    #[test]
    fn test_settings_file_and_switch_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, SETTINGS.replace("positions = 8", "positions = 1")).unwrap();

        let err = Settings::load(&path).unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    #[test]
    fn test_example_settings_parse() {
        let settings =
            Settings::from_toml_str(include_str!("../config/settings.example.toml")).unwrap();
        assert_eq!(settings.program.points_per_cycle(), 5);
        assert_eq!(settings.program.connect_retry.max_attempts, 5);
        assert_eq!(settings.report.escalation.len(), 4);
    }

    #[test]
    fn test_duplicate_targets_rejected() {
        let err = calibration(vec![25.0, 50.0, 25.0]).validate().unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));

        let mut config = calibration(vec![25.0, 50.0]);
        if let ProgramMode::Calibration(c) = &mut config.mode {
            c.extra_points.before = vec![50.0];
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tolerances_must_be_positive() {
        let mut config = calibration(vec![25.0]);
        if let ProgramMode::Calibration(c) = &mut config.mode {
            c.stability_tolerance_c = 0.0;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_channel_rules() {
        let mut config = calibration(vec![25.0]);
        assert!(config.validate().is_ok());

        config.channels.iter_mut().for_each(|c| c.under_test = false);
        assert!(config.validate().is_err(), "no channel under test");

        let mut config = calibration(vec![25.0]);
        config.channels = vec![channel("A", 1, None), channel("A", 2, None)];
        assert!(config.validate().is_err(), "duplicate serial");

        config.channels = vec![channel("A", 1, None), channel("B", 1, None)];
        assert!(config.validate().is_err(), "shared channel without switch");

        config.channels = vec![channel("A", 1, Some(1)), channel("B", 2, Some(2))];
        assert!(config.validate().is_err(), "switch on two interrogator channels");

        config.channels = vec![channel("A", 1, Some(1)), channel("B", 1, Some(1))];
        assert!(config.validate().is_err(), "duplicate switch position");

        config.channels = vec![channel("A", 5, None)];
        assert!(config.validate().is_err(), "interrogator channel out of range");

        config.channels = vec![channel("A", 1, Some(1)), channel("B", 1, Some(2)), channel("C", 3, None)];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_baking_points_per_cycle() {
        let mut config = calibration(vec![120.0, 150.0]);
        config.mode = ProgramMode::Baking(BakingSettings {
            drift_threshold_c_per_min: 0.05,
            drift_window: Duration::from_secs(600),
            settle_polls: 3,
            dwell: Duration::from_secs(3600),
            sample_interval: Duration::from_secs(900),
            max_consecutive_skips: 3,
            setpoint_refresh: Duration::from_secs(180),
            use_cooling: false,
        });
        assert!(config.validate().is_ok());
        assert_eq!(config.kind(), ProgramKind::Baking);
        assert_eq!(config.points_per_cycle(), 8);
    }
}
