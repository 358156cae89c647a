//! Simulated instruments for testing without hardware.
//!
//! A [`MockBench`] is a tiny shared world: one oven chamber, the sensors inside
//! it and the position of the optical switch. The devices it hands out all
//! observe the same chamber, so commanding the simulated oven moves what the
//! simulated thermometer and interrogator report.
//!
//! Two thermal behaviours are available:
//!
//! - [`ThermalBehavior::Scripted`]: after every setpoint change the thermometer
//!   walks through a fixed list of offsets from the setpoint, then reports the
//!   setpoint exactly. Deterministic, used by tests.
//! - [`ThermalBehavior::FirstOrder`]: exponential approach to the setpoint with
//!   optional uniform noise. Used by `fbg_daq run --simulate`.
//!
//! Faults can be injected per device to exercise the retry and skip paths.

use super::{DeviceChannel, DeviceSet, OvenCommand, OvenStatus};
use crate::core::PeakScan;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Name of the mock oven, for fault injection.
pub const OVEN: &str = "Mock oven";
/// Name of the mock thermometer.
pub const THERMOMETER: &str = "Mock thermometer";
/// Name of the mock switch.
pub const SWITCH: &str = "Mock switch";
/// Name of the mock interrogator.
pub const INTERROGATOR: &str = "Mock interrogator";

const REFERENCE_TEMPERATURE_C: f64 = 25.0;
const INTERROGATOR_CHANNELS: usize = 4;

/// How the chamber temperature responds to setpoint changes.
#[derive(Clone, Debug)]
pub enum ThermalBehavior {
    /// Fixed offsets from the setpoint, one per thermometer read.
    Scripted {
        /// Offset from the setpoint on each read after a change, °C.
        approach: Vec<f64>,
    },
    /// Exponential approach with uniform noise.
    FirstOrder {
        /// Time to cover 63 % of a step.
        time_constant: Duration,
        /// Peak noise amplitude, °C.
        noise_c: f64,
    },
}

/// One FBG inside the chamber.
#[derive(Clone, Debug)]
pub struct SimulatedSensor {
    /// Channel the sensor is read on.
    pub interrogator_channel: u8,
    /// Switch position in front of the sensor, if any.
    pub switch_position: Option<u8>,
    /// Bragg wavelength at 25 °C.
    pub base_wavelength_nm: f64,
    /// Wavelength shift per degree.
    pub sensitivity_pm_per_c: f64,
    /// Constant peak power.
    pub power_dbm: f64,
}

impl SimulatedSensor {
    /// Sensor with a typical 10 pm/°C response.
    pub fn new(interrogator_channel: u8, switch_position: Option<u8>, base_wavelength_nm: f64) -> Self {
        Self {
            interrogator_channel,
            switch_position,
            base_wavelength_nm,
            sensitivity_pm_per_c: 10.0,
            power_dbm: -10.0,
        }
    }

    /// Bragg wavelength at `temperature_c`.
    pub fn wavelength_at(&self, temperature_c: f64) -> f64 {
        self.base_wavelength_nm
            + self.sensitivity_pm_per_c / 1000.0 * (temperature_c - REFERENCE_TEMPERATURE_C)
    }
}

struct Chamber {
    behavior: ThermalBehavior,
    sensors: Vec<SimulatedSensor>,
    setpoint: Option<f64>,
    start_c: f64,
    changed_at: Instant,
    reads_since_change: usize,
    thermometer_reads: usize,
    oven_commands: Vec<OvenCommand>,
    switch_position: Option<u8>,
    switch_commands: Vec<u8>,
    read_faults: HashMap<&'static str, u32>,
    connect_refusals: HashMap<&'static str, u32>,
}

impl Chamber {
    fn temperature(&self) -> f64 {
        match (&self.behavior, self.setpoint) {
            (_, None) => self.start_c,
            (ThermalBehavior::Scripted { approach }, Some(setpoint)) => {
                setpoint + approach.get(self.reads_since_change).copied().unwrap_or(0.0)
            }
            (ThermalBehavior::FirstOrder { time_constant, .. }, Some(setpoint)) => {
                let tau = time_constant.as_secs_f64().max(f64::EPSILON);
                let elapsed = self.changed_at.elapsed().as_secs_f64();
                setpoint + (self.start_c - setpoint) * (-elapsed / tau).exp()
            }
        }
    }

    fn set_point(&mut self, value: f64) {
        // Re-sending the same setpoint does not restart the approach.
        if self.setpoint == Some(value) {
            return;
        }
        self.start_c = self.temperature();
        self.setpoint = Some(value);
        self.changed_at = Instant::now();
        self.reads_since_change = 0;
    }

    fn take_fault(map: &mut HashMap<&'static str, u32>, device: &'static str) -> bool {
        match map.get_mut(device) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Shared simulated test bench. Cloning shares the chamber.
#[derive(Clone)]
pub struct MockBench {
    chamber: Arc<Mutex<Chamber>>,
}

impl MockBench {
    /// Empty chamber at `start_c` with no setpoint.
    pub fn new(start_c: f64, behavior: ThermalBehavior) -> Self {
        Self {
            chamber: Arc::new(Mutex::new(Chamber {
                behavior,
                sensors: Vec::new(),
                setpoint: None,
                start_c,
                changed_at: Instant::now(),
                reads_since_change: 0,
                thermometer_reads: 0,
                oven_commands: Vec::new(),
                switch_position: None,
                switch_commands: Vec::new(),
                read_faults: HashMap::new(),
                connect_refusals: HashMap::new(),
            })),
        }
    }

    /// Deterministic bench: `approach[i]` is added to the setpoint on the i-th
    /// thermometer read after a setpoint change.
    pub fn scripted(start_c: f64, approach: Vec<f64>) -> Self {
        Self::new(start_c, ThermalBehavior::Scripted { approach })
    }

    /// Realistic bench with exponential settling.
    pub fn first_order(start_c: f64, time_constant: Duration, noise_c: f64) -> Self {
        Self::new(
            start_c,
            ThermalBehavior::FirstOrder {
                time_constant,
                noise_c,
            },
        )
    }

    fn lock(&self) -> MutexGuard<'_, Chamber> {
        self.chamber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Places a sensor in the chamber.
    pub fn add_sensor(&self, sensor: SimulatedSensor) -> &Self {
        self.lock().sensors.push(sensor);
        self
    }

    /// Hands out one of each device. The switch is only included when a sensor
    /// sits behind a switch position.
    pub fn devices(&self, switch_settle: Duration) -> DeviceSet {
        let switched = self.lock().sensors.iter().any(|s| s.switch_position.is_some());
        let devices = DeviceSet::new(
            Box::new(MockOven::new(self.clone())),
            Box::new(MockThermometer::new(self.clone())),
            Box::new(MockInterrogator::new(self.clone())),
        );
        if switched {
            devices.with_switch(Box::new(MockSwitch::new(self.clone(), switch_settle)))
        } else {
            devices
        }
    }

    /// Makes the next `count` reads (or commands) of `device` fail with a comm error.
    pub fn fail_reads(&self, device: &'static str, count: u32) {
        self.lock().read_faults.insert(device, count);
    }

    /// Makes the next `count` connects of `device` fail.
    pub fn refuse_connects(&self, device: &'static str, count: u32) {
        self.lock().connect_refusals.insert(device, count);
    }

    /// Every command the oven accepted.
    pub fn oven_commands(&self) -> Vec<OvenCommand> {
        self.lock().oven_commands.clone()
    }

    /// Setpoints sent so far, in order.
    pub fn setpoints(&self) -> Vec<f64> {
        self.oven_commands()
            .into_iter()
            .filter_map(|c| match c {
                OvenCommand::Setpoint(value) => Some(value),
                _ => None,
            })
            .collect()
    }

    /// Positions the switch was moved to.
    pub fn switch_commands(&self) -> Vec<u8> {
        self.lock().switch_commands.clone()
    }

    /// Total thermometer reads.
    pub fn thermometer_reads(&self) -> usize {
        self.lock().thermometer_reads
    }

    /// Noise-free chamber temperature.
    pub fn temperature(&self) -> f64 {
        self.lock().temperature()
    }

    fn check_connect(&self, device: &'static str) -> AppResult<()> {
        if Chamber::take_fault(&mut self.lock().connect_refusals, device) {
            return Err(DaqError::connect(device, "simulated refusal"));
        }
        Ok(())
    }

    fn check_fault(&self, device: &'static str) -> AppResult<()> {
        if Chamber::take_fault(&mut self.lock().read_faults, device) {
            return Err(DaqError::comm(device, "simulated bus fault"));
        }
        Ok(())
    }
}

/// Oven backed by the bench chamber.
pub struct MockOven {
    name: &'static str,
    bench: MockBench,
    status: OvenStatus,
    connected: bool,
}

impl MockOven {
    /// Attached to `bench`.
    pub fn new(bench: MockBench) -> Self {
        Self {
            name: OVEN,
            bench,
            status: OvenStatus::default(),
            connected: false,
        }
    }
}

#[async_trait]
impl DeviceChannel for MockOven {
    type Reading = OvenStatus;
    type Command = OvenCommand;

    fn name(&self) -> &str {
        self.name
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> AppResult<()> {
        if !self.connected {
            self.bench.check_connect(self.name)?;
            self.connected = true;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read(&mut self) -> AppResult<OvenStatus> {
        Ok(self.status)
    }

    async fn command(&mut self, value: OvenCommand) -> AppResult<()> {
        self.bench.check_fault(self.name)?;
        let mut chamber = self.bench.lock();
        chamber.oven_commands.push(value);
        if let OvenCommand::Setpoint(target) = value {
            chamber.set_point(target);
        }
        self.status.apply(value);
        Ok(())
    }
}

/// Thermometer reporting the chamber temperature.
pub struct MockThermometer {
    name: &'static str,
    bench: MockBench,
    connected: bool,
}

impl MockThermometer {
    /// Attached to `bench`.
    pub fn new(bench: MockBench) -> Self {
        Self {
            name: THERMOMETER,
            bench,
            connected: false,
        }
    }
}

#[async_trait]
impl DeviceChannel for MockThermometer {
    type Reading = f64;
    type Command = Infallible;

    fn name(&self) -> &str {
        self.name
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> AppResult<()> {
        if !self.connected {
            self.bench.check_connect(self.name)?;
            self.connected = true;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read(&mut self) -> AppResult<f64> {
        self.bench.check_fault(self.name)?;
        let mut chamber = self.bench.lock();
        let mut value = chamber.temperature();
        chamber.reads_since_change += 1;
        chamber.thermometer_reads += 1;
        if let ThermalBehavior::FirstOrder { noise_c, .. } = &chamber.behavior {
            let noise_c = *noise_c;
            if noise_c > 0.0 {
                value += rand::thread_rng().gen_range(-noise_c..=noise_c);
            }
        }
        Ok(value)
    }

    async fn command(&mut self, value: Infallible) -> AppResult<()> {
        match value {}
    }
}

/// Switch selecting which sensors the interrogator sees.
pub struct MockSwitch {
    name: &'static str,
    bench: MockBench,
    settle: Duration,
    switched_at: Option<Instant>,
    connected: bool,
}

impl MockSwitch {
    /// Attached to `bench`, settling for `settle` after each move.
    pub fn new(bench: MockBench, settle: Duration) -> Self {
        Self {
            name: SWITCH,
            bench,
            settle,
            switched_at: None,
            connected: false,
        }
    }
}

#[async_trait]
impl DeviceChannel for MockSwitch {
    type Reading = u8;
    type Command = u8;

    fn name(&self) -> &str {
        self.name
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> AppResult<()> {
        if !self.connected {
            self.bench.check_connect(self.name)?;
            self.connected = true;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read(&mut self) -> AppResult<u8> {
        let position = self
            .bench
            .lock()
            .switch_position
            .ok_or_else(|| DaqError::comm(self.name, "no position selected"))?;
        if let Some(at) = self.switched_at {
            tokio::time::sleep_until(at + self.settle).await;
        }
        Ok(position)
    }

    async fn command(&mut self, position: u8) -> AppResult<()> {
        self.bench.check_fault(self.name)?;
        let mut chamber = self.bench.lock();
        chamber.switch_position = Some(position);
        chamber.switch_commands.push(position);
        self.switched_at = Some(Instant::now());
        Ok(())
    }
}

/// Interrogator reporting the visible sensors.
pub struct MockInterrogator {
    name: &'static str,
    bench: MockBench,
    connected: bool,
}

impl MockInterrogator {
    /// Attached to `bench`.
    pub fn new(bench: MockBench) -> Self {
        Self {
            name: INTERROGATOR,
            bench,
            connected: false,
        }
    }
}

#[async_trait]
impl DeviceChannel for MockInterrogator {
    type Reading = PeakScan;
    type Command = Infallible;

    fn name(&self) -> &str {
        self.name
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> AppResult<()> {
        if !self.connected {
            self.bench.check_connect(self.name)?;
            self.connected = true;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read(&mut self) -> AppResult<PeakScan> {
        self.bench.check_fault(self.name)?;
        let chamber = self.bench.lock();
        let temperature = chamber.temperature();
        let mut channels = vec![Vec::new(); INTERROGATOR_CHANNELS];
        let visible = chamber.sensors.iter().filter(|s| {
            s.switch_position.is_none() || s.switch_position == chamber.switch_position
        });
        for sensor in visible {
            if let Some(peaks) = channels.get_mut(usize::from(sensor.interrogator_channel).wrapping_sub(1)) {
                peaks.push((sensor.wavelength_at(temperature), sensor.power_dbm));
            }
        }
        Ok(PeakScan { channels })
    }

    async fn command(&mut self, value: Infallible) -> AppResult<()> {
        match value {}
    }
}
