//! Instrument drivers and the device contract used by the control loop.
//!
//! Every physical instrument is exposed through [`DeviceChannel`]: a typed
//! connect/disconnect/read/command surface that owns its bus handle. The
//! associated types pin down what each instrument reads and accepts:
//!
//! | Instrument | `Reading` | `Command` |
//! |---|---|---|
//! | Oven | [`OvenStatus`] | [`OvenCommand`] |
//! | Temperature controller | `f64` (°C) | none |
//! | Optical switch | selected position | position to select |
//! | Interrogator | [`PeakScan`] | none |
//!
//! A [`DeviceSet`] groups one of each and is moved into a runner, which owns
//! it exclusively for the lifetime of the program.

pub mod delta_oven;
pub mod lakeshore;
pub mod mock;
pub mod optical_switch;
pub mod sm125;

use crate::adapters::build_transport;
use crate::config::DevicesConfig;
use crate::core::PeakScan;
use crate::error::AppResult;
use async_trait::async_trait;
use std::convert::Infallible;
use std::fmt::Debug;
use tracing::info;

pub use delta_oven::DeltaOven;
pub use lakeshore::LakeShore;
pub use optical_switch::OpticalSwitch;
pub use sm125::Sm125;

/// Typed abstraction over one physical instrument.
///
/// Drivers never retry on their own; transient faults surface as
/// [`DaqError::Comm`](crate::error::DaqError::Comm) and the caller decides.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    /// What one `read` returns.
    type Reading: Send + 'static;
    /// What `command` accepts. `Infallible` for read-only devices.
    type Command: Clone + Debug + Send + 'static;

    /// Name used in messages and errors.
    fn name(&self) -> &str;

    /// Whether the bus is open.
    fn is_connected(&self) -> bool;

    /// Opens the bus and checks that the instrument answers. Idempotent.
    async fn connect(&mut self) -> AppResult<()>;

    /// Best-effort release of the bus. Idempotent, logs instead of failing.
    async fn disconnect(&mut self);

    /// Takes one reading.
    async fn read(&mut self) -> AppResult<Self::Reading>;

    /// Sends one command and waits for the instrument to accept it.
    async fn command(&mut self, value: Self::Command) -> AppResult<()>;
}

/// Actuation accepted by an oven.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OvenCommand {
    /// Setpoint in °C.
    Setpoint(f64),
    /// Heater power on or off.
    Heater(bool),
    /// Coolant valve open or closed.
    Cooling(bool),
}

/// Last acknowledged oven state.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OvenStatus {
    /// Last acknowledged setpoint, °C.
    pub setpoint_c: Option<f64>,
    /// Heater power state.
    pub heater_on: bool,
    /// Coolant valve state.
    pub cooling_on: bool,
}

impl OvenStatus {
    pub(crate) fn apply(&mut self, command: OvenCommand) {
        match command {
            OvenCommand::Setpoint(value) => self.setpoint_c = Some(value),
            OvenCommand::Heater(on) => self.heater_on = on,
            OvenCommand::Cooling(on) => self.cooling_on = on,
        }
    }
}

/// Oven controller.
pub type OvenDevice = Box<dyn DeviceChannel<Reading = OvenStatus, Command = OvenCommand>>;
/// Chamber temperature sensor, °C.
pub type ThermometerDevice = Box<dyn DeviceChannel<Reading = f64, Command = Infallible>>;
/// Optical switch; reads and sets the position.
pub type SwitchDevice = Box<dyn DeviceChannel<Reading = u8, Command = u8>>;
/// FBG interrogator.
pub type InterrogatorDevice = Box<dyn DeviceChannel<Reading = PeakScan, Command = Infallible>>;

/// The instruments one program needs.
pub struct DeviceSet {
    /// Drives the chamber temperature.
    pub oven: OvenDevice,
    /// Reference temperature of the chamber.
    pub thermometer: ThermometerDevice,
    /// Reads the sensor peaks.
    pub interrogator: InterrogatorDevice,
    /// Routes shared sensors to one interrogator channel.
    pub switch: Option<SwitchDevice>,
}

impl DeviceSet {
    /// A set without optical switch.
    pub fn new(
        oven: OvenDevice,
        thermometer: ThermometerDevice,
        interrogator: InterrogatorDevice,
    ) -> Self {
        Self {
            oven,
            thermometer,
            interrogator,
            switch: None,
        }
    }

    /// Adds the optical switch.
    pub fn with_switch(mut self, switch: SwitchDevice) -> Self {
        self.switch = Some(switch);
        self
    }

    /// Builds the real drivers described by the settings file.
    pub fn from_config(config: &DevicesConfig) -> AppResult<Self> {
        let timeout = config.reply_timeout;
        let oven = DeltaOven::new(build_transport(&config.oven)?, timeout);
        let thermometer = LakeShore::new(
            build_transport(&config.temperature_controller)?,
            config.temperature_input,
            timeout,
        );
        let interrogator = Sm125::new(build_transport(&config.interrogator)?, timeout);

        let mut devices = Self::new(Box::new(oven), Box::new(thermometer), Box::new(interrogator));
        if let Some(switch) = &config.switch {
            devices = devices.with_switch(Box::new(OpticalSwitch::new(
                build_transport(&switch.bus)?,
                switch.positions,
                switch.settle,
            )));
        }
        Ok(devices)
    }

    /// Names of every device in the set, in connect order.
    pub fn names(&self) -> Vec<String> {
        let mut names = vec![
            self.oven.name().to_string(),
            self.thermometer.name().to_string(),
            self.interrogator.name().to_string(),
        ];
        if let Some(switch) = &self.switch {
            names.push(switch.name().to_string());
        }
        names
    }

    /// Disconnects everything. Never fails; drivers log their own problems.
    pub async fn disconnect_all(&mut self) {
        self.oven.disconnect().await;
        self.thermometer.disconnect().await;
        self.interrogator.disconnect().await;
        if let Some(switch) = self.switch.as_mut() {
            switch.disconnect().await;
        }
        info!("all devices disconnected");
    }

    /// Whether at least one device still holds its bus.
    pub fn any_connected(&self) -> bool {
        self.oven.is_connected()
            || self.thermometer.is_connected()
            || self.interrogator.is_connected()
            || self.switch.as_ref().is_some_and(|s| s.is_connected())
    }
}
