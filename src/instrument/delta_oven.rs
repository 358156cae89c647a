//! Delta Design oven driver
//!
//! Line protocol, one acknowledged reply per command:
//!
//! ```text
//! S 75.0   -> setpoint in °C
//! H ON     -> heater on  (H OFF)
//! C ON     -> cooling on (C OFF)
//! ```

use super::{DeviceChannel, OvenCommand, OvenStatus};
use crate::adapters::{query_line, Transport};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

const TERMINATOR: &str = "\n";

/// Delta Design 9023 oven controller.
pub struct DeltaOven {
    name: String,
    transport: Box<dyn Transport>,
    reply_timeout: Duration,
    status: OvenStatus,
    connected: bool,
}

impl DeltaOven {
    /// Driver over `transport`; nothing is opened yet.
    pub fn new(transport: Box<dyn Transport>, reply_timeout: Duration) -> Self {
        Self {
            name: "Delta oven".to_string(),
            transport,
            reply_timeout,
            status: OvenStatus::default(),
            connected: false,
        }
    }

    fn encode(command: OvenCommand) -> String {
        fn on_off(on: bool) -> &'static str {
            if on {
                "ON"
            } else {
                "OFF"
            }
        }
        match command {
            OvenCommand::Setpoint(value) => format!("S {value:.1}"),
            OvenCommand::Heater(on) => format!("H {}", on_off(on)),
            OvenCommand::Cooling(on) => format!("C {}", on_off(on)),
        }
    }
}

#[async_trait]
impl DeviceChannel for DeltaOven {
    type Reading = OvenStatus;
    type Command = OvenCommand;

    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> AppResult<()> {
        if self.connected {
            return Ok(());
        }
        self.transport
            .open()
            .await
            .map_err(|e| e.for_device(&self.name))?;
        self.connected = true;
        debug!(device = %self.name, endpoint = %self.transport.describe(), "connected");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        // Leave the chamber safe; failures are only logged.
        for command in [OvenCommand::Heater(false), OvenCommand::Cooling(false)] {
            let line = Self::encode(command);
            if let Err(e) =
                query_line(self.transport.as_mut(), &line, TERMINATOR, self.reply_timeout).await
            {
                warn!(device = %self.name, error = %e, "could not switch off before disconnect");
            }
        }
        self.transport.close().await;
        self.connected = false;
    }

    async fn read(&mut self) -> AppResult<OvenStatus> {
        Ok(self.status)
    }

    async fn command(&mut self, value: OvenCommand) -> AppResult<()> {
        if !self.connected {
            return Err(DaqError::comm(&self.name, "not connected"));
        }
        let line = Self::encode(value);
        let reply = query_line(self.transport.as_mut(), &line, TERMINATOR, self.reply_timeout)
            .await
            .map_err(|e| e.for_device(&self.name))?;
        if reply.contains('?') || reply.to_ascii_uppercase().contains("ERR") {
            return Err(DaqError::comm(
                &self.name,
                format!("command '{line}' rejected: {reply}"),
            ));
        }
        self.status.apply(value);
        Ok(())
    }
}
