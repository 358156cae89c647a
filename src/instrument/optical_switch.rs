//! Multi-channel optical switch (OSW series).
//!
//! `command(position)` routes exactly one input to the interrogator; selecting a
//! new position implicitly deselects the previous one. `read()` returns the
//! selected position, but not before `settle` has elapsed since the last
//! switch command, so the next optical scan sees a settled path.

use super::DeviceChannel;
use crate::adapters::{send_line, Transport};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Serial optical switch with numbered positions.
pub struct OpticalSwitch {
    name: String,
    transport: Box<dyn Transport>,
    positions: u8,
    settle: Duration,
    selected: Option<u8>,
    switched_at: Option<Instant>,
    connected: bool,
}

impl OpticalSwitch {
    /// Switch with `positions` outputs that needs `settle` after each move.
    pub fn new(transport: Box<dyn Transport>, positions: u8, settle: Duration) -> Self {
        Self {
            name: "Optical switch".to_string(),
            transport,
            positions,
            settle,
            selected: None,
            switched_at: None,
            connected: false,
        }
    }

    fn encode(position: u8) -> String {
        format!("<OSW01_OUT_{position:02}>")
    }
}

#[async_trait]
impl DeviceChannel for OpticalSwitch {
    type Reading = u8;
    type Command = u8;

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
        self.selected = None;
        debug!(device = %self.name, positions = self.positions, "connected");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.transport.close().await;
            self.connected = false;
            self.selected = None;
            self.switched_at = None;
        }
    }

    async fn read(&mut self) -> AppResult<u8> {
        let position = self
            .selected
            .ok_or_else(|| DaqError::comm(&self.name, "no position selected"))?;
        if let Some(at) = self.switched_at {
            tokio::time::sleep_until(at + self.settle).await;
        }
        Ok(position)
    }

    async fn command(&mut self, position: u8) -> AppResult<()> {
        if !self.connected {
            return Err(DaqError::comm(&self.name, "not connected"));
        }
        if position == 0 || position > self.positions {
            return Err(DaqError::comm(
                &self.name,
                format!("position {position} outside 1..={}", self.positions),
            ));
        }
        // Drop the old selection first so a failed write never leaves a stale one.
        self.selected = None;
        send_line(self.transport.as_mut(), &Self::encode(position), "")
            .await
            .map_err(|e| e.for_device(&self.name))?;
        self.selected = Some(position);
        self.switched_at = Some(Instant::now());
        Ok(())
    }
}
