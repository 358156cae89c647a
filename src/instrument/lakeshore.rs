//! LakeShore 340 temperature controller (read-only use).
//!
//! The controller reports Kelvin via `KRDG? <input>`; readings leave this
//! driver in °C.

use super::DeviceChannel;
use crate::adapters::{query_line, Transport};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::convert::Infallible;
use std::time::Duration;
use tracing::debug;

const TERMINATOR: &str = "\n";
const KELVIN_OFFSET: f64 = 273.15;

/// LakeShore temperature controller, read on one input.
pub struct LakeShore {
    name: String,
    transport: Box<dyn Transport>,
    input: char,
    reply_timeout: Duration,
    connected: bool,
}

impl LakeShore {
    /// Reads `input` (A to D) once connected.
    pub fn new(transport: Box<dyn Transport>, input: char, reply_timeout: Duration) -> Self {
        Self {
            name: "LakeShore 340".to_string(),
            transport,
            input,
            reply_timeout,
            connected: false,
        }
    }

    async fn query_kelvin(&mut self) -> AppResult<f64> {
        let command = format!("KRDG? {}", self.input);
        let reply = query_line(self.transport.as_mut(), &command, TERMINATOR, self.reply_timeout)
            .await
            .map_err(|e| e.for_device(&self.name))?;
        parse_kelvin(&reply).ok_or_else(|| {
            DaqError::comm(&self.name, format!("malformed temperature reply '{reply}'"))
        })
    }
}

fn parse_kelvin(reply: &str) -> Option<f64> {
    let value: f64 = reply.trim().trim_start_matches('+').parse().ok()?;
    // 0 K is what the controller reports for an open sensor input.
    (value.is_finite() && value > 0.0).then_some(value)
}

#[async_trait]
impl DeviceChannel for LakeShore {
    type Reading = f64;
    type Command = Infallible;

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
        match self.query_kelvin().await {
            Ok(kelvin) => {
                self.connected = true;
                debug!(device = %self.name, kelvin, "connected");
                Ok(())
            }
            Err(e) => {
                self.transport.close().await;
                Err(DaqError::connect(&self.name, e.to_string()))
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.transport.close().await;
            self.connected = false;
        }
    }

    async fn read(&mut self) -> AppResult<f64> {
        if !self.connected {
            return Err(DaqError::comm(&self.name, "not connected"));
        }
        Ok(self.query_kelvin().await? - KELVIN_OFFSET)
    }

    async fn command(&mut self, value: Infallible) -> AppResult<()> {
        match value {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    #[test]
    fn test_parse_kelvin() {
        assert_eq!(parse_kelvin("+298.150"), Some(298.15));
        assert_eq!(parse_kelvin(" 77.3 "), Some(77.3));
        assert_eq!(parse_kelvin("+0.000"), None);
        assert_eq!(parse_kelvin("OVER"), None);
    }

    #[tokio::test]
    async fn test_read_converts_to_celsius() {
        let transport = MockTransport::new("lakeshore");
        let handle = transport.handle();
        handle.respond_with(|_| Some(b"+348.150\r\n".to_vec()));
        let mut thermometer = LakeShore::new(Box::new(transport), 'B', Duration::from_secs(1));

        thermometer.connect().await.unwrap();
        let celsius = thermometer.read().await.unwrap();
        assert!((celsius - 75.0).abs() < 1e-9);
        assert_eq!(handle.written()[0], b"KRDG? B\n".to_vec());
    }

    #[tokio::test]
    async fn test_silent_controller_fails_connect() {
        let transport = MockTransport::new("lakeshore");
        let handle = transport.handle();
        let mut thermometer = LakeShore::new(Box::new(transport), 'A', Duration::from_secs(1));

        let err = thermometer.connect().await.unwrap_err();
        assert!(matches!(err, DaqError::DeviceConnect { ref device, .. } if device == "LakeShore 340"));
        assert!(!thermometer.is_connected());
        assert!(!handle.is_open());
    }
}
