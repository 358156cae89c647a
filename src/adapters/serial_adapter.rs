//! RS-232 transport
//!
//! This adapter wraps the serialport crate and provides async I/O using
//! Tokio's blocking task executor for the synchronous serial operations.

use super::Transport;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Internal read timeout of the OS port; the overall deadline is enforced per call.
#[cfg(feature = "instrument_serial")]
const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// [`Transport`] over a serial port.
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// The actual serial port (behind Arc<Mutex> for access from blocking tasks)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Create a new serial transport; the port is opened by [`Transport::open`].
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> AppResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| DaqError::comm(self.describe(), "serial port not open"))
    }

    /// Reads from the port until `done` accepts the buffer or `limit` elapses.
    #[cfg(feature = "instrument_serial")]
    async fn read_while(
        &mut self,
        limit: Duration,
        done: impl Fn(&[u8]) -> bool + Send + 'static,
    ) -> AppResult<Vec<u8>> {
        let port = self.port()?;
        let endpoint = self.describe();

        tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
            use std::io::Read;

            let mut port_guard = port.blocking_lock();
            let mut response = Vec::new();
            let mut buffer = [0u8; 1];
            let start = std::time::Instant::now();

            while !done(&response) {
                if start.elapsed() > limit {
                    return Err(DaqError::comm(
                        &endpoint,
                        format!("serial read timeout after {limit:?}"),
                    ));
                }
                match port_guard.read(&mut buffer) {
                    Ok(0) => {
                        return Err(DaqError::comm(&endpoint, "unexpected EOF"));
                    }
                    Ok(_) => response.push(buffer[0]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(DaqError::comm(&endpoint, e.to_string())),
                }
            }
            Ok(response)
        })
        .await
        .map_err(|e| DaqError::comm(self.describe(), format!("serial I/O task failed: {e}")))?
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn describe(&self) -> String {
        format!("serial://{}", self.port_name)
    }

    async fn open(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.is_some() {
                return Ok(());
            }
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(PORT_POLL_TIMEOUT)
                .open()
                .map_err(|e| {
                    DaqError::connect(
                        self.describe(),
                        format!("failed to open at {} baud: {e}", self.baud_rate),
                    )
                })?;
            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(port = %self.port_name, baud = self.baud_rate, "serial port opened");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = self.baud_rate;
            Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn close(&mut self) {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!(port = %self.port_name, "serial port closed");
            }
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let endpoint = self.describe();
            let frame = bytes.to_vec();

            tokio::task::spawn_blocking(move || -> AppResult<()> {
                use std::io::Write;

                let mut port_guard = port.blocking_lock();
                port_guard
                    .write_all(&frame)
                    .and_then(|_| port_guard.flush())
                    .map_err(|e| DaqError::comm(&endpoint, e.to_string()))
            })
            .await
            .map_err(|e| DaqError::comm(self.describe(), format!("serial I/O task failed: {e}")))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = bytes;
            Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn read_until(&mut self, delimiter: u8, limit: Duration) -> AppResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            self.read_while(limit, move |buf| buf.last() == Some(&delimiter))
                .await
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (delimiter, limit);
            Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn read_exact(&mut self, len: usize, limit: Duration) -> AppResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            self.read_while(limit, move |buf| buf.len() >= len).await
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (len, limit);
            Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_transport_creation() {
        let transport = SerialTransport::new("/dev/ttyUSB0".to_string(), 9600);
        assert_eq!(transport.describe(), "serial:///dev/ttyUSB0");
        assert_eq!(transport.baud_rate, 9600);
    }

    #[tokio::test]
    async fn test_write_before_open_fails() {
        let mut transport = SerialTransport::new("COM3".to_string(), 115200);
        assert!(transport.write_all(b"H ON\n").await.is_err());
    }
}
