//! Byte-oriented bus transports
//!
//! This module contains implementations of the [`Transport`] trait, the
//! low-level I/O abstraction that instrument drivers are written against.
//! Drivers decide what to send; transports only move bytes and enforce the
//! read deadline they are given.

pub mod mock;
pub mod serial_adapter;
pub mod tcp_adapter;

pub use mock::MockTransport;
pub use serial_adapter::SerialTransport;
pub use tcp_adapter::TcpTransport;

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// A bidirectional byte bus to one instrument.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human readable endpoint, e.g. `serial:///dev/ttyUSB0` or `tcp://10.0.0.122:50000`.
    fn describe(&self) -> String;

    /// Opens the underlying port or socket. Opening twice is a no-op.
    async fn open(&mut self) -> AppResult<()>;

    /// Releases the port or socket. Never fails.
    async fn close(&mut self);

    /// Writes the whole frame.
    async fn write_all(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Reads until `delimiter` (inclusive) or until `limit` elapses.
    async fn read_until(&mut self, delimiter: u8, limit: Duration) -> AppResult<Vec<u8>>;

    /// Reads exactly `len` bytes or fails when `limit` elapses.
    async fn read_exact(&mut self, len: usize, limit: Duration) -> AppResult<Vec<u8>>;
}

/// Where an instrument is attached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusConfig {
    /// Serial port, opened 8N1 without flow control.
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
        port: String,
        /// Defaults to 9600.
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// Raw TCP socket.
    Tcp {
        /// `host:port`
        address: String,
    },
}

fn default_baud_rate() -> u32 {
    9600
}

/// Builds the transport described by `config`.
pub fn build_transport(config: &BusConfig) -> AppResult<Box<dyn Transport>> {
    match config {
        BusConfig::Serial { port, baud_rate } => {
            if cfg!(feature = "instrument_serial") {
                Ok(Box::new(SerialTransport::new(port.clone(), *baud_rate)))
            } else {
                Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
            }
        }
        BusConfig::Tcp { address } => Ok(Box::new(TcpTransport::new(address.clone()))),
    }
}

/// Sends a terminated command and returns the trimmed reply line.
pub async fn query_line(
    transport: &mut dyn Transport,
    command: &str,
    terminator: &str,
    limit: Duration,
) -> AppResult<String> {
    send_line(transport, command, terminator).await?;
    let raw = transport.read_until(b'\n', limit).await?;
    let reply = String::from_utf8_lossy(&raw).trim().to_string();
    debug!(endpoint = %transport.describe(), command, reply = %reply, "query");
    Ok(reply)
}

/// Sends a terminated command without waiting for a reply.
pub async fn send_line(
    transport: &mut dyn Transport,
    command: &str,
    terminator: &str,
) -> AppResult<()> {
    let framed = format!("{command}{terminator}");
    transport.write_all(framed.as_bytes()).await
}
