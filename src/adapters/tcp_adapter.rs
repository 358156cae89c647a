//! TCP transport for Ethernet attached instruments (interrogator, optical switch,
//! GPIB gateways).

use super::Transport;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

/// [`Transport`] over a TCP socket.
pub struct TcpTransport {
    /// `host:port`
    address: String,
    stream: Option<BufStream<TcpStream>>,
}

impl TcpTransport {
    /// Unconnected transport for `host:port`.
    pub fn new(address: String) -> Self {
        Self {
            address,
            stream: None,
        }
    }

    fn stream(&mut self) -> AppResult<&mut BufStream<TcpStream>> {
        let endpoint = self.describe();
        self.stream
            .as_mut()
            .ok_or_else(|| DaqError::comm(endpoint, "socket not connected"))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }

    async fn open(&mut self) -> AppResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let socket = TcpStream::connect(&self.address)
            .await
            .map_err(|e| DaqError::connect(self.describe(), e.to_string()))?;
        socket
            .set_nodelay(true)
            .map_err(|e| DaqError::connect(self.describe(), e.to_string()))?;
        self.stream = Some(BufStream::new(socket));
        debug!(endpoint = %self.describe(), "socket opened");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(endpoint = %self.describe(), error = %e, "socket shutdown failed");
            }
        }
    }

    async fn write_all(&mut self, bytes: &[u8]) -> AppResult<()> {
        let endpoint = self.describe();
        let stream = self.stream()?;
        stream
            .write_all(bytes)
            .await
            .map_err(|e| DaqError::comm(&endpoint, e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| DaqError::comm(&endpoint, e.to_string()))
    }

    async fn read_until(&mut self, delimiter: u8, limit: Duration) -> AppResult<Vec<u8>> {
        let endpoint = self.describe();
        let stream = self.stream()?;
        let mut buffer = Vec::new();
        match tokio::time::timeout(limit, stream.read_until(delimiter, &mut buffer)).await {
            Ok(Ok(0)) => Err(DaqError::comm(endpoint, "connection closed by peer")),
            Ok(Ok(_)) => Ok(buffer),
            Ok(Err(e)) => Err(DaqError::comm(endpoint, e.to_string())),
            Err(_) => Err(DaqError::comm(endpoint, format!("read timeout after {limit:?}"))),
        }
    }

    async fn read_exact(&mut self, len: usize, limit: Duration) -> AppResult<Vec<u8>> {
        let endpoint = self.describe();
        let stream = self.stream()?;
        let mut buffer = vec![0u8; len];
        match tokio::time::timeout(limit, stream.read_exact(&mut buffer)).await {
            Ok(Ok(_)) => Ok(buffer),
            Ok(Err(e)) => Err(DaqError::comm(endpoint, e.to_string())),
            Err(_) => Err(DaqError::comm(endpoint, format!("read timeout after {limit:?}"))),
        }
    }
}
