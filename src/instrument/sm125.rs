//! Micron Optics SM125 interrogator, built-in peak detection.
//!
//! `#GET_PEAKS_AND_LEVELS` answers with a 10 byte ASCII length prefix and a
//! little-endian binary payload:
//!
//! ```text
//! offset  0  u32 timestamp seconds
//! offset  4  u32 timestamp microseconds
//! offset  8  u32 serial number
//! offset 12  u16 x4 peak count per channel
//! offset 32  i32 x total  wavelengths, pm / 10
//!            i16 x total  levels, dBm * 100
//! ```
//!
//! The reply has no request id. An exchange cut short by a timeout, or by
//! the caller dropping the read, may still deliver its frame later, so the
//! next scan reopens the connection before asking again.

use super::DeviceChannel;
use crate::adapters::Transport;
use crate::core::PeakScan;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use bytes::Buf;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, trace};

const REQUEST: &[u8] = b"#GET_PEAKS_AND_LEVELS";
const LENGTH_PREFIX: usize = 10;
const HEADER_LEN: usize = 20;
const PEAK_OFFSET: usize = 32;
const CHANNELS: usize = 4;
const WAVELENGTH_SCALE: f64 = 10_000.0;
const LEVEL_SCALE: f64 = 100.0;
/// Sanity bound for the length prefix.
const MAX_PAYLOAD: usize = 64 * 1024;

/// Micron Optics SM125 interrogator over TCP.
pub struct Sm125 {
    name: String,
    transport: Box<dyn Transport>,
    reply_timeout: Duration,
    connected: bool,
    /// Set while a request is unanswered.
    in_flight: bool,
}

impl Sm125 {
    /// Driver over `transport`; nothing is opened yet.
    pub fn new(transport: Box<dyn Transport>, reply_timeout: Duration) -> Self {
        Self {
            name: "SM125".to_string(),
            transport,
            reply_timeout,
            connected: false,
            in_flight: false,
        }
    }

    async fn scan(&mut self) -> AppResult<PeakScan> {
        if self.in_flight {
            self.resync().await?;
        }
        self.in_flight = true;
        self.transport.write_all(REQUEST).await?;
        let prefix = self
            .transport
            .read_exact(LENGTH_PREFIX, self.reply_timeout)
            .await?;
        let len = parse_length(&prefix)
            .ok_or_else(|| DaqError::comm(&self.name, "malformed length prefix"))?;
        let payload = self.transport.read_exact(len, self.reply_timeout).await?;
        // The whole frame is consumed, the stream is aligned again.
        self.in_flight = false;
        parse_peaks(&payload).map_err(|reason| DaqError::comm(&self.name, reason))
    }

    /// Drops whatever the previous exchange left on the bus.
    async fn resync(&mut self) -> AppResult<()> {
        debug!(device = %self.name, "reopening after an interrupted exchange");
        self.transport.close().await;
        self.transport
            .open()
            .await
            .map_err(|e| DaqError::comm(&self.name, e.to_string()))?;
        self.in_flight = false;
        Ok(())
    }
}

fn parse_length(prefix: &[u8]) -> Option<usize> {
    let len: usize = std::str::from_utf8(prefix).ok()?.trim().parse().ok()?;
    (len <= MAX_PAYLOAD).then_some(len)
}

/// Decodes a peaks-and-levels payload (without the length prefix).
pub fn parse_peaks(payload: &[u8]) -> Result<PeakScan, String> {
    if payload.len() < HEADER_LEN {
        return Err(format!("payload too short: {} bytes", payload.len()));
    }
    let mut header = &payload[..HEADER_LEN];
    let seconds = header.get_u32_le();
    let micros = header.get_u32_le();
    let serial = header.get_u32_le();
    let counts: Vec<usize> = (0..CHANNELS).map(|_| usize::from(header.get_u16_le())).collect();
    let total: usize = counts.iter().sum();
    trace!(seconds, micros, serial, ?counts, "sm125 header");

    let needed = PEAK_OFFSET + 6 * total;
    if payload.len() < needed {
        return Err(format!(
            "payload holds {} bytes, {total} peaks need {needed}",
            payload.len()
        ));
    }

    let mut wavelengths = &payload[PEAK_OFFSET..PEAK_OFFSET + 4 * total];
    let mut levels = &payload[PEAK_OFFSET + 4 * total..needed];
    let channels = counts
        .iter()
        .map(|&count| {
            (0..count)
                .map(|_| {
                    let wavelength = f64::from(wavelengths.get_i32_le()) / WAVELENGTH_SCALE;
                    let level = f64::from(levels.get_i16_le()) / LEVEL_SCALE;
                    (wavelength, level)
                })
                .collect()
        })
        .collect();
    Ok(PeakScan { channels })
}

#[async_trait]
impl DeviceChannel for Sm125 {
    type Reading = PeakScan;
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
        self.in_flight = false;
        match self.scan().await {
            Ok(scan) => {
                self.connected = true;
                let peaks: Vec<usize> = scan.channels.iter().map(Vec::len).collect();
                debug!(device = %self.name, ?peaks, "connected");
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
            self.in_flight = false;
        }
    }

    async fn read(&mut self) -> AppResult<PeakScan> {
        if !self.connected {
            return Err(DaqError::comm(&self.name, "not connected"));
        }
        self.scan().await.map_err(|e| e.for_device(&self.name))
    }

    async fn command(&mut self, value: Infallible) -> AppResult<()> {
        match value {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use bytes::BufMut;

    fn frame(peaks: [&[(i32, i16)]; 4]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.put_u32_le(1_700_000_000);
        payload.put_u32_le(250_000);
        payload.put_u32_le(1234);
        for channel in &peaks {
            payload.put_u16_le(channel.len() as u16);
        }
        payload.resize(PEAK_OFFSET, 0);
        for channel in &peaks {
            for (wavelength, _) in channel.iter() {
                payload.put_i32_le(*wavelength);
            }
        }
        for channel in &peaks {
            for (_, level) in channel.iter() {
                payload.put_i16_le(*level);
            }
        }
        let mut framed = format!("{:>10}", payload.len()).into_bytes();
        framed.extend(payload);
        framed
    }

    #[test]
    fn test_parse_peaks_by_channel() {
        let raw = frame([
            &[(15_501_234, -1_250)],
            &[],
            &[(15_400_000, -900), (15_600_000, -875)],
            &[],
        ]);
        let scan = parse_peaks(&raw[LENGTH_PREFIX..]).unwrap();

        assert_eq!(scan.channels.len(), 4);
        assert_eq!(scan.first_peak(1), Some((1550.1234, -12.5)));
        assert_eq!(scan.first_peak(2), None);
        assert_eq!(scan.channels[2], vec![(1540.0, -9.0), (1560.0, -8.75)]);
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let raw = frame([&[(15_501_234, -1_250)], &[], &[], &[]]);
        let payload = &raw[LENGTH_PREFIX..raw.len() - 1];
        assert!(parse_peaks(payload).is_err());
        assert!(parse_peaks(&payload[..12]).is_err());
    }

    #[tokio::test]
    async fn test_read_over_transport() {
        let transport = MockTransport::new("sm125");
        let handle = transport.handle();
        let reply = frame([&[(15_480_000, -1_000)], &[], &[], &[]]);
        handle.respond_with(move |_| Some(reply.clone()));

        let mut interrogator = Sm125::new(Box::new(transport), Duration::from_secs(1));
        interrogator.connect().await.unwrap();
        let scan = interrogator.read().await.unwrap();

        assert_eq!(scan.first_peak(1), Some((1548.0, -10.0)));
        assert_eq!(handle.written().len(), 2);
        assert_eq!(handle.written()[1], REQUEST.to_vec());
    }

    #[tokio::test]
    async fn test_late_reply_is_discarded_after_timeout() {
        use crate::adapters::TcpTransport;
        use std::sync::atomic::{AtomicI32, Ordering};
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let requests = Arc::new(AtomicI32::new(0));
        let server_requests = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let requests = server_requests.clone();
                tokio::spawn(async move {
                    let mut request = [0u8; REQUEST.len()];
                    while socket.read_exact(&mut request).await.is_ok() {
                        // Request n answers with a peak at 1500 + n nm.
                        let n = requests.fetch_add(1, Ordering::SeqCst) + 1;
                        if n == 2 {
                            tokio::time::sleep(Duration::from_millis(700)).await;
                        }
                        let reply = frame([&[((1500 + n) * 10_000, -1_000)], &[], &[], &[]]);
                        if socket.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        let transport = TcpTransport::new(address);
        let mut interrogator = Sm125::new(Box::new(transport), Duration::from_millis(300));
        interrogator.connect().await.unwrap();

        assert!(interrogator.read().await.is_err());
        let third = interrogator.read().await.unwrap();
        assert_eq!(third.first_peak(1), Some((1503.0, -10.0)));
        let fourth = interrogator.read().await.unwrap();
        assert_eq!(fourth.first_peak(1), Some((1504.0, -10.0)));
    }

    #[tokio::test]
    async fn test_dropped_read_reopens_transport() {
        let transport = MockTransport::new("sm125");
        let handle = transport.handle();
        handle.respond_with(|_| Some(frame([&[(15_480_000, -1_000)], &[], &[], &[]])));
        let mut interrogator = Sm125::new(Box::new(transport), Duration::from_secs(1));
        interrogator.connect().await.unwrap();

        // The reply to this request is never read.
        handle.respond_with(|_| None);
        assert!(interrogator.read().await.is_err());
        handle.refuse_open(1);
        let err = interrogator.read().await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
        assert_eq!(handle.written().len(), 2, "no request before the bus is reopened");

        handle.respond_with(|_| Some(frame([&[(15_490_000, -1_000)], &[], &[], &[]])));
        let scan = interrogator.read().await.unwrap();
        assert_eq!(scan.first_peak(1), Some((1549.0, -10.0)));
    }

    #[tokio::test]
    async fn test_garbled_prefix_is_comm_error() {
        let transport = MockTransport::new("sm125");
        let handle = transport.handle();
        let mut interrogator = Sm125::new(Box::new(transport), Duration::from_secs(1));
        handle.respond_with(|_| Some(frame([&[(15_480_000, -1_000)], &[], &[], &[]])));
        interrogator.connect().await.unwrap();

        handle.respond_with(|_| Some(b"not-a-len!".to_vec()));
        let err = interrogator.read().await.unwrap_err();
        assert!(matches!(err, DaqError::Comm { ref device, .. } if device == "SM125"));
    }
}
