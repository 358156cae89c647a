//! One optical batch: chamber temperature plus a wavelength/power pair for
//! every channel under test.
//!
//! The temperature of a batch is the mean of `temperature_samples` reads taken
//! before the optical scan and as many taken after it. Switched sensors are
//! measured position by position; unswitched sensors take their first peak
//! from every scan of the batch.

use crate::config::{ChannelConfig, ProgramConfig};
use crate::core::ChannelId;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{command_with_retry, read_with_retry};
use crate::instrument::DeviceSet;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Averaged values of one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSample {
    /// Sensor serial number.
    pub channel: ChannelId,
    /// Mean peak wavelength.
    pub wavelength_nm: f64,
    /// Mean peak power.
    pub power_dbm: f64,
}

/// One recorded point for every channel under test.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    /// Mean chamber temperature around the scans.
    pub temperature_c: f64,
    /// In configured channel order.
    pub channels: Vec<ChannelSample>,
}

#[derive(Default)]
struct Accumulator {
    wavelength: f64,
    power: f64,
    count: usize,
}

impl Accumulator {
    fn add(&mut self, (wavelength, power): (f64, f64)) {
        self.wavelength += wavelength;
        self.power += power;
        self.count += 1;
    }
}

fn log_retry(device: &str) -> impl FnMut(u32, &DaqError) + Send + '_ {
    move |attempt, err| warn!(device, attempt, error = %err, "retrying")
}

/// Mean chamber temperature over `samples` reads.
pub async fn read_temperature(
    devices: &mut DeviceSet,
    config: &ProgramConfig,
    samples: usize,
) -> AppResult<f64> {
    let samples = samples.max(1);
    let name = devices.thermometer.name().to_string();
    let mut sum = 0.0;
    for _ in 0..samples {
        sum += read_with_retry(
            &mut *devices.thermometer,
            &config.retry,
            config.timing.call_timeout,
            log_retry(&name),
        )
        .await?;
    }
    Ok(sum / samples as f64)
}

/// Takes one complete batch. Never interrupted by pause or stop.
pub async fn acquire_batch(devices: &mut DeviceSet, config: &ProgramConfig) -> AppResult<Batch> {
    let samples = config.acquisition.temperature_samples;
    let before = read_temperature(devices, config, samples).await?;
    let channels = scan_channels(devices, config).await?;
    let after = read_temperature(devices, config, samples).await?;

    Ok(Batch {
        temperature_c: (before + after) / 2.0,
        channels,
    })
}

async fn scan_channels(
    devices: &mut DeviceSet,
    config: &ProgramConfig,
) -> AppResult<Vec<ChannelSample>> {
    let channels: Vec<&ChannelConfig> = config.channels_under_test().collect();
    let unswitched: Vec<&ChannelConfig> = channels
        .iter()
        .copied()
        .filter(|c| c.switch_position.is_none())
        .collect();
    let mut sums: HashMap<&ChannelId, Accumulator> = HashMap::new();

    let positions = config.switch_positions();
    if positions.is_empty() {
        scan(devices, config, &unswitched, &mut sums).await?;
    } else {
        for position in positions {
            select_position(devices, config, position).await?;
            let mut visible: Vec<&ChannelConfig> = channels
                .iter()
                .copied()
                .filter(|c| c.switch_position == Some(position))
                .collect();
            visible.extend(unswitched.iter().copied());
            scan(devices, config, &visible, &mut sums).await?;
        }
    }

    channels
        .iter()
        .map(|c| {
            let acc = sums.get(&c.sensor_id).filter(|a| a.count > 0).ok_or_else(|| {
                DaqError::comm(
                    devices.interrogator.name(),
                    format!("no peak recorded for sensor {}", c.sensor_id),
                )
            })?;
            let n = acc.count as f64;
            Ok(ChannelSample {
                channel: c.sensor_id.clone(),
                wavelength_nm: acc.wavelength / n,
                power_dbm: acc.power / n,
            })
        })
        .collect()
}

async fn select_position(
    devices: &mut DeviceSet,
    config: &ProgramConfig,
    position: u8,
) -> AppResult<()> {
    let switch = devices
        .switch
        .as_mut()
        .ok_or_else(|| DaqError::Configuration("no optical switch available".into()))?;
    let name = switch.name().to_string();
    let timeout = config.timing.call_timeout;
    command_with_retry(&mut **switch, position, &config.retry, timeout, log_retry(&name)).await?;
    // Reading back waits out the settle interval.
    let selected = read_with_retry(&mut **switch, &config.retry, timeout, log_retry(&name)).await?;
    if selected != position {
        return Err(DaqError::comm(
            name,
            format!("selected position {selected}, expected {position}"),
        ));
    }
    debug!(position, "switch position selected");
    Ok(())
}

async fn scan<'a>(
    devices: &mut DeviceSet,
    config: &'a ProgramConfig,
    visible: &[&'a ChannelConfig],
    sums: &mut HashMap<&'a ChannelId, Accumulator>,
) -> AppResult<()> {
    let name = devices.interrogator.name().to_string();
    for _ in 0..config.acquisition.scans_per_reading.max(1) {
        let peaks = read_with_retry(
            &mut *devices.interrogator,
            &config.retry,
            config.timing.call_timeout,
            log_retry(&name),
        )
        .await?;
        for channel in visible {
            let peak = peaks.first_peak(channel.interrogator_channel).ok_or_else(|| {
                DaqError::comm(
                    &name,
                    format!(
                        "no peak on channel {} for sensor {}",
                        channel.interrogator_channel, channel.sensor_id
                    ),
                )
            })?;
            sums.entry(&channel.sensor_id).or_default().add(peak);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{calibration, channel};
    use crate::instrument::mock::{MockBench, SimulatedSensor, INTERROGATOR};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_switched_and_unswitched_channels() {
        let bench = MockBench::scripted(40.0, Vec::new());
        bench
            .add_sensor(SimulatedSensor::new(1, Some(1), 1550.0))
            .add_sensor(SimulatedSensor::new(1, Some(2), 1545.0))
            .add_sensor(SimulatedSensor::new(2, None, 1530.0));
        let mut config = calibration(vec![40.0]);
        config.channels = vec![
            channel("A", 1, Some(1)),
            channel("B", 1, Some(2)),
            channel("C", 2, None),
        ];
        let mut devices = bench.devices(Duration::from_millis(500));

        let batch = acquire_batch(&mut devices, &config).await.unwrap();
        assert_eq!(batch.temperature_c, 40.0);
        let serials: Vec<&str> = batch.channels.iter().map(|c| c.channel.as_str()).collect();
        assert_eq!(serials, vec!["A", "B", "C"]);
        // 15 pm above the 25 °C reference
        assert!((batch.channels[0].wavelength_nm - 1550.15).abs() < 1e-9);
        assert!((batch.channels[1].wavelength_nm - 1545.15).abs() < 1e-9);
        assert!((batch.channels[2].wavelength_nm - 1530.15).abs() < 1e-9);
        assert_eq!(bench.switch_commands(), vec![1, 2]);
        // temperature_samples before and after
        assert_eq!(bench.thermometer_reads(), 4);
    }

    #[tokio::test]
    async fn test_missing_peak_is_comm_error() {
        let bench = MockBench::scripted(40.0, Vec::new());
        bench.add_sensor(SimulatedSensor::new(1, None, 1550.0));
        let mut devices = bench.devices(Duration::ZERO);

        let err = acquire_batch(&mut devices, &calibration(vec![40.0]))
            .await
            .unwrap_err();
        match err {
            DaqError::Comm { device, reason } => {
                assert_eq!(device, INTERROGATOR);
                assert!(reason.contains("FBG-2"));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
