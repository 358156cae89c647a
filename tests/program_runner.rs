//! End-to-end runs of the control loop against the simulated bench.
//!
//! All tests run on a paused tokio clock, so poll intervals, dwells and
//! settle timeouts pass instantly.

use fbg_daq::config::{
    AcquisitionConfig, BakingSettings, CalibrationSettings, ChannelConfig, ExtraPoints,
    ProgramConfig, ProgramMode, ReportConfig, TimingConfig,
};
use fbg_daq::core::{ChannelId, ProgramId, ProgramKind, Reading, ReadingKind};
use fbg_daq::data::{MemoryStore, ProgramManifest, RecordStore};
use fbg_daq::error::DaqError;
use fbg_daq::error_recovery::RetryPolicy;
use fbg_daq::instrument::mock::{MockBench, SimulatedSensor, THERMOMETER};
use fbg_daq::program::{BakingRunner, CalibrationRunner, ProgramState};
use fbg_daq::report::{report_channel, Message, Severity};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn channel(serial: &str, interrogator_channel: u8) -> ChannelConfig {
    ChannelConfig {
        sensor_id: ChannelId::new(serial),
        interrogator_channel,
        switch_position: None,
        under_test: true,
    }
}

fn calibration(targets: Vec<f64>, cycles: u32) -> ProgramConfig {
    ProgramConfig {
        id: ProgramId::new("cal-e2e"),
        targets_c: targets,
        channels: vec![channel("FBG-1", 1), channel("FBG-2", 2)],
        cycles,
        mode: ProgramMode::Calibration(CalibrationSettings {
            stability_tolerance_c: 0.5,
            stability_window: 3,
            min_dwell: Duration::ZERO,
            extra_points: ExtraPoints::default(),
            conditioning_offset_c: 0.0,
            use_cooling: false,
            max_cycle_attempts: 2,
        }),
        timing: TimingConfig::default(),
        acquisition: AcquisitionConfig::default(),
        retry: RetryPolicy::default(),
        connect_retry: RetryPolicy::default(),
        record_transient: false,
    }
}

/// Scripted chamber: three transient polls after every setpoint change, then
/// exactly on target.
fn bench(start_c: f64) -> MockBench {
    let bench = MockBench::scripted(start_c, vec![6.0, 3.0, 1.5]);
    bench
        .add_sensor(SimulatedSensor::new(1, None, 1550.0))
        .add_sensor(SimulatedSensor::new(2, None, 1540.0));
    bench
}

fn count(messages: &[Message], severity: Severity) -> usize {
    messages.iter().filter(|m| m.severity == severity).count()
}

fn cycles_of(readings: &[Reading]) -> BTreeSet<u32> {
    readings.iter().map(|r| r.cycle).collect()
}

#[tokio::test(start_paused = true)]
async fn three_setpoints_two_channels_yield_six_readings() {
    let bench = bench(25.0);
    let store = Arc::new(MemoryStore::new());
    let (reporter, mut messages) = report_channel(&ReportConfig::default());
    let runner = CalibrationRunner::new(
        calibration(vec![25.0, 50.0, 75.0], 1),
        bench.devices(Duration::ZERO),
        store.clone(),
        reporter,
    )
    .unwrap();
    let handle = runner.handle();

    assert_eq!(runner.run().await.unwrap(), ProgramState::Stopped);
    assert_eq!(handle.state(), ProgramState::Stopped);

    let readings = store.readings(&ProgramId::new("cal-e2e")).await.unwrap();
    assert_eq!(readings.len(), 6);
    assert!(readings.iter().all(|r| r.kind == ReadingKind::Real && r.cycle == 1));
    let points: Vec<(u32, f64)> = readings
        .iter()
        .filter(|r| r.channel.as_str() == "FBG-1")
        .map(|r| (r.point, r.temperature_c))
        .collect();
    assert_eq!(points, vec![(0, 25.0), (1, 50.0), (2, 75.0)]);
    let fbg1_at_75 = readings
        .iter()
        .find(|r| r.channel.as_str() == "FBG-1" && r.point == 2)
        .unwrap();
    assert!((fbg1_at_75.wavelength_nm - 1550.5).abs() < 1e-9);
    assert_eq!(bench.setpoints(), vec![25.0, 50.0, 75.0]);

    let messages = messages.drain();
    assert_eq!(count(&messages, Severity::Error), 0);
    assert_eq!(count(&messages, Severity::Critical), 0);
    assert!(messages.last().unwrap().text.contains("completed"));
}

#[tokio::test(start_paused = true)]
async fn start_then_stop_persists_nothing() {
    let bench = bench(25.0);
    let store = Arc::new(MemoryStore::new());
    let (reporter, mut messages) = report_channel(&ReportConfig::default());
    let runner = CalibrationRunner::new(
        calibration(vec![25.0, 50.0, 75.0], 3),
        bench.devices(Duration::ZERO),
        store.clone(),
        reporter,
    )
    .unwrap();

    let (handle, task) = runner.spawn();
    handle.stop();
    handle.stop();
    assert_eq!(task.await.unwrap().unwrap(), ProgramState::Stopped);

    assert!(store
        .readings(&ProgramId::new("cal-e2e"))
        .await
        .unwrap()
        .is_empty());
    let messages = messages.drain();
    assert_eq!(count(&messages, Severity::Error), 0);
    assert!(messages.last().unwrap().text.contains("stopped by operator"));
}

#[tokio::test(start_paused = true)]
async fn stop_mid_cycle_leaves_only_complete_cycles() {
    let bench = bench(25.0);
    let store = Arc::new(MemoryStore::new());
    let program = ProgramId::new("cal-e2e");
    let (reporter, mut messages) = report_channel(&ReportConfig::default());
    let runner = CalibrationRunner::new(
        calibration(vec![25.0, 50.0, 75.0], 2),
        bench.devices(Duration::ZERO),
        store.clone(),
        reporter,
    )
    .unwrap();
    let (handle, task) = runner.spawn();

    // Stop as soon as the first batch of cycle 2 is on disk.
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if store.readings(&program).await.unwrap().len() >= 8 {
            handle.stop();
            break;
        }
    }
    assert_eq!(task.await.unwrap().unwrap(), ProgramState::Stopped);

    let readings = store.readings(&program).await.unwrap();
    assert_eq!(readings.len(), 6);
    assert_eq!(cycles_of(&readings), BTreeSet::from([1]));
    assert_eq!(store.last_completed_cycle(&program).await.unwrap(), 1);
    assert!(messages
        .drain()
        .iter()
        .any(|m| m.severity == Severity::Warning && m.text.contains("incomplete cycles [2]")));
}

#[tokio::test(start_paused = true)]
async fn resume_continues_after_last_complete_cycle() {
    let program = ProgramId::new("cal-e2e");
    let store = Arc::new(MemoryStore::new());
    store
        .ensure_program(&ProgramManifest {
            id: program.clone(),
            kind: ProgramKind::Calibration,
            channels: vec![ChannelId::new("FBG-1"), ChannelId::new("FBG-2")],
            points_per_cycle: 3,
        })
        .await
        .unwrap();
    let reading = |cycle: u32, point: u32, serial: &str| Reading {
        channel: ChannelId::new(serial),
        cycle,
        point,
        timestamp: chrono::Utc::now(),
        kind: ReadingKind::Real,
        temperature_c: 25.0,
        wavelength_nm: 1550.0,
        power_dbm: -10.0,
        drift_rate: None,
    };
    for cycle in 1..=2 {
        for point in 0..3 {
            store
                .append_cycle(
                    &program,
                    cycle,
                    vec![reading(cycle, point, "FBG-1"), reading(cycle, point, "FBG-2")],
                )
                .await
                .unwrap();
        }
    }
    // Cycle 3 was interrupted after its first point.
    store
        .append_cycle(&program, 3, vec![reading(3, 0, "FBG-1"), reading(3, 0, "FBG-2")])
        .await
        .unwrap();

    let bench = bench(25.0);
    let (reporter, mut messages) = report_channel(&ReportConfig::default());
    let runner = CalibrationRunner::new(
        calibration(vec![25.0, 50.0, 75.0], 4),
        bench.devices(Duration::ZERO),
        store.clone(),
        reporter,
    )
    .unwrap();
    assert_eq!(runner.run().await.unwrap(), ProgramState::Stopped);

    let readings = store.readings(&program).await.unwrap();
    assert_eq!(readings.len(), 4 * 6);
    assert_eq!(readings.iter().filter(|r| r.cycle == 3).count(), 6);
    assert_eq!(store.last_completed_cycle(&program).await.unwrap(), 4);
    // Cycles 1 and 2 were not re-run.
    assert_eq!(bench.setpoints().len(), 2 * 3);

    let messages = messages.drain();
    assert!(messages
        .iter()
        .any(|m| m.severity == Severity::Warning && m.text.contains("deleted partial cycles [3]")));
    assert!(messages.iter().any(|m| m.text.contains("resuming at cycle 3")));
}

#[tokio::test(start_paused = true)]
async fn changed_sensor_set_cannot_resume() {
    let program = ProgramId::new("cal-e2e");
    let store = Arc::new(MemoryStore::new());
    store
        .ensure_program(&ProgramManifest {
            id: program.clone(),
            kind: ProgramKind::Calibration,
            channels: vec![ChannelId::new("FBG-1"), ChannelId::new("FBG-9")],
            points_per_cycle: 3,
        })
        .await
        .unwrap();

    let (reporter, mut messages) = report_channel(&ReportConfig::default());
    let runner = CalibrationRunner::new(
        calibration(vec![25.0, 50.0, 75.0], 1),
        bench(25.0).devices(Duration::ZERO),
        store,
        reporter,
    )
    .unwrap();
    let handle = runner.handle();

    assert!(matches!(runner.run().await, Err(DaqError::Resume(_))));
    assert_eq!(handle.state(), ProgramState::Failed);
    let last = messages.drain().pop().unwrap();
    assert_eq!(last.severity, Severity::Critical);
}

#[tokio::test(start_paused = true)]
async fn pause_holds_all_device_traffic_until_resume() {
    let bench = bench(25.0);
    let store = Arc::new(MemoryStore::new());
    let (reporter, _messages) = report_channel(&ReportConfig::default());
    let runner = CalibrationRunner::new(
        calibration(vec![25.0, 50.0, 75.0], 1),
        bench.devices(Duration::ZERO),
        store.clone(),
        reporter,
    )
    .unwrap();
    let (handle, task) = runner.spawn();

    handle.wait_for(|s| s == ProgramState::Running).await;
    tokio::time::sleep(Duration::from_secs(15)).await;
    handle.pause();
    assert_eq!(
        handle.wait_for(|s| s == ProgramState::Paused).await,
        ProgramState::Paused
    );

    let commands = bench.oven_commands().len();
    let reads = bench.thermometer_reads();
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(bench.oven_commands().len(), commands);
    assert_eq!(bench.thermometer_reads(), reads);
    assert_eq!(handle.state(), ProgramState::Paused);

    handle.resume();
    assert_eq!(task.await.unwrap().unwrap(), ProgramState::Stopped);
    assert_eq!(
        store.readings(&ProgramId::new("cal-e2e")).await.unwrap().len(),
        6
    );
}

#[tokio::test(start_paused = true)]
async fn device_that_never_answers_fails_the_program() {
    let bench = bench(25.0);
    bench.refuse_connects(THERMOMETER, u32::MAX);
    let (reporter, mut messages) = report_channel(&ReportConfig::default());
    let runner = CalibrationRunner::new(
        calibration(vec![25.0], 1),
        bench.devices(Duration::ZERO),
        Arc::new(MemoryStore::new()),
        reporter,
    )
    .unwrap();

    let err = runner.run().await.unwrap_err();
    assert!(err.to_string().contains(THERMOMETER));
    let messages = messages.drain();
    assert_eq!(count(&messages, Severity::Error), 3);
    assert_eq!(count(&messages, Severity::Critical), 1);
}

#[tokio::test(start_paused = true)]
async fn baking_settles_on_drift_and_samples_every_target() {
    // Exponential approach, one step per thermometer read.
    let approach: Vec<f64> = (0..40).map(|i| 10.0 * (-(i as f64) / 5.0).exp()).collect();
    let bench = MockBench::scripted(20.0, approach);
    bench
        .add_sensor(SimulatedSensor::new(1, None, 1550.0))
        .add_sensor(SimulatedSensor::new(2, None, 1540.0));

    let mut config = calibration(vec![120.0, 150.0], 1);
    config.id = ProgramId::new("bake-e2e");
    config.timing.poll_interval = Duration::from_secs(60);
    config.mode = ProgramMode::Baking(BakingSettings {
        drift_threshold_c_per_min: 0.05,
        drift_window: Duration::from_secs(300),
        settle_polls: 2,
        dwell: Duration::from_secs(3 * 3600),
        sample_interval: Duration::from_secs(3600),
        max_consecutive_skips: 3,
        setpoint_refresh: Duration::from_secs(180),
        use_cooling: false,
    });

    let store = Arc::new(MemoryStore::new());
    let (reporter, mut messages) = report_channel(&ReportConfig::default());
    let runner =
        BakingRunner::new(config, bench.devices(Duration::ZERO), store.clone(), reporter).unwrap();
    assert_eq!(runner.run().await.unwrap(), ProgramState::Stopped);

    let readings = store.readings(&ProgramId::new("bake-e2e")).await.unwrap();
    assert_eq!(readings.len(), 2 * 3 * 2);
    let points: BTreeSet<u32> = readings.iter().map(|r| r.point).collect();
    assert_eq!(points, (0..6).collect::<BTreeSet<u32>>());
    for reading in &readings {
        let target = if reading.point < 3 { 120.0 } else { 150.0 };
        assert!((reading.temperature_c - target).abs() < 0.5, "{reading:?}");
        assert!(reading.drift_rate.is_some());
    }
    // The setpoint is refreshed during the dwell.
    assert!(bench.setpoints().iter().filter(|t| **t == 120.0).count() > 1);
    assert_eq!(count(&messages.drain(), Severity::Error), 0);
}

#[cfg(feature = "storage_csv")]
#[tokio::test(start_paused = true)]
async fn csv_store_resumes_after_operator_stop() {
    use fbg_daq::data::CsvStore;

    let dir = tempfile::tempdir().unwrap();
    let program = ProgramId::new("cal-e2e");

    {
        let store = Arc::new(CsvStore::open(dir.path()).unwrap());
        let (reporter, _messages) = report_channel(&ReportConfig::default());
        let runner = CalibrationRunner::new(
            calibration(vec![25.0, 50.0, 75.0], 2),
            bench(25.0).devices(Duration::ZERO),
            store.clone(),
            reporter,
        )
        .unwrap();
        let (handle, task) = runner.spawn();
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if store.last_completed_cycle(&program).await.unwrap() == 1 {
                handle.stop();
                break;
            }
        }
        task.await.unwrap().unwrap();
    }

    let store = Arc::new(CsvStore::open(dir.path()).unwrap());
    assert_eq!(store.last_completed_cycle(&program).await.unwrap(), 1);
    let bench = bench(25.0);
    let (reporter, _messages) = report_channel(&ReportConfig::default());
    let runner = CalibrationRunner::new(
        calibration(vec![25.0, 50.0, 75.0], 2),
        bench.devices(Duration::ZERO),
        store.clone(),
        reporter,
    )
    .unwrap();
    assert_eq!(runner.run().await.unwrap(), ProgramState::Stopped);

    let readings = store.readings(&program).await.unwrap();
    assert_eq!(readings.len(), 12);
    assert_eq!(cycles_of(&readings), BTreeSet::from([1, 2]));
    assert_eq!(bench.setpoints(), vec![25.0, 50.0, 75.0]);
}
