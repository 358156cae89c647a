//! The control loop shared by every program kind.
//!
//! A runner is built from a validated [`ProgramConfig`], a [`DeviceSet`] it
//! owns exclusively, a [`RecordStore`] and a [`ReportSender`]. [`run`] drives
//! the whole program:
//!
//! 1. connect every device (bounded retries with backoff)
//! 2. register the data set, delete partial cycles, resume after the last
//!    complete cycle
//! 3. for every remaining cycle and setpoint: drive the oven, poll until the
//!    strategy's predicate settles (bounded by `settle_timeout`), record the
//!    planned batches
//! 4. disconnect every device, on every exit path
//!
//! Pause and stop requests arrive through a [`RunnerHandle`] and are honored
//! at poll boundaries only. A batch that has started is always finished and
//! persisted, so the store never holds half a batch.
//!
//! [`run`]: ProgramRunner::run

use super::acquisition::{acquire_batch, read_temperature, Batch};
use super::state::{CycleState, ProgramState};
use super::{FaultPolicy, ProgramStrategy, SettlePredicate, Setpoint, Verdict};
use crate::config::ProgramConfig;
use crate::core::{Reading, ReadingKind};
use crate::data::{ExportSink, ProgramManifest, RecordStore};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{command_with_retry, connect_with_retry, RetryPolicy};
use crate::instrument::{DeviceChannel, DeviceSet, OvenCommand};
use crate::messages::{ControlFlags, ControlRequest};
use crate::report::ReportSender;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Cloneable control surface of a runner. Safe to use from any task.
#[derive(Clone)]
pub struct RunnerHandle {
    control: Arc<watch::Sender<ControlFlags>>,
    state: watch::Receiver<ProgramState>,
}

impl RunnerHandle {
    /// Posts a control request. Requests that change nothing are dropped.
    pub fn request(&self, request: ControlRequest) {
        self.control.send_if_modified(|flags| flags.apply(request));
    }

    /// Holds the loop before its next poll.
    pub fn pause(&self) {
        self.request(ControlRequest::Pause);
    }

    /// Releases a pause.
    pub fn resume(&self) {
        self.request(ControlRequest::Resume);
    }

    /// Idempotent. Takes effect at the next poll boundary.
    pub fn stop(&self) {
        self.request(ControlRequest::Stop);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProgramState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<ProgramState> {
        self.state.clone()
    }

    /// Waits until the state satisfies `wanted`. Returns the last state if the
    /// runner is gone first.
    pub async fn wait_for(&self, wanted: impl Fn(ProgramState) -> bool) -> ProgramState {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| wanted(*s)).await.map(|s| *s);
        match reached {
            Ok(s) => s,
            Err(_) => *state.borrow(),
        }
    }
}

/// Drives one program through its cycles: connects the devices, resumes
/// stored data, then visits every setpoint and records what the strategy asks
/// for. The strategy `S` supplies the calibration or baking specifics.
pub struct ProgramRunner<S: ProgramStrategy> {
    config: Arc<ProgramConfig>,
    strategy: S,
    devices: DeviceSet,
    store: Arc<dyn RecordStore>,
    reporter: ReportSender,
    export: Option<Arc<dyn ExportSink>>,
    control_tx: Arc<watch::Sender<ControlFlags>>,
    control: watch::Receiver<ControlFlags>,
    state_tx: watch::Sender<ProgramState>,
}

impl<S: ProgramStrategy> ProgramRunner<S> {
    /// Validates `config` and binds it to `devices`. Nothing is connected yet.
    pub fn new(
        config: ProgramConfig,
        devices: DeviceSet,
        store: Arc<dyn RecordStore>,
        reporter: ReportSender,
    ) -> AppResult<Self> {
        config.validate()?;
        let strategy = S::from_config(&config)?;
        if !config.switch_positions().is_empty() && devices.switch.is_none() {
            return Err(DaqError::Configuration(
                "channels use switch positions but no optical switch was provided".into(),
            ));
        }

        let (control_tx, control) = watch::channel(ControlFlags::default());
        let (state_tx, _) = watch::channel(ProgramState::Idle);
        Ok(Self {
            config: Arc::new(config),
            strategy,
            devices,
            store,
            reporter,
            export: None,
            control_tx: Arc::new(control_tx),
            control,
            state_tx,
        })
    }

    /// Called with the program id once every cycle is recorded.
    pub fn with_export(mut self, sink: Arc<dyn ExportSink>) -> Self {
        self.export = Some(sink);
        self
    }

    /// Validated program configuration.
    pub fn config(&self) -> &ProgramConfig {
        &self.config
    }

    /// Program-specific half of the loop.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Control handle, usable before and after `spawn`.
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            control: Arc::clone(&self.control_tx),
            state: self.state_tx.subscribe(),
        }
    }

    /// Runs the program on its own task.
    pub fn spawn(self) -> (RunnerHandle, JoinHandle<AppResult<ProgramState>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Runs the program to the end. Completion and operator stops both return
    /// `Ok(ProgramState::Stopped)`; any other ending is the error that caused
    /// [`ProgramState::Failed`].
    pub async fn run(mut self) -> AppResult<ProgramState> {
        let program = self.config.id.clone();
        self.set_state(ProgramState::Connecting);
        self.reporter.info(format!(
            "{} program {program} starting",
            self.strategy.kind()
        ));

        let outcome = self.execute().await;
        let completed = outcome.is_ok();
        match outcome {
            Ok(()) | Err(DaqError::Stopped) => {
                self.set_state(ProgramState::Stopping);
                if !completed {
                    self.discard_partial_cycles().await;
                }
                self.devices.disconnect_all().await;
                if completed {
                    self.export_results().await;
                }
                self.set_state(ProgramState::Stopped);
                if completed {
                    self.reporter.info(format!("program {program} completed"));
                } else {
                    self.reporter
                        .info(format!("program {program} stopped by operator"));
                }
                Ok(ProgramState::Stopped)
            }
            Err(err) => {
                self.set_state(ProgramState::Failed);
                self.reporter
                    .critical(format!("program {program} failed: {err}"));
                self.discard_partial_cycles().await;
                self.devices.disconnect_all().await;
                Err(err)
            }
        }
    }

    async fn execute(&mut self) -> AppResult<()> {
        self.connect_devices().await?;
        self.set_state(ProgramState::Running);

        let first_cycle = self.prepare_data_set().await?;
        let cycles = self.config.cycles;
        if first_cycle > cycles {
            self.reporter.warning(format!(
                "all {cycles} cycles of program {} are already recorded",
                self.config.id
            ));
            return Ok(());
        }
        for cycle in first_cycle..=cycles {
            self.run_cycle(cycle).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // State and control
    // ------------------------------------------------------------------

    fn set_state(&self, next: ProgramState) {
        let current = *self.state_tx.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "unexpected program state transition");
        }
        self.state_tx.send_replace(next);
        info!(program = %self.config.id, from = %current, to = %next, "program state changed");
    }

    fn stop_requested(&self) -> bool {
        self.control.borrow().stop_requested
    }

    /// Poll boundary. Blocks while paused, fails with [`DaqError::Stopped`] on
    /// a stop request. Returns `true` if the loop was paused here.
    async fn checkpoint(&mut self) -> AppResult<bool> {
        let mut paused_here = false;
        loop {
            let flags = *self.control.borrow_and_update();
            if flags.stop_requested {
                return Err(DaqError::Stopped);
            }
            if !flags.paused {
                if paused_here {
                    self.set_state(ProgramState::Running);
                    self.reporter
                        .info(format!("program {} resumed", self.config.id));
                }
                return Ok(paused_here);
            }
            if !paused_here {
                paused_here = true;
                self.set_state(ProgramState::Paused);
                self.reporter
                    .info(format!("program {} paused", self.config.id));
            }
            // The runner keeps a sender alive, so this only returns on a change.
            if self.control.changed().await.is_err() {
                return Err(DaqError::Stopped);
            }
        }
    }

    /// Sleeps until `deadline`, waking early for control requests.
    /// Returns `true` if the loop was paused on the way.
    async fn wait_until(&mut self, deadline: Instant) -> AppResult<bool> {
        let mut paused = false;
        loop {
            paused |= self.checkpoint().await?;
            if paused || Instant::now() >= deadline {
                return Ok(paused);
            }
            tokio::select! {
                _ = sleep_until(deadline) => return Ok(paused),
                changed = self.control.changed() => {
                    if changed.is_err() {
                        sleep_until(deadline).await;
                        return Ok(paused);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    async fn connect_devices(&mut self) -> AppResult<()> {
        let policy = self.config.connect_retry.clone();
        let timeout = self.config.timing.call_timeout;
        let reporter = &self.reporter;

        connect_device(&mut *self.devices.oven, &policy, timeout, reporter).await?;
        if self.control.borrow().stop_requested {
            return Err(DaqError::Stopped);
        }
        connect_device(&mut *self.devices.thermometer, &policy, timeout, reporter).await?;
        if self.control.borrow().stop_requested {
            return Err(DaqError::Stopped);
        }
        connect_device(&mut *self.devices.interrogator, &policy, timeout, reporter).await?;
        if let Some(switch) = self.devices.switch.as_mut() {
            if self.control.borrow().stop_requested {
                return Err(DaqError::Stopped);
            }
            connect_device(&mut **switch, &policy, timeout, reporter).await?;
        }
        if self.stop_requested() {
            return Err(DaqError::Stopped);
        }
        Ok(())
    }

    async fn oven(&mut self, command: OvenCommand) -> AppResult<()> {
        let name = self.devices.oven.name().to_string();
        command_with_retry(
            &mut *self.devices.oven,
            command,
            &self.config.retry,
            self.config.timing.call_timeout,
            |attempt, err| warn!(device = %name, attempt, error = %err, "retrying oven command"),
        )
        .await
    }

    /// Points the oven at `target_c`, choosing heater or cooling by direction.
    async fn drive_to(&mut self, target_c: f64) -> AppResult<()> {
        let current = read_temperature(&mut self.devices, &self.config, 1).await?;
        let use_cooling = self.strategy.use_cooling();
        let cool = use_cooling && target_c < current;
        if cool {
            self.oven(OvenCommand::Heater(false)).await?;
            self.oven(OvenCommand::Cooling(true)).await?;
        } else {
            if use_cooling {
                self.oven(OvenCommand::Cooling(false)).await?;
            }
            self.oven(OvenCommand::Heater(true)).await?;
        }
        self.oven(OvenCommand::Setpoint(target_c)).await?;
        debug!(target_c, current, cool, "oven driven to setpoint");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data set
    // ------------------------------------------------------------------

    fn manifest(&self) -> ProgramManifest {
        ProgramManifest {
            id: self.config.id.clone(),
            kind: self.strategy.kind(),
            channels: self
                .config
                .channels_under_test()
                .map(|c| c.sensor_id.clone())
                .collect(),
            points_per_cycle: self.config.points_per_cycle(),
        }
    }

    /// Returns the first cycle still to be recorded.
    async fn prepare_data_set(&mut self) -> AppResult<u32> {
        let program = self.config.id.clone();
        let existed = self.store.exists(&program).await?;
        self.store.ensure_program(&self.manifest()).await?;
        if !existed {
            return Ok(1);
        }

        let removed = self.store.delete_partial_cycles(&program).await?;
        if !removed.is_empty() {
            self.reporter.warning(format!(
                "program {program}: deleted partial cycles {removed:?}"
            ));
        }
        let done = self.store.last_completed_cycle(&program).await?;
        if done > 0 && done < self.config.cycles {
            self.reporter.info(format!(
                "program {program}: resuming at cycle {}",
                done + 1
            ));
        }
        Ok(done + 1)
    }

    /// Best-effort cleanup so an interrupted cycle never stays half recorded.
    async fn discard_partial_cycles(&self) {
        let program = &self.config.id;
        match self.store.delete_partial_cycles(program).await {
            Ok(removed) if !removed.is_empty() => {
                self.reporter.warning(format!(
                    "program {program}: discarded incomplete cycles {removed:?}"
                ));
            }
            Ok(_) => {}
            Err(err) => warn!(program = %program, error = %err, "could not discard partial cycles"),
        }
    }

    async fn export_results(&self) {
        let Some(sink) = &self.export else {
            return;
        };
        if let Err(err) = sink
            .program_completed(&self.config.id, self.strategy.kind())
            .await
        {
            self.reporter.warning(format!(
                "export of program {} failed: {err}",
                self.config.id
            ));
        }
    }

    async fn persist(
        &self,
        state: &CycleState,
        point: u32,
        kind: ReadingKind,
        batch: Batch,
        drift_rate: Option<f64>,
    ) -> AppResult<()> {
        let timestamp = Utc::now();
        let readings: Vec<Reading> = batch
            .channels
            .into_iter()
            .map(|sample| Reading {
                channel: sample.channel,
                cycle: state.cycle,
                point,
                timestamp,
                kind,
                temperature_c: batch.temperature_c,
                wavelength_nm: sample.wavelength_nm,
                power_dbm: sample.power_dbm,
                drift_rate,
            })
            .collect();
        self.store
            .append_cycle(&self.config.id, state.cycle, readings)
            .await
    }

    // ------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------

    async fn run_cycle(&mut self, cycle: u32) -> AppResult<()> {
        let attempts = match self.strategy.fault_policy() {
            FaultPolicy::AbortCycle => self.strategy.max_cycle_attempts().max(1),
            FaultPolicy::SkipPoint => 1,
        };
        let program = self.config.id.clone();
        let mut attempt = 1;
        loop {
            self.reporter.info(format!(
                "program {program}: cycle {cycle} of {} started",
                self.config.cycles
            ));
            let mut state = CycleState::new(cycle, attempt);
            match self.record_cycle(&mut state).await {
                Ok(()) => {
                    self.reporter
                        .info(format!("program {program}: cycle {cycle} completed"));
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    self.reporter.error(format!(
                        "program {program}: cycle {cycle} aborted: {err}"
                    ));
                    let removed = self.store.delete_partial_cycles(&program).await?;
                    debug!(cycle, ?removed, "aborted cycle discarded");
                    if attempt >= attempts {
                        return Err(err);
                    }
                    attempt += 1;
                    self.reporter.warning(format!(
                        "program {program}: repeating cycle {cycle} (attempt {attempt} of {attempts})"
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn record_cycle(&mut self, state: &mut CycleState) -> AppResult<()> {
        let setpoints = self.strategy.setpoints().to_vec();
        for (index, setpoint) in setpoints.iter().enumerate() {
            state.setpoint_index = index;
            self.run_setpoint(state, setpoint).await?;
        }
        Ok(())
    }

    /// Handles a fault that survived the call-site retries.
    fn on_fault(&self, state: &mut CycleState, err: DaqError, what: &str) -> AppResult<()> {
        if !err.is_retryable() || self.strategy.fault_policy() == FaultPolicy::AbortCycle {
            return Err(err);
        }
        let skips = state.record_skip(&err.to_string());
        self.reporter.error(format!(
            "program {}: cycle {} {what} skipped: {err}",
            self.config.id, state.cycle
        ));
        if skips > self.strategy.max_consecutive_skips() {
            return Err(err);
        }
        Ok(())
    }

    async fn refresh_setpoint(
        &mut self,
        state: &mut CycleState,
        target_c: f64,
        last: &mut Instant,
    ) -> AppResult<()> {
        let Some(every) = self.strategy.setpoint_refresh() else {
            return Ok(());
        };
        if last.elapsed() < every {
            return Ok(());
        }
        *last = Instant::now();
        match self.oven(OvenCommand::Setpoint(target_c)).await {
            Ok(()) => {
                state.record_success();
                Ok(())
            }
            Err(err) => self.on_fault(state, err, "setpoint refresh"),
        }
    }

    async fn run_setpoint(&mut self, state: &mut CycleState, setpoint: &Setpoint) -> AppResult<()> {
        self.checkpoint().await?;
        let target_c = setpoint.target_c;
        info!(
            program = %self.config.id,
            cycle = state.cycle,
            target_c,
            role = ?setpoint.role,
            "moving to setpoint"
        );

        loop {
            match self.drive_to(target_c).await {
                Ok(()) => {
                    state.record_success();
                    break;
                }
                Err(err) => {
                    self.on_fault(state, err, "oven command")?;
                    self.wait_until(Instant::now() + self.config.timing.poll_interval)
                        .await?;
                }
            }
        }

        let mut predicate = self.strategy.predicate(setpoint);
        let mut last_refresh = Instant::now();
        let settled_at = self
            .settle(state, setpoint, &mut *predicate, &mut last_refresh)
            .await?;

        let Some(kind) = setpoint.role.reading_kind() else {
            return Ok(());
        };
        let plan = self.strategy.recording(setpoint);
        let poll_interval = self.config.timing.poll_interval;
        let mut recorded = 0;
        let mut next = Instant::now();
        while recorded < plan.batches {
            // Keep watching the chamber until the next sample is due.
            loop {
                let wake = (Instant::now() + poll_interval).min(next);
                while self.wait_until(wake).await? {}
                if Instant::now() >= next {
                    break;
                }
                self.refresh_setpoint(state, target_c, &mut last_refresh)
                    .await?;
                match read_temperature(&mut self.devices, &self.config, 1).await {
                    Ok(temperature_c) => {
                        state.record_success();
                        predicate.observe(settled_at.elapsed(), temperature_c);
                    }
                    Err(err) => self.on_fault(state, err, "temperature poll")?,
                }
            }
            self.refresh_setpoint(state, target_c, &mut last_refresh)
                .await?;

            match acquire_batch(&mut self.devices, &self.config).await {
                Ok(batch) => {
                    predicate.observe(settled_at.elapsed(), batch.temperature_c);
                    let point = setpoint.first_point + recorded;
                    self.persist(state, point, kind, batch, predicate.drift_rate())
                        .await?;
                    state.record_success();
                    recorded += 1;
                    debug!(cycle = state.cycle, point, "batch recorded");
                }
                Err(err) => self.on_fault(state, err, "sample")?,
            }
            next = (next + plan.interval).max(Instant::now());
        }
        Ok(())
    }

    /// Polls until the predicate settles or `settle_timeout` expires. Returns
    /// the instant the settle clock started, for later drift observations.
    async fn settle(
        &mut self,
        state: &mut CycleState,
        setpoint: &Setpoint,
        predicate: &mut dyn SettlePredicate,
        last_refresh: &mut Instant,
    ) -> AppResult<Instant> {
        let timing = self.config.timing.clone();
        let record_kind = setpoint
            .role
            .reading_kind()
            .filter(|_| self.config.record_transient);
        let mut started = Instant::now();
        let mut deadline = started + timing.settle_timeout;

        loop {
            self.refresh_setpoint(state, setpoint.target_c, last_refresh)
                .await?;

            let sample = match record_kind {
                Some(_) => acquire_batch(&mut self.devices, &self.config)
                    .await
                    .map(|b| (b.temperature_c, Some(b))),
                None => read_temperature(&mut self.devices, &self.config, 1)
                    .await
                    .map(|t| (t, None)),
            };
            match sample {
                Ok((temperature_c, batch)) => {
                    state.record_success();
                    if let Some(batch) = batch {
                        self.persist(state, setpoint.first_point, ReadingKind::Transient, batch, None)
                            .await?;
                    }
                    let verdict = predicate.observe(started.elapsed(), temperature_c);
                    debug!(
                        cycle = state.cycle,
                        target_c = setpoint.target_c,
                        temperature_c,
                        drift = ?predicate.drift_rate(),
                        "settle poll"
                    );
                    if verdict == Verdict::Settled {
                        return Ok(started);
                    }
                }
                Err(err) => self.on_fault(state, err, "temperature poll")?,
            }

            if Instant::now() >= deadline {
                self.reporter.warning(format!(
                    "program {}: {} °C not reached within {}, continuing",
                    self.config.id,
                    setpoint.target_c,
                    humanize(timing.settle_timeout)
                ));
                return Ok(started);
            }
            let next_poll = (Instant::now() + timing.poll_interval).min(deadline);
            if self.wait_until(next_poll).await? {
                // The chamber may have drifted while paused.
                predicate.reset();
                started = Instant::now();
                deadline = started + timing.settle_timeout;
            }
        }
    }
}

async fn connect_device<D>(
    device: &mut D,
    policy: &RetryPolicy,
    timeout: Duration,
    reporter: &ReportSender,
) -> AppResult<()>
where
    D: DeviceChannel + ?Sized,
{
    let name = device.name().to_string();
    connect_with_retry(device, policy, timeout, |attempt, err| {
        reporter.error(format!("connection attempt {attempt} to {name} failed: {err}"));
    })
    .await?;
    reporter.info(format!("{name} connected"));
    Ok(())
}

fn humanize(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

impl<S: ProgramStrategy> std::fmt::Debug for ProgramRunner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramRunner")
            .field("program", &self.config.id)
            .field("kind", &self.strategy.kind())
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}
