//! CLI entry point for fbg_daq
//!
//! ```bash
//! fbg_daq run -c settings.toml              # real instruments
//! fbg_daq run -c settings.toml --simulate   # simulated bench
//! fbg_daq validate -c settings.toml
//! fbg_daq status -c settings.toml
//! ```
//!
//! `run` prints operator messages to stdout and logs to stderr. Ctrl-C asks
//! the program to stop at the next poll boundary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fbg_daq::config::{ApplicationConfig, ProgramConfig, Settings, SimulationConfig};
use fbg_daq::core::ProgramKind;
use fbg_daq::data::{open_store, RecordStore};
use fbg_daq::instrument::mock::{MockBench, SimulatedSensor};
use fbg_daq::instrument::DeviceSet;
use fbg_daq::program::{
    BakingStrategy, CalibrationStrategy, ProgramRunner, ProgramState, ProgramStrategy,
};
use fbg_daq::report::{report_channel, ReportReceiver, ReportSender};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fbg_daq")]
#[command(about = "FBG thermal calibration and baking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured program
    Run {
        /// Settings file
        #[arg(short, long)]
        config: PathBuf,

        /// Use the simulated bench instead of real instruments
        #[arg(long)]
        simulate: bool,
    },

    /// Check a settings file and print the program layout
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print how far the configured program has come
    Status {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, simulate } => run(config, simulate).await,
        Commands::Validate { config } => validate(config),
        Commands::Status { config } => status(config).await,
    }
}

fn load(path: &Path) -> Result<Settings> {
    Settings::load(path).with_context(|| format!("loading settings from {}", path.display()))
}

fn init_tracing(app: &ApplicationConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&app.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if app.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn simulated_devices(program: &ProgramConfig, sim: &SimulationConfig) -> DeviceSet {
    let bench = MockBench::first_order(sim.start_c, sim.time_constant, sim.noise_c);
    for (i, channel) in program.channels.iter().enumerate() {
        bench.add_sensor(SimulatedSensor::new(
            channel.interrogator_channel,
            channel.switch_position,
            1530.0 + 4.0 * i as f64,
        ));
    }
    bench.devices(sim.switch_settle)
}

async fn run(path: PathBuf, simulate: bool) -> Result<()> {
    let settings = load(&path)?;
    init_tracing(&settings.application);
    info!(name = %settings.application.name, simulate, "starting");

    let store = open_store(&settings.storage)?;
    let devices = if simulate {
        simulated_devices(&settings.program, &settings.simulation)
    } else {
        DeviceSet::from_config(&settings.devices)?
    };
    let (reporter, messages) = report_channel(&settings.report);

    let program = settings.program.clone();
    let state = match program.kind() {
        ProgramKind::Calibration => {
            run_program::<CalibrationStrategy>(program, devices, store, reporter, messages).await
        }
        ProgramKind::Baking => {
            run_program::<BakingStrategy>(program, devices, store, reporter, messages).await
        }
    }?;
    info!(%state, "finished");
    Ok(())
}

async fn run_program<S: ProgramStrategy>(
    program: ProgramConfig,
    devices: DeviceSet,
    store: Arc<dyn RecordStore>,
    reporter: ReportSender,
    mut messages: ReportReceiver,
) -> Result<ProgramState> {
    let runner = ProgramRunner::<S>::new(program, devices, store, reporter)?;
    let (handle, task) = runner.spawn();

    let printer = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            println!("{message}");
        }
        let dropped = messages.dropped();
        if dropped > 0 {
            println!("({dropped} messages dropped)");
        }
    });

    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next poll");
            stopper.stop();
        }
    });

    let outcome = task.await.context("program task panicked")?;
    printer.await.ok();
    Ok(outcome?)
}

fn validate(path: PathBuf) -> Result<()> {
    let settings = load(&path)?;
    let program = &settings.program;
    println!("{} is valid", path.display());
    println!("  program:          {} ({})", program.id, program.kind());
    println!("  targets:          {:?} °C", program.targets_c);
    println!("  cycles:           {}", program.cycles);
    println!("  points per cycle: {}", program.points_per_cycle());
    let channels: Vec<String> = program
        .channels_under_test()
        .map(|c| c.sensor_id.to_string())
        .collect();
    println!("  channels:         {}", channels.join(", "));
    Ok(())
}

async fn status(path: PathBuf) -> Result<()> {
    let settings = load(&path)?;
    let store = open_store(&settings.storage)?;
    let program = &settings.program;

    let Some(manifest) = store.manifest(&program.id).await? else {
        println!("program {} has no recorded data", program.id);
        return Ok(());
    };
    let done = store.last_completed_cycle(&program.id).await?;
    println!(
        "program {} ({}): {done} of {} cycles complete, {} points per cycle",
        manifest.id, manifest.kind, program.cycles, manifest.points_per_cycle
    );
    Ok(())
}
