//! Command-line entry point.
//!
//! Loads the run configuration, executes one lock-and-sweep run against the
//! built-in simulated bench, and exports the calibrated dataset to CSV.
//! Hardware transports plug in behind the instrument capability traits; the
//! simulated bench exercises the identical control path.

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use heterodyne_daq::config::RunConfig;
use heterodyne_daq::estimator::BeatEstimator;
use heterodyne_daq::instrument::sim::{SimSettings, SimulatedBench};
use heterodyne_daq::run::{Bench, RunOrchestrator};
use heterodyne_daq::storage::{default_output_path, export_csv};

#[derive(Parser)]
#[command(name = "heterodyne_daq", version, about = "Beat-frequency lock-and-sweep runner")]
struct Cli {
    /// Path to the run configuration file
    #[arg(short, long, default_value = "config/heterodyne.toml")]
    config: PathBuf,

    /// Output CSV path; defaults to a timestamped file under --output-dir
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory for default output file names
    #[arg(long, default_value = "data")]
    output_dir: PathBuf,

    /// Seed for the simulated bench's noise stream
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG controls verbosity
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = RunConfig::load_from(&cli.config)?;
    let orchestrator = RunOrchestrator::new(config.clone())?;

    // Ctrl-C cancels cooperatively; the run returns whatever it collected
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancellation requested, stopping at the next step boundary");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let sim = SimulatedBench::new(
        config.laser.reference_channel,
        config.laser.tuned_channel,
        config.laser.reference_wavelength_nm,
        config.laser.tuned_wavelength_nm,
        cli.seed,
        SimSettings::default(),
    );
    let mut bench = Bench {
        laser: Box::new(sim.laser.clone()),
        estimator: Box::new(BeatEstimator::new(
            Box::new(sim.wavelength_meter.clone()),
            Box::new(sim.spectrum_analyzer.clone()),
        )),
        rf_sensor: Box::new(sim.rf_sensor.clone()),
        source_meter: Box::new(sim.source_meter.clone()),
        attenuator: Box::new(sim.attenuator.clone()),
    };

    let result = orchestrator.run(&mut bench).await?;

    let path = cli
        .output
        .unwrap_or_else(|| default_output_path(&cli.output_dir, &config.metadata.device_label));
    export_csv(&result, &path)?;

    println!(
        "{} records ({}) -> {}",
        result.dataset.records.len(),
        if result.cancelled {
            "cancelled"
        } else {
            "complete"
        },
        path.display()
    );
    Ok(())
}
