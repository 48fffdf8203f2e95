//! CLI Entry Point for chamber_scan
//!
//! Provides command-line interface for:
//! - Running a scan against the simulated chamber and analyzer
//! - Printing the traversal a configuration produces
//! - Summarizing a result file
//! - Validating a configuration file
//!
//! # Usage
//!
//! ```bash
//! chamber_scan --config config/scan.toml check-config
//! chamber_scan --config config/scan.toml mesh --limit 20
//! chamber_scan --config config/scan.toml run --name "Horn antenna"
//! chamber_scan inspect data/scan_20260301_140211_1a2b3c4d.json
//! ```
//!
//! Log verbosity follows `application.log_level`, overridden by `RUST_LOG`.

use anyhow::{Context, Result};
use chamber_scan::config::{Settings, DEFAULT_CONFIG_PATH};
use chamber_scan::data::{FaultJournal, Quantity, ScanResultReader};
use chamber_scan::experiment::mesh::generate;
use chamber_scan::experiment::{ScanEvent, ScanOrchestrator, ScanPlan};
use chamber_scan::hardware::mock::{MockAnalyzer, MockChamber};
use chamber_scan::metadata::RunMetadataBuilder;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chamber_scan")]
#[command(about = "Automated chamber scans with a vector network analyzer", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan on simulated hardware (Ctrl+C stops after the current point)
    Run {
        /// Experiment name stored in the result header
        #[arg(long)]
        name: Option<String>,

        /// Free-text description stored in the result header
        #[arg(long, default_value = "")]
        description: String,

        /// Simulated sweep time per trigger in milliseconds
        #[arg(long, default_value = "50")]
        sweep_ms: u64,
    },

    /// Print the traversal order of the configured mesh
    Mesh {
        /// Print at most this many points
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Summarize a result file
    Inspect {
        /// Result file written by `run`
        file: PathBuf,
    },

    /// Load and validate the settings file
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            name,
            description,
            sweep_ms,
        } => {
            let settings = load_settings(&cli.config, cli.json)?;
            run_scan(settings, name, description, sweep_ms).await
        }
        Commands::Mesh { limit } => {
            let settings = load_settings(&cli.config, cli.json)?;
            print_mesh(&settings, limit)
        }
        Commands::Inspect { file } => {
            init_tracing("info", cli.json);
            inspect(&file)
        }
        Commands::CheckConfig => {
            let settings = load_settings(&cli.config, cli.json)?;
            check_config(&settings, &cli.config)
        }
    }
}

fn load_settings(path: &Path, json: bool) -> Result<Settings> {
    let settings =
        Settings::load_from(path).with_context(|| format!("loading {}", path.display()))?;
    init_tracing(&settings.application.log_level, json);
    Ok(settings)
}

fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_scan(
    settings: Settings,
    name: Option<String>,
    description: String,
    sweep_ms: u64,
) -> Result<()> {
    let metadata = RunMetadataBuilder::new()
        .experiment_name(name.as_deref().unwrap_or(&settings.application.name))
        .description(&description)
        .build();
    let plan = ScanPlan::from_settings(&settings)?.with_metadata(metadata);

    println!("🔧 Initializing simulated hardware...");
    let chamber = Arc::new(MockChamber::new().with_speed(plan.jog_speed / 60.0));
    let analyzer = Arc::new(
        MockAnalyzer::new()
            .with_stage(chamber.clone())
            .with_sweep_time(Duration::from_millis(sweep_ms)),
    );
    let journal = settings
        .storage
        .fault_log
        .as_ref()
        .map(FaultJournal::new)
        .unwrap_or_default();

    let orchestrator = ScanOrchestrator::new(chamber, analyzer).with_fault_journal(journal);
    let mut events = orchestrator.subscribe();
    let stop = orchestrator.stop_signal();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Stop requested, finishing current point");
            stop.request();
        }
    });

    let handle = orchestrator.start(plan).await?;
    println!("▶️  Scan running - Press Ctrl+C to stop");

    loop {
        match events.recv().await {
            Ok(ScanEvent::Progress(update)) => println!("   {}", update.status_text),
            Ok(ScanEvent::Completed(done)) => {
                let verb = if done.interrupted { "⏹  Interrupted" } else { "✅ Completed" };
                println!("{} after {}", verb, done.duration_formatted);
                println!("   Result: {}", done.result_file.display());
                break;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => warn!(missed, "Event display fell behind"),
            Err(RecvError::Closed) => break,
        }
    }

    let outcome = handle.wait().await?;
    info!(
        state = %outcome.state,
        retries = outcome.total_retries,
        "Run finished"
    );
    Ok(())
}

fn print_mesh(settings: &Settings, limit: Option<usize>) -> Result<()> {
    let points = generate(&settings.mesh);
    println!(
        "{} traversal, {} points ({} layers of {})",
        settings.mesh.traversal,
        points.len(),
        settings.mesh.layer_count(),
        settings.mesh.layer_size()
    );
    for (i, point) in points.iter().take(limit.unwrap_or(usize::MAX)).enumerate() {
        match point.approach {
            Some(approach) => println!("{:>6}  {}  via {}", i, point.position, approach),
            None => println!("{:>6}  {}", i, point.position),
        }
    }
    Ok(())
}

fn check_config(settings: &Settings, path: &Path) -> Result<()> {
    let task = settings.acquisition_task()?;
    settings
        .chamber
        .envelope
        .check(&generate(&settings.mesh))?;

    println!("✅ {} is valid", path.display());
    println!(
        "   Mesh: {} points, {} traversal",
        settings.mesh.point_count(),
        settings.mesh.traversal
    );
    println!(
        "   Sweep: {:?} {:.3e} .. {:.3e} Hz, {} points",
        task.parameters, task.freq_start_hz, task.freq_stop_hz, task.points
    );
    println!("   Output: {}", settings.storage.output_dir.display());
    Ok(())
}

fn inspect(file: &Path) -> Result<()> {
    let dataset = ScanResultReader::load(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let header = dataset.header();

    println!("📄 {}", file.display());
    println!(
        "   Run {} \"{}\" started {}",
        header.metadata.run_id, header.metadata.experiment_name, header.metadata.started_at
    );
    println!(
        "   {} of {} points, {} ({})",
        header.points_acquired,
        header.mesh.point_count(),
        header.elapsed,
        if header.complete { "complete" } else { "interrupted" }
    );
    println!("   Parameters: {:?}", dataset.parameters());
    for (name, axis) in [
        ("x", dataset.x_axis()),
        ("y", dataset.y_axis()),
        ("z", dataset.z_axis()),
    ] {
        if let (Some(first), Some(last)) = (axis.first(), axis.last()) {
            println!("   {name}: {first:.3} .. {last:.3} mm, {} steps", axis.len());
        }
    }

    let (xi, yi, zi) = (
        dataset.x_axis().len() / 2,
        dataset.y_axis().len() / 2,
        dataset.z_axis().len() / 2,
    );
    let Some(&frequency) = dataset.frequencies().first() else {
        return Ok(());
    };
    for (p, parameter) in dataset.parameters().iter().enumerate() {
        let amplitude = dataset.get(Quantity::Amplitude, p, 0, xi, yi, zi);
        let phase = dataset.get(Quantity::Phase, p, 0, xi, yi, zi);
        if let (Some(amplitude), Some(phase)) = (amplitude, phase) {
            println!(
                "   {parameter} at mesh center, {frequency:.3e} Hz: |{parameter}| = {amplitude:.4}, ∠ {phase:.1}°"
            );
        }
    }
    Ok(())
}
