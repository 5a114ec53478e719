//! cryo_daq command line.
//!
//! ```text
//! cryo_daq validate --config config/station.toml --plan config/plan.toml
//! cryo_daq estimate --plan config/plan.toml
//! cryo_daq drivers  --config config/station.toml
//! cryo_daq run      --config config/station.toml --plan config/plan.toml
//! cryo_daq monitor  --config config/station.toml --interval 2s --duration 1h
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cryo_daq::config::{LogFormat, Settings};
use cryo_daq::instrument::{DriverResolver, SimulatedBench};
use cryo_daq::metadata::MetadataBuilder;
use cryo_daq::plan::RunPlan;
use cryo_daq::safety::{estimate_duration, validate_sequence};
use cryo_daq::session::run_plan;
use cryo_daq::station::Station;
use cryo_daq::storage::persist_result;
use cryo_daq::sweep::{run_monitor, validate_series, EmergencyStop, MonitorConfig};

#[derive(Parser, Debug)]
#[command(
    name = "cryo_daq",
    version,
    about = "Transport measurement sweeps for a dilution refrigerator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every sweep and series of a plan and persist the results.
    Run(RunArgs),
    /// Record sample resistance at a fixed excitation until stopped.
    Monitor(MonitorArgs),
    /// Check a plan against the station safety limits without touching hardware.
    Validate(RunArgs),
    /// Print the expected duration of every sweep in a plan.
    Estimate(EstimateArgs),
    /// Resolve drivers for the configured instruments and print which one is active.
    Drivers(StationArgs),
}

#[derive(Args, Debug)]
struct StationArgs {
    /// Station configuration (TOML).
    #[arg(long, default_value = "config/station.toml")]
    config: PathBuf,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Station configuration (TOML).
    #[arg(long, default_value = "config/station.toml")]
    config: PathBuf,
    /// Run plan (TOML).
    #[arg(long)]
    plan: PathBuf,
}

#[derive(Args, Debug)]
struct MonitorArgs {
    /// Station configuration (TOML).
    #[arg(long, default_value = "config/station.toml")]
    config: PathBuf,
    /// Excitation current (A).
    #[arg(long, default_value_t = 1e-6)]
    excitation_current: f64,
    /// Time between readings, e.g. "500ms" or "2s".
    #[arg(long, default_value = "1s", value_parser = humantime_serde::re::humantime::parse_duration)]
    interval: Duration,
    /// Stop after this long; runs until Ctrl-C when neither this nor --max-points is given.
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    duration: Option<Duration>,
    /// Stop after this many readings.
    #[arg(long)]
    max_points: Option<usize>,
    /// Readings averaged per row.
    #[arg(long, default_value_t = 1)]
    averages: u32,
    /// Experiment name recorded in the metadata.
    #[arg(long, default_value = "Resistance monitor")]
    name: String,
    /// Sample identifier recorded in the metadata.
    #[arg(long, default_value = "")]
    sample: String,
}

#[derive(Args, Debug)]
struct EstimateArgs {
    /// Run plan (TOML).
    #[arg(long)]
    plan: PathBuf,
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let settings = Settings::load_from(path)
        .with_context(|| format!("Failed to load station configuration from {:?}", path))?;
    init_tracing(&settings.application.log_level, settings.application.log_format);
    Ok(settings)
}

async fn load_plan(path: &Path) -> Result<RunPlan> {
    RunPlan::load(path)
        .await
        .with_context(|| format!("Failed to load run plan from {:?}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Monitor(args) => monitor(args).await,
        Command::Validate(args) => validate(args).await,
        Command::Estimate(args) => estimate(args).await,
        Command::Drivers(args) => drivers(args).await,
    }
}

async fn validate(args: RunArgs) -> Result<()> {
    let settings = load_settings(&args.config)?;
    let plan = load_plan(&args.plan).await?;
    let warnings = validate_sequence(&plan.sweeps, &settings.safety)?;
    for warning in &warnings {
        println!("warning: {}", warning);
    }
    for (index, series) in plan.series.iter().enumerate() {
        validate_series(series, &settings.safety).with_context(|| format!("series {}", index))?;
    }
    println!(
        "{} sweep(s) and {} series pass the safety limits of '{}'",
        plan.sweeps.len(),
        plan.series.len(),
        settings.application.name
    );
    Ok(())
}

async fn estimate(args: EstimateArgs) -> Result<()> {
    init_tracing("warn", LogFormat::Pretty);
    let plan = load_plan(&args.plan).await?;
    let mut total = Duration::ZERO;
    for (index, sweep) in plan.sweeps.iter().enumerate() {
        let duration = estimate_duration(sweep);
        total += duration;
        println!(
            "{:>3}  {:<13} {:>5} points  {:>10.1} s",
            index,
            sweep.kind().to_string(),
            sweep.setpoints().len(),
            duration.as_secs_f64()
        );
    }
    for (index, series) in plan.series.iter().enumerate() {
        let duration = series.estimated_duration();
        total += duration;
        println!(
            "{:>3}  {:<13} {:>5} outer     {:>10.1} s",
            format!("s{}", index),
            series.sweep.kind().to_string(),
            series.outer.points().len(),
            duration.as_secs_f64()
        );
    }
    println!("total {:.1} min", total.as_secs_f64() / 60.0);
    Ok(())
}

async fn drivers(args: StationArgs) -> Result<()> {
    let settings = load_settings(&args.config)?;
    let resolver = DriverResolver::with_builtin(SimulatedBench::default());
    let station = Station::from_settings(&settings, &resolver)
        .await
        .context("Failed to build station")?;
    for report in station.driver_report() {
        let skipped: Vec<String> = report
            .skipped
            .iter()
            .map(|s| format!("{} ({})", s.source, s.reason))
            .collect();
        println!(
            "{:<24} {:<14} {:<10} {:<9} {}",
            report.role.to_string(),
            report.instrument,
            report.source.to_string(),
            report.variant.to_string(),
            skipped.join(", ")
        );
    }
    Ok(())
}

fn spawn_ctrl_c(stop: &EmergencyStop) {
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, raising emergency stop");
            ctrl_c_stop.raise();
        }
    });
}

async fn build_station(settings: &Settings) -> Result<Station> {
    let resolver = DriverResolver::with_builtin(SimulatedBench::default());
    Station::from_settings(settings, &resolver)
        .await
        .context("Failed to build station")
}

async fn run(args: RunArgs) -> Result<()> {
    let settings = load_settings(&args.config)?;
    let plan = load_plan(&args.plan).await?;
    let station = build_station(&settings).await?;

    let stop = EmergencyStop::new();
    spawn_ctrl_c(&stop);

    let summary = run_plan(&station, &plan, &settings.storage, &stop).await?;
    info!(
        files = summary.saved.len(),
        cancelled = summary.cancelled,
        "run plan finished"
    );
    Ok(())
}

async fn monitor(args: MonitorArgs) -> Result<()> {
    let settings = load_settings(&args.config)?;
    let station = build_station(&settings).await?;
    let config = MonitorConfig {
        excitation_current: args.excitation_current,
        interval: args.interval,
        duration: args.duration,
        max_points: args.max_points,
        averages: args.averages,
    };

    let stop = EmergencyStop::new();
    spawn_ctrl_c(&stop);

    let (result, failure) = match run_monitor(&station, &config, &stop).await {
        Ok(result) => (result, None),
        Err(e) => {
            let (partial, source) = e.into_parts();
            if source.is_preflight() {
                return Err(source).context("monitor rejected");
            }
            error!(error = %source, "monitor failed, driving station to safe state");
            if let Err(e) = station.emergency_stop().await {
                error!(error = %e, "safe state incomplete");
            }
            (partial, Some(source))
        }
    };

    let metadata = MetadataBuilder::new()
        .experiment_name(&args.name)
        .sample(&args.sample)
        .result(&result)
        .monitor(&config)?
        .safety(station.limits())
        .drivers(&station.driver_report())
        .build();
    let path = persist_result(&settings.storage, &metadata, &result)
        .await
        .context("Failed to persist monitor result")?;
    info!(path = %path.display(), rows = result.len(), "monitor result saved");

    match failure {
        Some(source) => Err(source).context("monitor failed"),
        None => Ok(()),
    }
}
