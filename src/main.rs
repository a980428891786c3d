//! CLI Entry Point for eol_station
//!
//! Provides command-line interface for:
//! - Running a test plan against a DUT
//! - Validating a test plan without hardware
//!
//! # Usage
//!
//! Run a plan against the simulated station:
//! ```bash
//! eol_station run plans/charger.toml --dut-uid 1042 --simulate --output report.json
//! ```
//!
//! Check a plan:
//! ```bash
//! eol_station validate plans/charger.toml
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eol_station::config::StationConfig;
use eol_station::simulation::SimulatedStation;
use eol_station::transport::MessageDatabase;
use eol_station::{logging, SequenceEvent, Sequencer, TestPlan, TestRunner};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "eol_station")]
#[command(about = "End-of-line test station engine", long_about = None)]
struct Cli {
    /// Station configuration file (defaults to eol_station.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test plan against a DUT
    Run {
        /// Path to the TOML test plan
        plan: PathBuf,

        /// Unique id of the device under test
        #[arg(long)]
        dut_uid: i64,

        /// Run against a simulated nominal DUT and oscilloscope
        #[arg(long)]
        simulate: bool,

        /// Write the sequence report as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Check a test plan without touching hardware
    Validate {
        /// Path to the TOML test plan
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StationConfig::load_from(path),
        None => StationConfig::load(),
    }
    .context("Failed to load station configuration")?;
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Run {
            plan,
            dut_uid,
            simulate,
            output,
        } => run_plan(&config, plan, dut_uid, simulate, output).await,
        Commands::Validate { plan } => validate_plan(plan),
    }
}

fn load_plan(path: &Path) -> Result<TestPlan> {
    TestPlan::load(path).with_context(|| format!("Failed to load test plan {}", path.display()))
}

fn validate_plan(path: PathBuf) -> Result<ExitCode> {
    let plan = load_plan(&path)?;
    println!("{}: {} tests", path.display(), plan.tests.len());
    for (index, spec) in plan.tests.iter().enumerate() {
        println!(
            "  [{index}] {} ({}, mode {})",
            spec.name,
            spec.kind(),
            spec.test_mode
        );
    }
    println!("{} signals referenced", plan.signal_refs().len());
    Ok(ExitCode::SUCCESS)
}

async fn run_plan(
    config: &StationConfig,
    path: PathBuf,
    dut_uid: i64,
    simulate: bool,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let plan = load_plan(&path)?;
    if !simulate {
        bail!("no CAN adapter is available in this build; run with --simulate");
    }

    let database = config
        .can
        .database
        .as_ref()
        .map(MessageDatabase::load)
        .transpose()
        .context("Failed to load message database")?;
    let mode_signal = config.sequencer.mode_signal.clone();
    let station = SimulatedStation::nominal(&plan, database, mode_signal.as_ref())?;
    info!(tests = plan.tests.len(), dut_uid, "Running plan on simulated station");

    let runner = TestRunner::new(station.dut.clone())
        .with_scope(station.scope.clone())
        .with_timing(config.runner.clone());
    let mut sequencer = Sequencer::new(runner, config.sequencer.clone());
    if let Some(scope) = &config.instrument {
        sequencer = sequencer.with_scope_config(scope.clone());
    }

    let mut events = sequencer.subscribe();
    sequencer.start(plan.tests.clone(), dut_uid).await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{event}");
                if let SequenceEvent::TestModeMismatch { name, .. } = &event {
                    // The simulated operator switches the DUT into the required mode.
                    let required = plan.tests.iter().find(|t| &t.name == name).map(|t| t.test_mode);
                    if let (Some(signal), Some(mode)) = (&mode_signal, required) {
                        station.dut.pin(signal.clone(), f64::from(mode));
                        sequencer.resume();
                    }
                }
                if event.is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling sequence");
                sequencer.cancel();
            }
        }
    }

    let report = sequencer.wait().await?;
    println!("{}", report.summary);
    if let Some(path) = output {
        report
            .save(&path)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    Ok(if report.summary.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
