//! CLI Entry Point for the CN0508 production test
//!
//! Runs the full board test against one instrument and prints the verdict.
//!
//! # Usage
//!
//! ```bash
//! # Board on the default bench address
//! cn0508-production-test
//!
//! # Another address, exit status reflecting the verdict
//! cn0508-production-test ip:192.168.2.1 --strict-exit
//!
//! # Dry run against the simulated board
//! cn0508-production-test sim:
//! ```
//!
//! # Exit status
//!
//! Without `--strict-exit` the process exits 0 whenever the procedure ran to a
//! verdict or found no device, and 1 on errors. With it: 0 board passed,
//! 1 board failed, 2 board could not be tested.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;

use cn0508_production_test::calibration::ScaleTable;
use cn0508_production_test::config::TestConfig;
use cn0508_production_test::logging;
use cn0508_production_test::operator::ConsoleOperator;
use cn0508_production_test::procedures::{self, RunOutcome};

const EXIT_SUCCESS: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_BOARD_FAILED: u8 = 1;
const EXIT_NOT_TESTED: u8 = 2;

#[derive(Parser)]
#[command(name = "cn0508-production-test")]
#[command(about = "Production test for the CN0508 power supply board", long_about = None)]
struct Cli {
    /// Instrument context URI (ip:<host>[:<port>], local: or sim:)
    uri: Option<String>,

    /// Configuration file (defaults to ./cn0508.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Exit status reflects the verdict (0 pass, 1 fail, 2 not tested)
    #[arg(long)]
    strict_exit: bool,

    /// Give up after this many potentiometer re-prompts
    #[arg(long)]
    max_pot_prompts: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let strict = cli.strict_exit;

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::from(EXIT_NOT_TESTED);
        }
    };

    let result = runtime.block_on(run(cli));
    // A console prompt may still be blocked reading stdin after Ctrl-C
    runtime.shutdown_background();

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if strict {
                ExitCode::from(EXIT_NOT_TESTED)
            } else {
                ExitCode::from(EXIT_ERROR)
            }
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => TestConfig::load_from(path),
        None => TestConfig::load(),
    }
    .context("Failed to load configuration")?;

    if let Some(uri) = cli.uri {
        config.instrument.uri = uri;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(max) = cli.max_pot_prompts {
        config.pot_gate.max_prompts = Some(max);
    }
    config.exit.strict |= cli.strict_exit;

    config.validate().context("Invalid configuration")?;
    logging::init_from_config(&config).context("Failed to initialize logging")?;

    let scales = ScaleTable::cn0508();
    let mut operator = ConsoleOperator::new();
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    let outcome = procedures::run(&config, &scales, &mut operator, interrupt).await;
    let code = ExitCode::from(exit_status(&outcome, config.exit.strict));

    match outcome {
        Ok(_) => Ok(code),
        Err(e) if config.exit.strict => {
            eprintln!("Error: {e}");
            Ok(code)
        }
        Err(e) => Err(e).context("Production test aborted"),
    }
}

/// Process exit status for a finished run.
fn exit_status(outcome: &cn0508_production_test::Result<RunOutcome>, strict: bool) -> u8 {
    match (outcome, strict) {
        (Ok(_), false) => EXIT_SUCCESS,
        (Err(_), false) => EXIT_ERROR,
        (Ok(RunOutcome::Completed(report)), true) if report.passed() => EXIT_SUCCESS,
        (Ok(RunOutcome::Completed(_)), true) => EXIT_BOARD_FAILED,
        (Ok(RunOutcome::NoDevice(_)), true) | (Err(_), true) => EXIT_NOT_TESTED,
    }
}
