//! run-contract - Main entry point
//!
//! Parses the command line, sets up logging on stderr, runs one subcommand
//! and exits with its code: 0 ok, 1 structural error, 2 strict violation.

use run_contract::cli::{Cli, Commands};
use run_contract::config::EngineSettings;
use run_contract::error::Result;
use run_contract::lifecycle::{CommandReport, Engine};
use run_contract::remote::store_from_settings;
use run_contract::task_state::TaskState;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber; RUST_LOG overrides the default level
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn emit(report: &dyn CommandReport) -> i32 {
    for line in report.lines() {
        println!("{}", line);
    }
    report.exit_code()
}

fn run(cli: Cli) -> Result<i32> {
    let settings = EngineSettings::from_env()?;
    let objects = store_from_settings(&settings);
    let engine = Engine::new(&settings, objects.as_ref());

    let code = match cli.command {
        Commands::Init(args) => emit(&engine.init(&args.into())?),
        Commands::Preflight(args) => emit(&engine.preflight(&args.into())?),
        Commands::RecordProduced(args) => emit(&engine.record_produced(&args.into())?),
        Commands::MarkTaskRunning(args) => {
            emit(&engine.mark_task(&args.into_request(TaskState::Running))?)
        }
        Commands::MarkTaskSucceeded(args) => {
            emit(&engine.mark_task(&args.into_request(TaskState::Succeeded))?)
        }
        Commands::MarkTaskFailed(args) => {
            emit(&engine.mark_task(&args.into_request(TaskState::Failed))?)
        }
        Commands::Finalize(args) => emit(&engine.finalize(&args.into())?),
        Commands::CloudRunEnv(args) => emit(&engine.cloud_run_env(&args.into())?),
    };
    Ok(code)
}

fn main() {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed");

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("ERROR: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
