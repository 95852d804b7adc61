use clap::Parser;
use iorunner::{config::RunConfig, controller, RunController, RunStatus};
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "iorunner", version, about = "IO workload scheduler and driver")]
struct Cli {
    /// path to the run configuration (YAML)
    config: PathBuf,

    /// validate the configuration and exit without launching anything
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match RunConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            error!(path = %cli.config.display(), %error, "failed to load configuration");
            return ExitCode::from(2);
        }
    };

    if config.preflight_checks() {
        error!("configuration failed preflight checks, refusing to start");
        return ExitCode::from(2);
    }

    if cli.dry_run {
        info!("configuration OK");
        return ExitCode::SUCCESS;
    }

    controller::install_signal_handlers();

    match RunController::new(config).run() {
        Ok(RunStatus::Clean) => ExitCode::SUCCESS,
        Ok(RunStatus::Aborted) => ExitCode::from(1),
        Err(error) => {
            error!(%error, "run failed");
            ExitCode::from(2)
        }
    }
}
