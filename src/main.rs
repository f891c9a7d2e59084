//! conductor: run podman pods as systemd-supervised services and keep
//! Caddy's routes in step with them.

use std::process::ExitCode;

use clap::Parser;

use conductor::cli::{self, Cli};
use conductor::error::Result;
use conductor::observability::logging;
use conductor::ports::Ports;
use conductor::runtime::{signals, Shutdown};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let env = cli.environment()?;
    logging::init(&env.log_level, env.log_format);

    let shutdown = Shutdown::new();
    signals::spawn_handler(shutdown.clone());

    let ports = Ports::system(env, shutdown)?;
    cli::dispatch(cli.command, &ports).await
}
