//! Authorization sidecar.
//!
//! Answers Caddy's forward-auth subrequests against the policies in the
//! config directory, reloading them when the directory changes. Normally
//! socket-activated; exits after a quiet period.

use std::process::ExitCode;
use std::sync::Arc;

use arc_swap::ArcSwap;
use clap::Parser;

use conductor::config::store::load_policies;
use conductor::config::watcher::PolicyWatcher;
use conductor::config::EnvironmentContext;
use conductor::http::{IdleServer, Listener, StopReason};
use conductor::observability::{logging, metrics};
use conductor::policy::server::{router, SidecarState};
use conductor::runtime::{signals, Shutdown};

#[derive(Parser)]
#[command(name = "conductor-policy")]
#[command(about = "Policy check sidecar for the reverse proxy", long_about = None)]
struct Cli {
    /// Bind this address (`unix:<path>` or `host:port`) when not socket-activated
    #[arg(short, long, default_value = "127.0.0.1:2020")]
    listen: String,

    /// Never exit for inactivity
    #[arg(long)]
    no_idle: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let env = EnvironmentContext::load()?;
    logging::init(&env.log_level, env.log_format);

    if let Some(addr) = &env.metrics_address {
        match addr.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(metrics_address = %addr, error = %e, "Failed to parse metrics address"),
        }
    }

    let dir = env.policies_dir();
    let policies = Arc::new(ArcSwap::from_pointee(load_policies(&dir)?));
    tracing::info!(count = policies.load().len(), dir = %dir.display(), "Policies loaded");
    let _watcher = PolicyWatcher::new(&dir, policies.clone()).run()?;

    let listener = match Listener::from_activation()? {
        Some(listener) => listener,
        None => Listener::bind(&cli.listen).await?,
    };

    let shutdown = Shutdown::new();
    signals::spawn_handler(shutdown.clone());

    let idle_after = (!cli.no_idle).then(|| env.idle_after());
    let reason = IdleServer::new(idle_after)
        .serve(listener, router(SidecarState { policies }), shutdown.subscribe())
        .await?;
    match reason {
        StopReason::Idle => tracing::info!("Idle, exiting"),
        StopReason::Cancelled => tracing::info!("Shutdown complete"),
    }
    Ok(())
}
