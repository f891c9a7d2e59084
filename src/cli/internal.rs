//! `conductor _ ...`: the commands unit files run.

use std::path::PathBuf;

use clap::Subcommand;

use crate::cli::deployment::existing_dir;
use crate::deployment::function;
use crate::deployment::{DeploymentDriver, Rendered};
use crate::error::{Error, Result};
use crate::http::{IdleServer, Listener, StopReason};
use crate::ports::Ports;
use crate::service::{ServiceDriver, StartOptions};

#[derive(Subcommand)]
pub enum InternalCommand {
    /// Service unit entry points
    Service {
        #[command(subcommand)]
        command: ServiceHook,
    },
    /// Deployment unit entry points
    Deployment {
        #[command(subcommand)]
        command: DeploymentHook,
    },
    /// Function socket entry points
    Function {
        #[command(subcommand)]
        command: FunctionCommand,
    },
}

#[derive(Subcommand)]
pub enum ServiceHook {
    /// ExecStart: bring deployments up, report ready, then monitor
    Start { path: PathBuf },
    /// ExecReload: bring deployments in line once
    Reload {
        path: PathBuf,
        #[arg(long)]
        fresh: bool,
    },
    /// ExecStop
    Stop { path: PathBuf },
    /// ExecStopPost
    Cleanup { path: PathBuf },
    /// Add the service-level routes
    Register { path: PathBuf },
    /// Remove the service-level routes
    Deregister { path: PathBuf },
    /// Print the rendered service-level proxy config
    Template { path: PathBuf },
}

#[derive(Subcommand)]
pub enum DeploymentHook {
    /// ExecStartPre: render manifests, run pre-start hooks
    Prepare { deployment: String },
    /// ExecStart: start the pod and its companions
    Start { deployment: String },
    /// ExecStop
    Stop { deployment: String },
    /// ExecStopPost
    Cleanup { deployment: String },
    /// Add the deployment's routes
    Register { deployment: String },
    /// Remove the deployment's routes
    Deregister { deployment: String },
    /// Print the rendered manifests and proxy config
    Template { deployment: String },
}

#[derive(Subcommand)]
pub enum FunctionCommand {
    /// Serve one function over its activated socket
    Serve {
        /// `<deployment>-<function>`
        id: String,
        /// Bind this address (`unix:<path>` or `host:port`) when not socket-activated
        #[arg(long)]
        listen: Option<String>,
    },
}

pub async fn run(command: InternalCommand, ports: &Ports) -> Result<()> {
    match command {
        InternalCommand::Service { command } => service(command, ports).await,
        InternalCommand::Deployment { command } => deployment(command, ports).await,
        InternalCommand::Function { command } => match command {
            FunctionCommand::Serve { id, listen } => serve_function(ports, &id, listen).await,
        },
    }
}

async fn service(command: ServiceHook, ports: &Ports) -> Result<()> {
    let driver = ServiceDriver::new(ports.clone());
    let options = |restart: bool, wants_fresh: bool| StartOptions {
        restart,
        wants_fresh,
        max_index: ports.env.max_index,
    };
    match command {
        ServiceHook::Start { path } => driver.start(&path, options(false, false)).await,
        ServiceHook::Reload { path, fresh } => driver.start(&path, options(true, fresh)).await,
        ServiceHook::Stop { path } => driver.stop(&path).await,
        ServiceHook::Cleanup { path } => driver.cleanup(&path).await,
        ServiceHook::Register { path } => driver.register(&path, true).await,
        ServiceHook::Deregister { path } => driver.register(&path, false).await,
        ServiceHook::Template { path } => {
            let service = ports.store.load_service(&path)?;
            if let Some(text) = driver.render_proxy_config(&service)? {
                print!("{text}");
            }
            Ok(())
        }
    }
}

async fn deployment(command: DeploymentHook, ports: &Ports) -> Result<()> {
    let driver = DeploymentDriver::new(ports.clone());
    match command {
        DeploymentHook::Prepare { deployment } => {
            driver.prepare(&existing_dir(ports, &deployment)?).await?;
        }
        DeploymentHook::Start { deployment } => {
            driver.start(&existing_dir(ports, &deployment)?).await?;
        }
        DeploymentHook::Stop { deployment } => driver.stop(&existing_dir(ports, &deployment)?).await?,
        DeploymentHook::Cleanup { deployment } => {
            driver.cleanup(&existing_dir(ports, &deployment)?).await?
        }
        DeploymentHook::Register { deployment } => {
            driver.caddy_register(&existing_dir(ports, &deployment)?, true).await?
        }
        DeploymentHook::Deregister { deployment } => {
            driver.caddy_register(&existing_dir(ports, &deployment)?, false).await?
        }
        DeploymentHook::Template { deployment } => {
            let rendered = driver.render(&existing_dir(ports, &deployment)?)?;
            print!("{}", format_rendered(&rendered));
        }
    }
    Ok(())
}

/// Rendered documents as one multi-document YAML stream.
fn format_rendered(rendered: &Rendered) -> String {
    let mut out = String::new();
    let sections = [
        ("pod", &rendered.pod),
        ("config map", &rendered.config_map),
        ("proxy config", &rendered.proxy_config),
    ];
    for (title, text) in sections {
        let Some(text) = text else { continue };
        out.push_str(&format!("--- # {title}\n{text}"));
        if !text.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

async fn serve_function(ports: &Ports, id: &str, listen: Option<String>) -> Result<()> {
    let target = function::resolve(&ports.store, id)?;
    let default_socket = crate::deployment::env::function_socket(&target.dir, &target.function.name);

    let listener = match Listener::from_activation().map_err(|e| Error::io("LISTEN_FDS", e))? {
        Some(listener) => listener,
        None => {
            let addr = listen.unwrap_or_else(|| format!("unix:{}", default_socket.display()));
            Listener::bind(&addr).await.map_err(|e| Error::io(&addr, e))?
        }
    };
    let address = listener.describe();

    tracing::info!(function = %id, address = %address, "Serving function");
    let router = function::router(target, &ports.store)?;
    let reason = IdleServer::new(Some(ports.env.idle_after()))
        .serve(listener, router, ports.shutdown.subscribe())
        .await
        .map_err(|e| Error::io(&address, e))?;
    match reason {
        StopReason::Idle => tracing::info!(function = %id, "Idle, exiting"),
        StopReason::Cancelled => tracing::info!(function = %id, "Shutdown requested"),
    }
    Ok(())
}
