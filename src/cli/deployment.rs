//! `conductor deployment ...`

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Subcommand, ValueEnum};

use crate::cli::table::Table;
use crate::config::DeploymentFilter;
use crate::deployment::env::deployment_vars;
use crate::deployment::DeploymentDriver;
use crate::error::{Error, Result};
use crate::ports::Ports;
use crate::service::ServiceDriver;
use crate::supervisor::units::{
    deployment_config_unit, deployment_unit, DEPLOYMENT_UNIT_PREFIX, FUNCTION_SOCKET_UNIT_PREFIX,
};
use crate::supervisor::{ActiveState, KillSignal};

#[derive(Subcommand)]
pub enum DeploymentCommand {
    /// List deployments
    Ls {
        /// Only deployments of this service
        #[arg(short, long)]
        service: Option<String>,
    },
    /// Stop deployments and delete their state
    Rm {
        #[arg(required = true)]
        deployments: Vec<String>,
    },
    /// Print the deployment document as JSON
    Inspect { deployment: String },
    /// Show the deployment's units
    Status { deployment: String },
    /// Start the deployment unit
    Start { deployment: String },
    /// Stop the deployment unit
    Stop { deployment: String },
    /// Stop, then start the deployment unit
    Restart { deployment: String },
    /// Signal the deployment unit's processes
    Kill {
        deployment: String,
        #[arg(short, long, value_enum, default_value_t = SignalArg::Term)]
        signal: SignalArg,
    },
    /// Print the name of the deployment unit
    Unit { deployment: String },
    /// Print the variables hooks and templates see
    Env { deployment: String },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SignalArg {
    Term,
    Kill,
}

impl From<SignalArg> for KillSignal {
    fn from(arg: SignalArg) -> Self {
        match arg {
            SignalArg::Term => KillSignal::Term,
            SignalArg::Kill => KillSignal::Kill,
        }
    }
}

/// Directory of an existing deployment.
pub fn existing_dir(ports: &Ports, name: &str) -> Result<PathBuf> {
    let dir = ports.env.deployment_dir(name);
    if name.is_empty() || name.contains('/') || !dir.is_dir() {
        return Err(Error::UnknownDeployment(name.to_string()));
    }
    Ok(dir)
}

pub async fn run(command: DeploymentCommand, ports: &Ports) -> Result<()> {
    let supervisor = &ports.supervisor;
    match command {
        DeploymentCommand::Ls { service } => list(ports, service.as_deref()).await?,
        DeploymentCommand::Rm { deployments } => {
            let driver = ServiceDriver::new(ports.clone());
            for name in deployments {
                existing_dir(ports, &name)?;
                driver.remove_deployment(&name).await?;
            }
        }
        DeploymentCommand::Inspect { deployment } => {
            let dir = existing_dir(ports, &deployment)?;
            let (deployment, _) = DeploymentDriver::new(ports.clone()).load(&dir)?;
            match serde_json::to_string_pretty(&deployment) {
                Ok(text) => println!("{text}"),
                Err(e) => tracing::error!(error = %e, "Cannot encode JSON"),
            }
        }
        DeploymentCommand::Status { deployment } => {
            existing_dir(ports, &deployment)?;
            let mut units = vec![deployment_unit(&deployment), deployment_config_unit(&deployment)];
            let sockets = format!("{FUNCTION_SOCKET_UNIT_PREFIX}{deployment}-*.socket");
            units.extend(supervisor.list_units(&[sockets]).await?.into_iter().map(|u| u.name));

            let mut table = Table::new(["UNIT", "LOAD", "ACTIVE", "SUB"]);
            for unit in units {
                let s = supervisor.unit_status(&unit).await?;
                table.row(vec![s.name, s.load, s.active.to_string(), s.sub]);
            }
            print!("{}", table.render());
        }
        DeploymentCommand::Start { deployment } => {
            existing_dir(ports, &deployment)?;
            supervisor.start_unit(&deployment_unit(&deployment)).await?;
        }
        DeploymentCommand::Stop { deployment } => {
            existing_dir(ports, &deployment)?;
            supervisor
                .stop_unit(&deployment_unit(&deployment), Some(ports.env.stop_grace()))
                .await?;
        }
        DeploymentCommand::Restart { deployment } => {
            existing_dir(ports, &deployment)?;
            let unit = deployment_unit(&deployment);
            supervisor.stop_unit(&unit, Some(ports.env.stop_grace())).await?;
            supervisor.start_unit(&unit).await?;
        }
        DeploymentCommand::Kill { deployment, signal } => {
            existing_dir(ports, &deployment)?;
            supervisor
                .kill_unit(&deployment_unit(&deployment), signal.into())
                .await?;
        }
        DeploymentCommand::Unit { deployment } => println!("{}", deployment_unit(&deployment)),
        DeploymentCommand::Env { deployment } => {
            let dir = existing_dir(ports, &deployment)?;
            let (deployment, service) = DeploymentDriver::new(ports.clone()).load(&dir)?;
            for (key, value) in deployment_vars(&service, &deployment, &dir) {
                println!("{key}={value}");
            }
        }
    }
    Ok(())
}

async fn list(ports: &Ports, service: Option<&str>) -> Result<()> {
    let filter = match service {
        Some(name) => DeploymentFilter::service(&ports.store.load_service_by_name(name)?.dir),
        None => DeploymentFilter::default(),
    };
    let entries = ports.store.list_deployments(&filter)?;

    let pattern = format!("{DEPLOYMENT_UNIT_PREFIX}*");
    let states: HashMap<String, ActiveState> = ports
        .supervisor
        .list_units(&[pattern])
        .await?
        .into_iter()
        .map(|u| (u.name, u.active))
        .collect();

    let mut table = Table::new(["NAME", "SERVICE", "PART", "STATE", "IP"]);
    for entry in entries {
        let document = ports.store.load_deployment(&entry.dir).ok();
        let service = document
            .as_ref()
            .map(|d| format!("{}-{}", d.app, d.instance))
            .unwrap_or_else(|| entry.seed.service_dir.display().to_string());
        let ip = document.and_then(|d| d.pod_ip).unwrap_or_default();
        let state = states
            .get(&deployment_unit(&entry.name))
            .map(ToString::to_string)
            .unwrap_or_else(|| ActiveState::Inactive.to_string());
        table.row(vec![
            entry.name,
            service,
            entry.seed.part.unwrap_or_default(),
            state,
            ip,
        ]);
    }
    print!("{}", table.render());
    Ok(())
}
