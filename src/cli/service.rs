//! `conductor service ...`

use std::collections::HashMap;

use clap::Subcommand;
use serde_json::Value;
use serde_json_path::JsonPath;

use crate::cli::table::Table;
use crate::cli::SelectArgs;
use crate::config::schema::Column;
use crate::config::{ConfigValue, DeploymentFilter, Service};
use crate::deployment::env::service_vars;
use crate::error::Result;
use crate::ports::Ports;
use crate::selector::{self, Bracket, Selector, SelectorError};
use crate::service::{ServiceDriver, StartOptions};
use crate::supervisor::units::{deployment_unit, service_config_unit, service_unit, SERVICE_UNIT_PREFIX};
use crate::supervisor::{ActiveState, UnitStatus};

#[derive(Subcommand)]
pub enum ServiceCommand {
    /// Start the service unit
    Start { service: String },
    /// Stop the service unit
    Stop { service: String },
    /// Stop, then start the service unit
    Restart { service: String },
    /// Bring deployments in line with the current service document now
    Deploy {
        service: String,
        /// Start new deployments even if matching ones are running
        #[arg(long)]
        fresh: bool,
    },
    /// Print the resolved service as JSON
    Inspect { service: String },
    /// List services
    Ls {
        #[command(flatten)]
        select: SelectArgs,
        /// Print JSON records instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved service document
    Show { service: String },
    /// Show the state of the service and its deployments
    Status { service: String },
    /// Print the name of the service unit
    Unit {
        service: String,
        /// The unit registering service-level routes instead
        #[arg(long)]
        config: bool,
    },
    /// Read or edit the service's config map
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the variables hooks and templates see
    Env { service: String },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// List config keys and values
    Ls { service: String },
    /// Print one value
    Get { service: String, key: String },
    /// Set a value, or remove the key when no value is given
    Set {
        service: String,
        key: String,
        value: Option<String>,
    },
}

pub async fn run(command: ServiceCommand, ports: &Ports) -> Result<()> {
    let store = &ports.store;
    let supervisor = &ports.supervisor;
    match command {
        ServiceCommand::Start { service } => {
            let service = store.load_service_by_name(&service)?;
            supervisor.start_unit(&service_unit(&service.dir)).await?;
        }
        ServiceCommand::Stop { service } => {
            let service = store.load_service_by_name(&service)?;
            supervisor.stop_unit(&service_unit(&service.dir), None).await?;
        }
        ServiceCommand::Restart { service } => {
            let service = store.load_service_by_name(&service)?;
            let unit = service_unit(&service.dir);
            supervisor.stop_unit(&unit, None).await?;
            supervisor.start_unit(&unit).await?;
        }
        ServiceCommand::Deploy { service, fresh } => {
            let service = store.load_service_by_name(&service)?;
            let options = StartOptions {
                restart: true,
                wants_fresh: fresh,
                max_index: ports.env.max_index,
            };
            ServiceDriver::new(ports.clone())
                .start(&service.file, options)
                .await?;
        }
        ServiceCommand::Inspect { service } => {
            let service = store.load_service_by_name(&service)?;
            print_json(&service.to_record());
        }
        ServiceCommand::Ls { select, json } => list(ports, &select, json).await?,
        ServiceCommand::Show { service } => {
            let service = store.load_service_by_name(&service)?;
            let text = serde_yaml::to_string(&service)?;
            print!("{text}");
        }
        ServiceCommand::Status { service } => status(ports, &service).await?,
        ServiceCommand::Unit { service, config } => {
            let service = store.load_service_by_name(&service)?;
            if config {
                println!("{}", service_config_unit(&service.dir));
            } else {
                println!("{}", service_unit(&service.dir));
            }
        }
        ServiceCommand::Config { command } => config(command, ports)?,
        ServiceCommand::Env { service } => {
            let service = store.load_service_by_name(&service)?;
            for (key, value) in service_vars(&service) {
                println!("{key}={value}");
            }
        }
    }
    Ok(())
}

async fn list(ports: &Ports, args: &SelectArgs, json: bool) -> Result<()> {
    let selector = Selector::parse(&args.filters)?;
    let bracket = Bracket::parse(
        args.stop_before.as_deref(),
        args.stop_after.as_deref(),
        args.resume_before.as_deref(),
        args.resume_after.as_deref(),
    )?;
    let services = selector::select(ports.store.list_services()?, &selector, &bracket);

    if json {
        let records: Vec<Value> = services.iter().map(Service::to_record).collect();
        print_json(&Value::Array(records));
        return Ok(());
    }

    let pattern = format!("{SERVICE_UNIT_PREFIX}*");
    let states: HashMap<String, ActiveState> = ports
        .supervisor
        .list_units(&[pattern])
        .await?
        .into_iter()
        .map(|u| (u.name, u.active))
        .collect();

    let extra = extra_columns(&services)?;
    let mut table = Table::new(
        ["NAME", "ID", "STATE"]
            .into_iter()
            .map(str::to_string)
            .chain(extra.iter().map(|(name, _)| name.to_uppercase())),
    );
    for service in &services {
        let state = states
            .get(&service_unit(&service.dir))
            .map(ToString::to_string)
            .unwrap_or_else(|| ActiveState::Inactive.to_string());
        let record = service.to_record();
        let mut row = vec![service.name(), service.short_id().to_string(), state];
        row.extend(extra.iter().map(|(_, path)| column_value(path, &record)));
        table.row(row);
    }
    print!("{}", table.render());
    Ok(())
}

/// Columns declared by any listed service, first declaration wins.
fn extra_columns(services: &[Service]) -> Result<Vec<(String, JsonPath)>, SelectorError> {
    let mut columns: Vec<(String, JsonPath)> = Vec::new();
    for Column { name, jsonpath } in services.iter().flat_map(|s| &s.columns) {
        if columns.iter().any(|(n, _)| n == name) {
            continue;
        }
        let path = JsonPath::parse(jsonpath).map_err(|e| SelectorError::JsonPath {
            path: jsonpath.clone(),
            reason: e.to_string(),
        })?;
        columns.push((name.clone(), path));
    }
    Ok(columns)
}

/// Selected values joined with commas; strings are shown unquoted.
pub fn column_value(path: &JsonPath, record: &Value) -> String {
    path.query(record)
        .all()
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

async fn status(ports: &Ports, name: &str) -> Result<()> {
    let service = ports.store.load_service_by_name(name)?;
    let supervisor = &ports.supervisor;

    let mut table = Table::new(["UNIT", "LOAD", "ACTIVE", "SUB"]);
    let mut add = |s: UnitStatus| table.row(vec![s.name, s.load, s.active.to_string(), s.sub]);
    add(supervisor.unit_status(&service_unit(&service.dir)).await?);
    add(supervisor.unit_status(&service_config_unit(&service.dir)).await?);
    for entry in ports
        .store
        .list_deployments(&DeploymentFilter::service(&service.dir))?
    {
        add(supervisor.unit_status(&deployment_unit(&entry.name)).await?);
    }
    println!("{} ({})", service.name(), service.dir.display());
    print!("{}", table.render());
    Ok(())
}

fn config(command: ConfigCommand, ports: &Ports) -> Result<()> {
    let store = &ports.store;
    match command {
        ConfigCommand::Ls { service } => {
            let service = store.load_service_by_name(&service)?;
            for (key, value) in &service.config {
                println!("{key}={value}");
            }
        }
        ConfigCommand::Get { service, key } => {
            let service = store.load_service_by_name(&service)?;
            if let Some(value) = service.config.get(&key) {
                println!("{value}");
            }
        }
        ConfigCommand::Set { service, key, value } => {
            let service = store.load_service_by_name(&service)?;
            let value = value.as_deref().map(ConfigValue::parse_cli);
            store.set_service_config(&service, &key, value)?;
            tracing::info!(service = %service.name(), key = %key, "Service config updated");
        }
    }
    Ok(())
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => tracing::error!(error = %e, "Cannot encode JSON"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn column_values_join_selected_nodes() {
        let record = json!({"config": {"port": 8080, "tier": "gold"}, "functions": [{"name": "a"}, {"name": "b"}]});
        let value = |p: &str| column_value(&JsonPath::parse(p).unwrap(), &record);
        assert_eq!(value("$.config.port"), "8080");
        assert_eq!(value("$.config.tier"), "gold");
        assert_eq!(value("$.functions[*].name"), "a,b");
        assert_eq!(value("$.missing"), "");
    }
}
