//! `conductor policy ...` and `conductor peer ...`

use std::io::Read;
use std::path::PathBuf;

use clap::Subcommand;

use crate::error::{Error, Result};
use crate::policy::invite::{invite, list_peers};
use crate::policy::Policy;
use crate::ports::Ports;

#[derive(Subcommand)]
pub enum PolicyCommand {
    /// List policy names
    List,
    /// Create or replace a policy from YAML (stdin unless --file)
    Create {
        name: String,
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print a policy as YAML
    Show { name: String },
    /// Print a policy as JSON
    Inspect { name: String },
}

#[derive(Subcommand)]
pub enum PeerCommand {
    /// List invited peers
    List,
    /// Issue a bearer token for a peer, replacing any earlier one
    Invite { name: String },
}

pub fn run_policy(command: PolicyCommand, ports: &Ports) -> Result<()> {
    let store = &ports.store;
    match command {
        PolicyCommand::List => {
            for policy in store.list_policies()? {
                println!("{}", policy.name);
            }
        }
        PolicyCommand::Create { name, file } => {
            let text = match &file {
                Some(path) => std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?,
                None => {
                    let mut text = String::new();
                    std::io::stdin()
                        .read_to_string(&mut text)
                        .map_err(|e| Error::io("<stdin>", e))?;
                    text
                }
            };
            let policy = parse_policy(&name, &text)?;
            store.save_policy(&policy)?;
            tracing::info!(policy = %policy.name, "Policy saved");
        }
        PolicyCommand::Show { name } => {
            let policy = store.load_policy(&name)?;
            print!("{}", serde_yaml::to_string(&policy)?);
        }
        PolicyCommand::Inspect { name } => {
            let policy = store.load_policy(&name)?;
            match serde_json::to_string_pretty(&policy) {
                Ok(text) => println!("{text}"),
                Err(e) => tracing::error!(error = %e, "Cannot encode JSON"),
            }
        }
    }
    Ok(())
}

/// Parse a policy body; the command-line name wins over any `name:` key.
fn parse_policy(name: &str, text: &str) -> Result<Policy> {
    let mut value: serde_yaml::Value = if text.trim().is_empty() {
        serde_yaml::Value::Mapping(Default::default())
    } else {
        serde_yaml::from_str(text)?
    };
    if let serde_yaml::Value::Mapping(map) = &mut value {
        map.insert("name".into(), name.into());
    }
    Ok(serde_yaml::from_value(value)?)
}

pub fn run_peer(command: PeerCommand, ports: &Ports) -> Result<()> {
    match command {
        PeerCommand::List => {
            for peer in list_peers(&ports.store)? {
                println!("{peer}");
            }
        }
        PeerCommand::Invite { name } => {
            let token = invite(&ports.store, &name)?;
            println!("{token}");
        }
    }
    Ok(())
}
