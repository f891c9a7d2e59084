//! Command-line interface.
//!
//! # Data Flow
//! ```text
//! argv → Cli (clap derive)
//!     → EnvironmentContext (conductor.toml + CONDUCTOR_* + flags)
//!     → Ports::system
//!     → service.rs / deployment.rs / policy.rs   (operator commands)
//!     → internal.rs                              (`_` commands run by units)
//! ```
//!
//! The `_` tree is what the unit files invoke: `ExecStart=conductor _
//! deployment start %i` and so on. It is hidden from help output.

pub mod deployment;
pub mod internal;
pub mod policy;
pub mod service;
pub mod table;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{ConfigError, EnvironmentContext};
use crate::error::Result;
use crate::observability::logging::LogFormat;
use crate::ports::Ports;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Run podman pods as systemd services behind Caddy", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Environment file (defaults to /etc/conductor/conductor.toml)
    #[arg(long, global = true, env = "CONDUCTOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Talk to the per-user systemd instance
    #[arg(long, global = true)]
    pub user: bool,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage services
    Service {
        #[command(subcommand)]
        command: service::ServiceCommand,
    },
    /// Manage deployments
    Deployment {
        #[command(subcommand)]
        command: deployment::DeploymentCommand,
    },
    /// Manage authorization policies
    Policy {
        #[command(subcommand)]
        command: policy::PolicyCommand,
    },
    /// Manage peers allowed to call this host
    Peer {
        #[command(subcommand)]
        command: policy::PeerCommand,
    },
    /// Entry points invoked by systemd units
    #[command(name = "_", hide = true)]
    Internal {
        #[command(subcommand)]
        command: internal::InternalCommand,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Flags selecting services, shared by listing commands.
#[derive(Args, Default)]
pub struct SelectArgs {
    /// Attribute filter `key[op]=value`; repeat to combine
    #[arg(short, long = "filter")]
    pub filters: Vec<String>,

    /// Stop listing before the first service matching this JSONPath
    #[arg(long)]
    pub stop_before: Option<String>,

    /// Stop listing after the first service matching this JSONPath
    #[arg(long)]
    pub stop_after: Option<String>,

    /// Start listing at the first service matching this JSONPath
    #[arg(long)]
    pub resume_before: Option<String>,

    /// Start listing after the first service matching this JSONPath
    #[arg(long)]
    pub resume_after: Option<String>,
}

impl Cli {
    /// The environment this invocation runs in: the file, `CONDUCTOR_*`
    /// variables, then command-line flags.
    pub fn environment(&self) -> std::result::Result<EnvironmentContext, ConfigError> {
        let mut env = match &self.config {
            Some(path) => {
                let mut env = EnvironmentContext::from_file(path)?;
                env.apply_overrides(|key| std::env::var(key).ok());
                env
            }
            None => EnvironmentContext::load()?,
        };
        if self.user {
            env.user_mode = true;
        }
        if self.verbose {
            env.log_level = "debug".to_string();
        }
        if let Some(format) = self.log_format {
            env.log_format = format.into();
        }
        Ok(env)
    }
}

/// Run one parsed command.
pub async fn dispatch(command: Commands, ports: &Ports) -> Result<()> {
    match command {
        Commands::Service { command } => service::run(command, ports).await,
        Commands::Deployment { command } => deployment::run(command, ports).await,
        Commands::Policy { command } => policy::run_policy(command, ports),
        Commands::Peer { command } => policy::run_peer(command, ports),
        Commands::Internal { command } => internal::run(command, ports).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_listing_flags() {
        let cli = Cli::try_parse_from([
            "conductor", "service", "ls", "-f", "app=web", "--filter", "config.tier^=gold",
            "--stop-after", "$[?@.instance == 'b']",
        ])
        .unwrap();
        let Commands::Service { command: service::ServiceCommand::Ls { select, .. } } = cli.command
        else {
            panic!("expected service ls");
        };
        assert_eq!(select.filters, ["app=web", "config.tier^=gold"]);
        assert_eq!(select.stop_after.as_deref(), Some("$[?@.instance == 'b']"));
    }

    #[test]
    fn internal_tree_parses() {
        let cli = Cli::try_parse_from(["conductor", "_", "deployment", "prepare", "web-prod-1"]).unwrap();
        assert!(matches!(cli.command, Commands::Internal { .. }));
    }

    #[test]
    fn flags_override_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(&path, "max_index = 4\n").unwrap();
        let cli = Cli::try_parse_from([
            "conductor", "--config", path.to_str().unwrap(), "--user", "-v", "peer", "list",
        ])
        .unwrap();
        let env = cli.environment().unwrap();
        assert_eq!(env.max_index, 4);
        assert!(env.user_mode);
        assert_eq!(env.log_level, "debug");
    }
}
