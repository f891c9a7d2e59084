//! Crate-level error aggregating every subsystem.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::container::ContainerError;
use crate::deployment::{HookError, TemplateError};
use crate::policy::PolicyError;
use crate::proxy::ProxyError;
use crate::runtime::ProcessError;
use crate::selector::SelectorError;
use crate::supervisor::SupervisorError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error("no free deployment slot for {service} (max index {max_index})")]
    NoFreeSlot { service: String, max_index: u32 },

    #[error("no deployments left for {service}")]
    NoDeployments { service: String },

    #[error("unknown deployment '{0}'")]
    UnknownDeployment(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("cannot encode YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
