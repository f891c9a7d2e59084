//! Process supervisor port.
//!
//! # Data Flow
//! ```text
//! lifecycle drivers
//!     → Supervisor (start/stop/kill/reset-failed/list units, scoped commands)
//!         → systemd.rs (systemctl / systemd-run)
//!         → memory.rs (in-process units for tests)
//!     → Notifier (READY / STOPPING / EXTEND_TIMEOUT_USEC / STATUS)
//!         → notify.rs (sd_notify datagram, recording fake)
//!     → extend.rs (keeps the outer unit's start/stop timeout from firing)
//!
//! units.rs names every unit and writes the drop-ins that tag log streams.
//! ```
//!
//! # Design Decisions
//! - Only what the lifecycle needs is exposed; unit files are out of scope
//! - Notifications are best-effort: failures are logged, never returned
//! - Starting a unit twice is idempotent at the supervisor

pub mod extend;
pub mod memory;
pub mod notify;
pub mod systemd;
pub mod units;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::runtime::{CommandOutput, CommandSpec, ProcessError, ShutdownSignal};

pub use extend::ExtendTimeout;
pub use memory::MemorySupervisor;
pub use notify::{Notification, Notifier, RecordingNotifier, SdNotifier};
pub use systemd::SystemdSupervisor;

/// Errors raised by supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{action} {unit} failed: {source}")]
    Command {
        action: &'static str,
        unit: String,
        #[source]
        source: ProcessError,
    },

    #[error("{action} {unit} timed out after {after:?}")]
    Timeout {
        action: &'static str,
        unit: String,
        after: Duration,
    },

    #[error("unit {unit} failed: {reason}")]
    UnitFailed { unit: String, reason: String },

    #[error("cannot parse unit listing line '{0}'")]
    Parse(String),

    #[error("cannot write drop-in {}: {source}", path.display())]
    DropIn {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub(crate) fn from_process(action: &'static str, unit: &str, source: ProcessError) -> Self {
        match source {
            ProcessError::Timeout { after, .. } => SupervisorError::Timeout {
                action,
                unit: unit.to_string(),
                after,
            },
            source => SupervisorError::Command {
                action,
                unit: unit.to_string(),
                source,
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SupervisorError::Timeout { .. })
    }
}

/// High-level activation state of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveState {
    Active,
    Activating,
    Deactivating,
    Reloading,
    Inactive,
    Failed,
    #[serde(untagged)]
    Other(String),
}

impl FromStr for ActiveState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => ActiveState::Active,
            "activating" => ActiveState::Activating,
            "deactivating" => ActiveState::Deactivating,
            "reloading" => ActiveState::Reloading,
            "inactive" => ActiveState::Inactive,
            "failed" => ActiveState::Failed,
            other => ActiveState::Other(other.to_string()),
        })
    }
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActiveState::Active => "active",
            ActiveState::Activating => "activating",
            ActiveState::Deactivating => "deactivating",
            ActiveState::Reloading => "reloading",
            ActiveState::Inactive => "inactive",
            ActiveState::Failed => "failed",
            ActiveState::Other(s) => s,
        };
        f.write_str(s)
    }
}

/// One row of a unit listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub name: String,
    pub load: String,
    pub active: ActiveState,
    pub sub: String,
}

impl UnitStatus {
    /// Status of a unit the supervisor does not know.
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            load: "not-found".to_string(),
            active: ActiveState::Inactive,
            sub: "dead".to_string(),
        }
    }
}

/// Signal delivered by [`Supervisor::kill_unit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Term,
    Kill,
}

impl KillSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillSignal::Term => "SIGTERM",
            KillSignal::Kill => "SIGKILL",
        }
    }
}

/// Operations on supervised units.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Start `unit` and wait until it is up.
    async fn start_unit(&self, unit: &str) -> Result<(), SupervisorError>;

    /// Stop `unit`, failing with [`SupervisorError::Timeout`] after `timeout`.
    async fn stop_unit(&self, unit: &str, timeout: Option<Duration>) -> Result<(), SupervisorError>;

    async fn kill_unit(&self, unit: &str, signal: KillSignal) -> Result<(), SupervisorError>;

    async fn reset_failed(&self, unit: &str) -> Result<(), SupervisorError>;

    /// Units matching any of `patterns` (glob syntax), loaded or not.
    async fn list_units(&self, patterns: &[String]) -> Result<Vec<UnitStatus>, SupervisorError>;

    async fn daemon_reload(&self) -> Result<(), SupervisorError>;

    /// Run a command inside a transient scope unit named `unit`.
    async fn run_scoped(
        &self,
        unit: &str,
        command: CommandSpec,
        cancel: Option<ShutdownSignal>,
    ) -> Result<CommandOutput, SupervisorError>;

    /// Status of a single unit; unknown units report inactive.
    async fn unit_status(&self, unit: &str) -> Result<UnitStatus, SupervisorError> {
        let found = self.list_units(&[unit.to_string()]).await?;
        Ok(found
            .into_iter()
            .find(|u| u.name == unit)
            .unwrap_or_else(|| UnitStatus::unknown(unit)))
    }
}

/// Glob match over unit names, supporting `*` and `?`.
pub fn unit_matches(pattern: &str, name: &str) -> bool {
    fn go(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => go(&p[1..], n) || (!n.is_empty() && go(p, &n[1..])),
            (Some(b'?'), Some(_)) => go(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => go(&p[1..], &n[1..]),
            _ => false,
        }
    }
    go(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states_parse() {
        assert_eq!("active".parse::<ActiveState>().unwrap(), ActiveState::Active);
        assert_eq!(
            "maintenance".parse::<ActiveState>().unwrap(),
            ActiveState::Other("maintenance".into())
        );
        assert_eq!(ActiveState::Failed.to_string(), "failed");
    }

    #[test]
    fn globs() {
        assert!(unit_matches("conductor-deployment@web-prod-*.service", "conductor-deployment@web-prod-2.service"));
        assert!(!unit_matches("conductor-deployment@web-prod-*.service", "conductor-deployment-config@web-prod-2.service"));
        assert!(unit_matches("a?c", "abc"));
        assert!(unit_matches("exact", "exact"));
    }
}
