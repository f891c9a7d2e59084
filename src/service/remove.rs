//! Deployment removal with escalation.
//!
//! stop (grace) → kill SIGTERM (term grace) → kill SIGKILL + reset-failed,
//! then the config and socket units, then the directory and drop-ins.
//! Only filesystem failures at the end are fatal.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::service::lifecycle::ServiceDriver;
use crate::supervisor::units::{
    deployment_config_unit, deployment_unit, remove_drop_ins, FUNCTION_SOCKET_UNIT_PREFIX,
};
use crate::supervisor::{ActiveState, KillSignal};

/// Poll spacing while waiting for a killed unit to go down.
const KILL_POLL: Duration = Duration::from_millis(250);

impl ServiceDriver {
    /// Stop and delete the named deployment.
    pub async fn remove_deployment(&self, name: &str) -> Result<()> {
        let env = &self.ports.env;
        let supervisor = &self.ports.supervisor;
        let unit = deployment_unit(name);
        tracing::info!(deployment = %name, "Removing deployment");

        if let Err(e) = supervisor.stop_unit(&unit, Some(env.stop_grace())).await {
            tracing::warn!(deployment = %name, error = %e, "Stop failed, sending SIGTERM");
            self.escalate(&unit, env.term_grace()).await;
        }

        let mut units = vec![deployment_config_unit(name)];
        let sockets = format!("{FUNCTION_SOCKET_UNIT_PREFIX}{name}-*.socket");
        match supervisor.list_units(&[sockets]).await {
            Ok(found) => units.extend(found.into_iter().map(|u| u.name)),
            Err(e) => tracing::warn!(deployment = %name, error = %e, "Cannot list function sockets"),
        }
        for unit in &units {
            if let Err(e) = supervisor.stop_unit(unit, Some(env.stop_grace())).await {
                tracing::warn!(unit = %unit, error = %e, "Failed to stop unit");
            }
        }

        let dir = env.deployment_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(dir, e)),
        }
        remove_drop_ins(&env.unit_dir, name)?;
        if let Err(e) = supervisor.daemon_reload().await {
            tracing::warn!(error = %e, "daemon-reload failed");
        }
        tracing::info!(deployment = %name, "Deployment removed");
        Ok(())
    }

    async fn escalate(&self, unit: &str, term_grace: Duration) {
        let supervisor = &self.ports.supervisor;
        if let Err(e) = supervisor.kill_unit(unit, KillSignal::Term).await {
            tracing::warn!(unit = %unit, error = %e, "SIGTERM failed");
        }
        if self.wait_down(unit, term_grace).await {
            return;
        }
        tracing::warn!(unit = %unit, "Unit survived SIGTERM, sending SIGKILL");
        if let Err(e) = supervisor.kill_unit(unit, KillSignal::Kill).await {
            tracing::warn!(unit = %unit, error = %e, "SIGKILL failed");
        }
        if let Err(e) = supervisor.reset_failed(unit).await {
            tracing::warn!(unit = %unit, error = %e, "reset-failed failed");
        }
    }

    /// Whether the unit is down within `within`.
    async fn wait_down(&self, unit: &str, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            match self.ports.supervisor.unit_status(unit).await {
                Ok(status) if matches!(status.active, ActiveState::Inactive) => return true,
                Ok(_) => {}
                Err(e) => tracing::debug!(unit = %unit, error = %e, "Status check failed"),
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(KILL_POLL).await;
        }
    }
}
