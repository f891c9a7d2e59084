//! Supervisor adapter over `systemctl` and `systemd-run`.

use std::time::Duration;

use async_trait::async_trait;

use crate::runtime::process::{self, CommandOutput, CommandSpec};
use crate::runtime::ShutdownSignal;
use crate::supervisor::{KillSignal, Supervisor, SupervisorError, UnitStatus};

/// Talks to the system (or per-user) service manager.
#[derive(Debug, Clone)]
pub struct SystemdSupervisor {
    user_mode: bool,
    term_grace: Duration,
}

impl SystemdSupervisor {
    pub fn new(user_mode: bool, term_grace: Duration) -> Self {
        Self {
            user_mode,
            term_grace,
        }
    }

    fn systemctl(&self) -> CommandSpec {
        let spec = CommandSpec::new("systemctl").term_grace(self.term_grace);
        if self.user_mode {
            spec.arg("--user")
        } else {
            spec
        }
    }

    async fn run(
        &self,
        action: &'static str,
        unit: &str,
        spec: CommandSpec,
    ) -> Result<CommandOutput, SupervisorError> {
        tracing::debug!(action, unit = %unit, "systemctl");
        process::run(&spec, None)
            .await
            .map_err(|e| SupervisorError::from_process(action, unit, e))
    }
}

#[async_trait]
impl Supervisor for SystemdSupervisor {
    async fn start_unit(&self, unit: &str) -> Result<(), SupervisorError> {
        self.run("start", unit, self.systemctl().args(["start", unit])).await?;
        Ok(())
    }

    async fn stop_unit(&self, unit: &str, timeout: Option<Duration>) -> Result<(), SupervisorError> {
        let mut spec = self.systemctl().args(["stop", unit]);
        if let Some(timeout) = timeout {
            spec = spec.timeout(timeout);
        }
        self.run("stop", unit, spec).await?;
        Ok(())
    }

    async fn kill_unit(&self, unit: &str, signal: KillSignal) -> Result<(), SupervisorError> {
        let spec = self
            .systemctl()
            .arg("kill")
            .arg(format!("--signal={}", signal.as_str()))
            .arg(unit);
        self.run("kill", unit, spec).await?;
        Ok(())
    }

    async fn reset_failed(&self, unit: &str) -> Result<(), SupervisorError> {
        self.run("reset-failed", unit, self.systemctl().args(["reset-failed", unit]))
            .await?;
        Ok(())
    }

    async fn list_units(&self, patterns: &[String]) -> Result<Vec<UnitStatus>, SupervisorError> {
        let spec = self
            .systemctl()
            .args(["list-units", "--all", "--plain", "--no-legend", "--full"])
            .args(patterns.iter().cloned());
        let output = self.run("list-units", &patterns.join(" "), spec).await?;
        parse_unit_listing(&output.stdout_str())
    }

    async fn daemon_reload(&self) -> Result<(), SupervisorError> {
        self.run("daemon-reload", "-", self.systemctl().arg("daemon-reload"))
            .await?;
        Ok(())
    }

    async fn run_scoped(
        &self,
        unit: &str,
        command: CommandSpec,
        cancel: Option<ShutdownSignal>,
    ) -> Result<CommandOutput, SupervisorError> {
        let mut args = Vec::new();
        if self.user_mode {
            args.push("--user".to_string());
        }
        args.extend([
            "--scope".to_string(),
            "--collect".to_string(),
            "--quiet".to_string(),
            format!("--unit={unit}"),
            "--".to_string(),
            command.program.clone(),
        ]);
        args.extend(command.args.iter().cloned());

        let spec = CommandSpec {
            program: "systemd-run".to_string(),
            args,
            ..command
        };
        tracing::debug!(unit = %unit, program = %spec.args.last().map(String::as_str).unwrap_or(""), "Running scoped command");
        process::run(&spec, cancel)
            .await
            .map_err(|e| SupervisorError::from_process("run", unit, e))
    }
}

/// Parse `systemctl list-units --plain --no-legend` output.
pub fn parse_unit_listing(text: &str) -> Result<Vec<UnitStatus>, SupervisorError> {
    let mut units = Vec::new();
    for line in text.lines() {
        let line = line.trim().trim_start_matches('●').trim_start();
        if line.is_empty() {
            continue;
        }
        let mut cols = line.split_whitespace();
        let (Some(name), Some(load), Some(active), Some(sub)) =
            (cols.next(), cols.next(), cols.next(), cols.next())
        else {
            return Err(SupervisorError::Parse(line.to_string()));
        };
        units.push(UnitStatus {
            name: name.to_string(),
            load: load.to_string(),
            active: active.parse().unwrap_or_else(|never| match never {}),
            sub: sub.to_string(),
        });
    }
    Ok(units)
}
