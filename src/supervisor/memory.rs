//! In-process supervisor.
//!
//! Units are entries in a state map. Handlers registered per unit-name
//! prefix stand in for the unit's start and stop commands, so tests can wire
//! `conductor-deployment@*` straight to the deployment driver.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::Notify;

use crate::runtime::process::{self, CommandOutput, CommandSpec};
use crate::runtime::ShutdownSignal;
use crate::supervisor::{
    unit_matches, ActiveState, KillSignal, Supervisor, SupervisorError, UnitStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitAction {
    Start,
    Stop,
}

/// Something that happened to a unit, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitEvent {
    Starting(String),
    Active(String),
    Failed(String),
    Stopping(String),
    Inactive(String),
    Killed(String, KillSignal),
    ResetFailed(String),
    DaemonReload,
    Scoped(String),
}

pub type UnitHandler =
    Arc<dyn Fn(UnitAction, String) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

#[derive(Default)]
struct State {
    units: BTreeMap<String, ActiveState>,
    events: Vec<UnitEvent>,
    ignores_term: BTreeSet<String>,
}

#[derive(Default)]
pub struct MemorySupervisor {
    state: Mutex<State>,
    handlers: Mutex<Vec<(String, UnitHandler)>>,
    changed: Notify,
}

impl MemorySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `handler` whenever a unit starting with `prefix` starts or stops.
    pub fn on_unit<F>(&self, prefix: &str, handler: F)
    where
        F: Fn(UnitAction, String) -> BoxFuture<'static, Result<(), String>> + Send + Sync + 'static,
    {
        let mut handlers = match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.push((prefix.to_string(), Arc::new(handler)));
    }

    fn handler_for(&self, unit: &str) -> Option<UnitHandler> {
        let handlers = match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers
            .iter()
            .filter(|(prefix, _)| unit.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| handler.clone())
    }

    /// Force a unit into `state` without running handlers.
    pub fn set_state(&self, unit: &str, state: ActiveState) {
        self.lock().units.insert(unit.to_string(), state);
        self.changed.notify_waiters();
    }

    /// Make `unit` stay up through SIGTERM; only SIGKILL takes it down.
    pub fn ignore_sigterm(&self, unit: &str) {
        self.lock().ignores_term.insert(unit.to_string());
    }

    pub fn state(&self, unit: &str) -> ActiveState {
        self.lock()
            .units
            .get(unit)
            .cloned()
            .unwrap_or(ActiveState::Inactive)
    }

    pub fn events(&self) -> Vec<UnitEvent> {
        self.lock().events.clone()
    }

    fn transition(&self, unit: &str, state: ActiveState, event: UnitEvent) {
        {
            let mut guard = self.lock();
            guard.units.insert(unit.to_string(), state);
            guard.events.push(event);
        }
        self.changed.notify_waiters();
    }

    /// Claim `unit` for starting, or wait while another caller starts it.
    /// Returns `false` once the unit is already active.
    async fn claim_start(&self, unit: &str) -> Result<bool, SupervisorError> {
        let mut waited = false;
        loop {
            let notified = self.changed.notified();
            {
                let mut guard = self.lock();
                match guard.units.get(unit) {
                    Some(ActiveState::Active) => return Ok(false),
                    Some(ActiveState::Activating) => {}
                    Some(other) if waited => {
                        return Err(SupervisorError::UnitFailed {
                            unit: unit.to_string(),
                            reason: format!("unit went {other} while starting"),
                        })
                    }
                    _ => {
                        guard.units.insert(unit.to_string(), ActiveState::Activating);
                        guard.events.push(UnitEvent::Starting(unit.to_string()));
                        return Ok(true);
                    }
                }
            }
            tracing::debug!(unit = %unit, "Waiting for unit already starting");
            notified.await;
            waited = true;
        }
    }
}

#[async_trait]
impl Supervisor for MemorySupervisor {
    async fn start_unit(&self, unit: &str) -> Result<(), SupervisorError> {
        if !self.claim_start(unit).await? {
            return Ok(());
        }
        let result = match self.handler_for(unit) {
            Some(handler) => handler(UnitAction::Start, unit.to_string()).await,
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                self.transition(unit, ActiveState::Active, UnitEvent::Active(unit.to_string()));
                Ok(())
            }
            Err(reason) => {
                self.transition(unit, ActiveState::Failed, UnitEvent::Failed(unit.to_string()));
                Err(SupervisorError::UnitFailed {
                    unit: unit.to_string(),
                    reason,
                })
            }
        }
    }

    async fn stop_unit(&self, unit: &str, timeout: Option<Duration>) -> Result<(), SupervisorError> {
        match self.state(unit) {
            ActiveState::Inactive => return Ok(()),
            ActiveState::Failed => {
                self.transition(unit, ActiveState::Inactive, UnitEvent::Inactive(unit.to_string()));
                return Ok(());
            }
            _ => {}
        }
        self.transition(
            unit,
            ActiveState::Deactivating,
            UnitEvent::Stopping(unit.to_string()),
        );

        let stop = async {
            match self.handler_for(unit) {
                Some(handler) => handler(UnitAction::Stop, unit.to_string()).await,
                None => Ok(()),
            }
        };
        let result = match timeout {
            Some(after) => match tokio::time::timeout(after, stop).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(SupervisorError::Timeout {
                        action: "stop",
                        unit: unit.to_string(),
                        after,
                    })
                }
            },
            None => stop.await,
        };

        match result {
            Ok(()) => {
                self.transition(unit, ActiveState::Inactive, UnitEvent::Inactive(unit.to_string()));
                Ok(())
            }
            Err(reason) => {
                self.transition(unit, ActiveState::Failed, UnitEvent::Failed(unit.to_string()));
                Err(SupervisorError::UnitFailed {
                    unit: unit.to_string(),
                    reason,
                })
            }
        }
    }

    async fn kill_unit(&self, unit: &str, signal: KillSignal) -> Result<(), SupervisorError> {
        let event = UnitEvent::Killed(unit.to_string(), signal);
        let ignored = self.lock().ignores_term.contains(unit);
        match signal {
            KillSignal::Term if ignored => self.lock().events.push(event),
            KillSignal::Term => self.transition(unit, ActiveState::Inactive, event),
            KillSignal::Kill => self.transition(unit, ActiveState::Failed, event),
        }
        Ok(())
    }

    async fn reset_failed(&self, unit: &str) -> Result<(), SupervisorError> {
        {
            let mut guard = self.lock();
            if guard.units.get(unit) == Some(&ActiveState::Failed) {
                guard.units.remove(unit);
            }
            guard.events.push(UnitEvent::ResetFailed(unit.to_string()));
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn list_units(&self, patterns: &[String]) -> Result<Vec<UnitStatus>, SupervisorError> {
        let guard = self.lock();
        Ok(guard
            .units
            .iter()
            .filter(|(name, _)| patterns.iter().any(|p| unit_matches(p, name)))
            .map(|(name, active)| UnitStatus {
                name: name.clone(),
                load: "loaded".to_string(),
                sub: sub_state(active).to_string(),
                active: active.clone(),
            })
            .collect())
    }

    async fn daemon_reload(&self) -> Result<(), SupervisorError> {
        self.lock().events.push(UnitEvent::DaemonReload);
        Ok(())
    }

    async fn run_scoped(
        &self,
        unit: &str,
        command: CommandSpec,
        cancel: Option<ShutdownSignal>,
    ) -> Result<CommandOutput, SupervisorError> {
        self.lock().events.push(UnitEvent::Scoped(unit.to_string()));
        process::run(&command, cancel)
            .await
            .map_err(|e| SupervisorError::from_process("run", unit, e))
    }
}

fn sub_state(active: &ActiveState) -> &'static str {
    match active {
        ActiveState::Active => "running",
        ActiveState::Activating => "start",
        ActiveState::Deactivating => "stop",
        ActiveState::Reloading => "reload",
        ActiveState::Failed => "failed",
        ActiveState::Inactive | ActiveState::Other(_) => "dead",
    }
}
