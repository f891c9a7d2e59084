//! Hook execution.
//!
//! Each hook runs in its own transient scope unit with the deployment's
//! variables in its environment and a hard deadline.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::config::schema::Hook;
use crate::config::HookPhase;
use crate::deployment::env::Vars;
use crate::observability::metrics;
use crate::runtime::{CommandSpec, ShutdownSignal};
use crate::supervisor::units::HOOK_SCOPE_PREFIX;
use crate::supervisor::{Supervisor, SupervisorError};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("{phase} hook '{exec}' has an empty command")]
    Empty { phase: HookPhase, exec: String },

    #[error("{phase} hook '{exec}' timed out after {after:?}")]
    Timeout {
        phase: HookPhase,
        exec: String,
        after: Duration,
    },

    #[error("{phase} hook '{exec}' failed: {source}")]
    Failed {
        phase: HookPhase,
        exec: String,
        #[source]
        source: SupervisorError,
    },
}

/// Runs hooks through the supervisor.
#[derive(Clone)]
pub struct HookRunner {
    supervisor: Arc<dyn Supervisor>,
    timeout: Duration,
    term_grace: Duration,
}

impl HookRunner {
    pub fn new(supervisor: Arc<dyn Supervisor>, timeout: Duration, term_grace: Duration) -> Self {
        Self {
            supervisor,
            timeout,
            term_grace,
        }
    }

    /// Run every hook of `phase` in order, stopping at the first failure.
    pub async fn run<'a>(
        &self,
        phase: HookPhase,
        hooks: impl IntoIterator<Item = &'a Hook>,
        vars: &Vars,
        cwd: &Path,
        cancel: Option<ShutdownSignal>,
    ) -> Result<(), HookError> {
        for hook in hooks.into_iter().filter(|h| h.when == phase) {
            let result = self.run_one(phase, hook, vars, cwd, cancel.clone()).await;
            metrics::record_hook(phase.as_str(), result.is_ok());
            result?;
        }
        Ok(())
    }

    async fn run_one(
        &self,
        phase: HookPhase,
        hook: &Hook,
        vars: &Vars,
        cwd: &Path,
        cancel: Option<ShutdownSignal>,
    ) -> Result<(), HookError> {
        let exec = hook.exec.join(" ");
        let Some((program, args)) = hook.exec.split_first() else {
            return Err(HookError::Empty { phase, exec });
        };

        let spec = CommandSpec::new(program.as_str())
            .args(args.iter().cloned())
            .envs(vars.iter().map(|(k, v)| (k.clone(), v.clone())))
            .envs([("CONDUCTOR_HOOK", phase.as_str())])
            .cwd(cwd)
            .timeout(self.timeout)
            .term_grace(self.term_grace)
            .inherit_output();
        let unit = format!("{HOOK_SCOPE_PREFIX}{}.scope", Uuid::new_v4());

        tracing::info!(phase = %phase, exec = %exec, unit = %unit, "Running hook");
        match self.supervisor.run_scoped(&unit, spec, cancel).await {
            Ok(_) => Ok(()),
            Err(SupervisorError::Timeout { after, .. }) => {
                tracing::error!(phase = %phase, exec = %exec, timeout = ?after, "Hook timed out");
                Err(HookError::Timeout { phase, exec, after })
            }
            Err(source) => {
                tracing::error!(phase = %phase, exec = %exec, error = %source, "Hook failed");
                Err(HookError::Failed {
                    phase,
                    exec,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::memory::UnitEvent;
    use crate::supervisor::MemorySupervisor;

    fn hook(when: HookPhase, script: &str) -> Hook {
        Hook {
            when,
            exec: vec!["sh".into(), "-c".into(), script.into()],
        }
    }

    fn runner(supervisor: Arc<MemorySupervisor>, timeout: Duration) -> HookRunner {
        HookRunner::new(supervisor, timeout, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn runs_matching_hooks_with_vars() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(MemorySupervisor::new());
        let hooks = vec![
            hook(HookPhase::PreStart, "printf %s \"$CONDUCTOR_DEPLOYMENT\" > out"),
            hook(HookPhase::PostStop, "touch never"),
        ];
        let vars: Vars = [("CONDUCTOR_DEPLOYMENT".to_string(), "web-prod-1".to_string())]
            .into_iter()
            .collect();

        runner(supervisor.clone(), Duration::from_secs(10))
            .run(HookPhase::PreStart, &hooks, &vars, dir.path(), None)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join("out")).unwrap(), "web-prod-1");
        assert!(!dir.path().join("never").exists());
        let scopes = supervisor
            .events()
            .into_iter()
            .filter(|e| matches!(e, UnitEvent::Scoped(u) if u.starts_with(HOOK_SCOPE_PREFIX)))
            .count();
        assert_eq!(scopes, 1);
    }

    #[tokio::test]
    async fn failure_stops_the_phase() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = vec![
            hook(HookPhase::PreStop, "exit 2"),
            hook(HookPhase::PreStop, "touch second"),
        ];
        let err = runner(Arc::new(MemorySupervisor::new()), Duration::from_secs(10))
            .run(HookPhase::PreStop, &hooks, &Vars::new(), dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::Failed { .. }));
        assert!(!dir.path().join("second").exists());
    }

    #[tokio::test]
    async fn deadline_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = vec![hook(HookPhase::PreStart, "sleep 30")];
        let err = runner(Arc::new(MemorySupervisor::new()), Duration::from_millis(200))
            .run(HookPhase::PreStart, &hooks, &Vars::new(), dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::Timeout { .. }));
    }

    #[tokio::test]
    async fn empty_exec_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = vec![Hook { when: HookPhase::PostStart, exec: vec![] }];
        let err = runner(Arc::new(MemorySupervisor::new()), Duration::from_secs(1))
            .run(HookPhase::PostStart, &hooks, &Vars::new(), dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::Empty { .. }));
    }
}
