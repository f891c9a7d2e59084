//! Find-or-create, retire and monitor the deployments of one service.

use std::path::Path;
use std::time::Duration;

use crate::config::schema::{HostContext, Seed, SERVICE_FILE};
use crate::config::{DeploymentEntry, DeploymentFilter, HookPhase, Service};
use crate::deployment::env::service_vars;
use crate::deployment::hooks::HookRunner;
use crate::deployment::naming::{claim_slot, slot_base, Slot};
use crate::deployment::template::render_file;
use crate::error::{Error, Result};
use crate::ports::Ports;
use crate::proxy::item::parse_items;
use crate::proxy::Reconciler;
use crate::runtime::process::send_signal;
use crate::supervisor::units::{deployment_unit, service_config_unit, write_drop_ins};
use crate::supervisor::{ActiveState, ExtendTimeout, Notification};

/// Extra time requested on top of each extension interval.
pub const EXTEND_MARGIN: Duration = Duration::from_secs(30);

/// How `start_or_reload` picks deployments.
#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    /// Run once: no readiness notification, no monitoring.
    pub restart: bool,
    /// Do not reuse a deployment that is already running.
    pub wants_fresh: bool,
    pub max_index: u32,
}

/// A deployment with its supervisor state.
#[derive(Debug, Clone)]
struct Candidate {
    entry: DeploymentEntry,
    state: ActiveState,
}

/// Drives a service's deployments through the supervisor.
#[derive(Clone)]
pub struct ServiceDriver {
    pub(crate) ports: Ports,
    hooks: HookRunner,
}

impl ServiceDriver {
    pub fn new(ports: Ports) -> Self {
        let hooks = HookRunner::new(
            ports.supervisor.clone(),
            ports.env.hook_timeout(),
            ports.env.term_grace(),
        );
        Self { ports, hooks }
    }

    /// Bring the service up, then either return (`restart`) or report ready
    /// and monitor until cancelled or every deployment is gone.
    pub async fn start(&self, path: &Path, options: StartOptions) -> Result<()> {
        let service = self.ports.store.load_service(path)?;
        if !service.active_on(&HostContext::current()) {
            tracing::info!(service = %service.name(), "Conditions do not hold on this host, skipping");
            if !options.restart {
                self.ports.notifier.notify(Notification::Ready);
            }
            return Ok(());
        }

        let targets = {
            let _extend = ExtendTimeout::start(self.ports.notifier.clone(), EXTEND_MARGIN);
            self.start_or_reload(&service, options).await?
        };
        tracing::info!(service = %service.name(), deployments = ?targets, "Service is up");

        if options.restart {
            return Ok(());
        }
        self.ports.notifier.notify(Notification::Ready);
        self.monitor(&service).await
    }

    /// Ensure one active deployment per part, then retire every other
    /// deployment of the service. Returns the target deployment names.
    pub async fn start_or_reload(&self, service: &Service, options: StartOptions) -> Result<Vec<String>> {
        let mut targets = Vec::new();
        for part in service.parts() {
            let name = self.ensure_part(service, part.name.as_deref(), options).await?;
            targets.push(name);
        }
        self.retire(service, &targets).await?;
        Ok(targets)
    }

    async fn candidates(&self, service: &Service, part: Option<&str>) -> Result<Vec<Candidate>> {
        let filter = DeploymentFilter {
            service_dir: Some(service.dir.clone()),
            service_id: Some(service.id.clone()),
            part: Some(part.map(str::to_string)),
        };
        let mut candidates = Vec::new();
        for entry in self.ports.store.list_deployments(&filter)? {
            let status = self
                .ports
                .supervisor
                .unit_status(&deployment_unit(&entry.name))
                .await?;
            candidates.push(Candidate {
                entry,
                state: status.active,
            });
        }
        Ok(candidates)
    }

    async fn ensure_part(
        &self,
        service: &Service,
        part: Option<&str>,
        options: StartOptions,
    ) -> Result<String> {
        let candidates = self.candidates(service, part).await?;
        let find = |state: ActiveState| {
            candidates
                .iter()
                .find(|c| c.state == state)
                .map(|c| c.entry.name.clone())
        };
        let started = find(ActiveState::Active);
        let starting = find(ActiveState::Activating);
        let stopped = find(ActiveState::Inactive);

        if !options.wants_fresh {
            if let Some(name) = &started {
                tracing::info!(deployment = %name, "Reusing running deployment");
                return Ok(name.clone());
            }
        }
        if let Some(name) = starting {
            tracing::info!(deployment = %name, "Waiting for deployment already starting");
            self.start_deployment(&name).await?;
            return Ok(name);
        }
        if let Some(name) = stopped {
            tracing::info!(deployment = %name, "Restarting stopped deployment");
            self.start_deployment(&name).await?;
            return Ok(name);
        }

        let base = slot_base(&service.app, &service.instance, part);
        let root = self.ports.env.deployments_dir();
        let slot = claim_slot(&root, &base, options.max_index).map_err(|e| Error::io(&root, e))?;
        let Some(slot) = slot else {
            if let Some(name) = started {
                tracing::warn!(deployment = %name, "No free slot, keeping running deployment");
                return Ok(name);
            }
            return Err(Error::NoFreeSlot {
                service: service.name(),
                max_index: options.max_index,
            });
        };

        if let Err(e) = self.materialize(&slot, service, part).await {
            if let Err(rm) = std::fs::remove_dir_all(&slot.dir) {
                tracing::warn!(deployment = %slot.name, error = %rm, "Failed to release slot");
            }
            return Err(e);
        }
        self.start_deployment(&slot.name).await?;
        Ok(slot.name)
    }

    /// Link the service file, write the seed and the drop-ins, reload units.
    async fn materialize(&self, slot: &Slot, service: &Service, part: Option<&str>) -> Result<()> {
        tracing::info!(deployment = %slot.name, service = %service.name(), "Materializing deployment");
        let link = slot.dir.join(SERVICE_FILE);
        std::os::unix::fs::symlink(&service.file, &link).map_err(|e| Error::io(&link, e))?;
        self.ports.store.save_seed(
            &slot.dir,
            &Seed {
                service_dir: service.dir.clone(),
                service_id: service.id.clone(),
                part: part.map(str::to_string),
            },
        )?;
        write_drop_ins(&self.ports.env.unit_dir, &slot.name, &service.app, &service.instance)?;
        self.ports.supervisor.daemon_reload().await?;
        Ok(())
    }

    async fn start_deployment(&self, name: &str) -> Result<()> {
        self.ports
            .supervisor
            .start_unit(&deployment_unit(name))
            .await?;
        Ok(())
    }

    /// Remove every deployment of the service not in `targets`. Failures
    /// are logged; the next reload retries.
    pub async fn retire(&self, service: &Service, targets: &[String]) -> Result<()> {
        let siblings = self
            .ports
            .store
            .list_deployments(&DeploymentFilter::service(&service.dir))?;
        for sibling in siblings.iter().filter(|s| !targets.contains(&s.name)) {
            tracing::info!(deployment = %sibling.name, "Retiring obsolete deployment");
            if let Err(e) = self.remove_deployment(&sibling.name).await {
                tracing::warn!(deployment = %sibling.name, error = %e, "Failed to retire deployment");
            }
        }
        Ok(())
    }

    /// Live deployments of the service.
    pub async fn live_deployments(&self, service: &Service) -> Result<Vec<String>> {
        let mut live = Vec::new();
        for entry in self
            .ports
            .store
            .list_deployments(&DeploymentFilter::service(&service.dir))?
        {
            let status = self
                .ports
                .supervisor
                .unit_status(&deployment_unit(&entry.name))
                .await?;
            if matches!(
                status.active,
                ActiveState::Active | ActiveState::Activating | ActiveState::Reloading
            ) {
                live.push(entry.name);
            }
        }
        Ok(live)
    }

    /// Re-enumerate the service's live deployments every monitor interval
    /// until cancelled. Reloads run in other processes and retire on their
    /// own, so this only watches for the last deployment going away.
    async fn monitor(&self, service: &Service) -> Result<()> {
        let mut shutdown = self.ports.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.ports.env.monitor_interval());
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    tracing::info!(service = %service.name(), "Monitoring stopped");
                    return Ok(());
                }
            }
            let live = self.live_deployments(service).await?;
            if live.is_empty() {
                tracing::error!(service = %service.name(), "No deployments left");
                return Err(Error::NoDeployments {
                    service: service.name(),
                });
            }
            tracing::debug!(service = %service.name(), deployments = ?live, "Service deployments alive");
        }
    }

    /// Report stopping, run service stop hooks, signal the monitoring
    /// process and stop every deployment.
    pub async fn stop(&self, path: &Path) -> Result<()> {
        self.ports.notifier.notify(Notification::Stopping);
        let service = self.ports.store.load_service(path)?;
        let vars = service_vars(&service);
        let cancel = Some(self.ports.shutdown.subscribe());

        if let Err(e) = self
            .hooks
            .run(HookPhase::PreStopService, &service.hooks, &vars, &service.dir, cancel.clone())
            .await
        {
            tracing::warn!(service = %service.name(), error = %e, "Pre-stop-service hook failed, continuing");
        }

        if let Some(pid) = main_pid() {
            tracing::debug!(pid, "Signalling service main process");
            send_signal(pid, libc::SIGTERM);
        }

        let deployments = self
            .ports
            .store
            .list_deployments(&DeploymentFilter::service(&service.dir))?;
        for deployment in &deployments {
            let _extend = ExtendTimeout::start(self.ports.notifier.clone(), self.ports.env.stop_grace());
            let unit = deployment_unit(&deployment.name);
            if let Err(e) = self
                .ports
                .supervisor
                .stop_unit(&unit, Some(self.ports.env.stop_grace()))
                .await
            {
                tracing::warn!(deployment = %deployment.name, error = %e, "Failed to stop deployment");
            }
        }

        self.hooks
            .run(HookPhase::PostStopService, &service.hooks, &vars, &service.dir, cancel)
            .await?;
        Ok(())
    }

    /// Take the service-level routes down after the service stopped.
    pub async fn cleanup(&self, path: &Path) -> Result<()> {
        let service = self.ports.store.load_service(path)?;
        let unit = service_config_unit(&service.dir);
        if let Err(e) = self.ports.supervisor.stop_unit(&unit, None).await {
            tracing::warn!(unit = %unit, error = %e, "Failed to stop service config unit");
        }
        for entry in self
            .ports
            .store
            .list_deployments(&DeploymentFilter::service(&service.dir))?
        {
            let unit = deployment_unit(&entry.name);
            if self.ports.supervisor.unit_status(&unit).await?.active == ActiveState::Failed {
                self.ports.supervisor.reset_failed(&unit).await?;
            }
        }
        Ok(())
    }

    /// Render the service-level proxy config.
    pub fn render_proxy_config(&self, service: &Service) -> Result<Option<String>> {
        let Some(template) = &service.service_proxy_config else {
            return Ok(None);
        };
        Ok(Some(render_file(template, &service_vars(service))?))
    }

    /// Register or deregister the service-level routes.
    pub async fn register(&self, path: &Path, register: bool) -> Result<()> {
        let service = self.ports.store.load_service(path)?;
        let Some(text) = self.render_proxy_config(&service)? else {
            tracing::debug!(service = %service.name(), "No service proxy config");
            return Ok(());
        };
        let items = parse_items(&text)?;
        tracing::info!(service = %service.name(), items = items.len(), register, "Reconciling service proxy config");
        Reconciler::new(self.ports.proxy.clone())
            .reconcile(&items, register)
            .await?;
        Ok(())
    }
}

/// `MAINPID` of the service unit, unless it is this process.
fn main_pid() -> Option<u32> {
    let pid: u32 = std::env::var("MAINPID").ok()?.trim().parse().ok()?;
    (pid != 0 && pid != std::process::id()).then_some(pid)
}
