//! Per-deployment state machine.
//!
//! # Responsibilities
//! - Render the pod, config-map and proxy-config templates
//! - Start and stop the pod, discover and persist its address
//! - Run hooks at each phase, keeping the unit's timeout extended
//! - Start the deployment's config unit, which registers its routes
//!
//! Failure policy per phase:
//! - prepare: any failure aborts; only the rendered document is left behind
//! - start: post-start hook failures are logged, everything else aborts
//! - stop: pre-stop hooks and route removal are best effort, pod stop is not
//! - cleanup: post-stop hook failures abort

use std::path::Path;

use serde::Serialize;

use crate::config::{ConfigError, Deployment, HookPhase, Service};
use crate::container::{find_pod_ip, manifest_pod_name, IP_ATTEMPTS, IP_SPACING};
use crate::deployment::env::{config_map_name, deployment_vars, Vars};
use crate::deployment::hooks::HookRunner;
use crate::deployment::template::{configmap, render_file};
use crate::error::{Error, Result};
use crate::ports::Ports;
use crate::proxy::item::parse_items;
use crate::proxy::Reconciler;
use crate::supervisor::units::{deployment_config_unit, function_socket_unit, service_config_unit};
use crate::supervisor::{ExtendTimeout, Notification};

/// Templates of a deployment rendered against its current variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Rendered {
    pub pod: Option<String>,
    pub config_map: Option<String>,
    pub proxy_config: Option<String>,
}

/// Drives one deployment directory through its phases.
#[derive(Clone)]
pub struct DeploymentDriver {
    ports: Ports,
    hooks: HookRunner,
}

impl DeploymentDriver {
    pub fn new(ports: Ports) -> Self {
        let hooks = HookRunner::new(
            ports.supervisor.clone(),
            ports.env.hook_timeout(),
            ports.env.term_grace(),
        );
        Self { ports, hooks }
    }

    /// The persisted document, or one synthesized from the seed when the
    /// deployment has not been prepared yet.
    pub fn load(&self, dir: &Path) -> Result<(Deployment, Service)> {
        let store = &self.ports.store;
        match store.load_deployment(dir) {
            Ok(deployment) => {
                let service = store.load_service(&deployment.service_dir)?;
                Ok((deployment, service))
            }
            Err(e) if e.is_not_found() => {
                let seed = store.load_seed(dir)?;
                let service = store.load_service(&seed.service_dir)?;
                let name = dir_name(dir)?;
                let mut deployment = Deployment::from_service(&name, &service, seed.part.as_deref());
                deployment.service_id = seed.service_id;
                Ok((deployment, service))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Render every template without persisting anything.
    pub fn render(&self, dir: &Path) -> Result<Rendered> {
        let (mut deployment, service) = self.load(dir)?;
        let (pod, config_map) = self.render_pod(&service, &mut deployment, dir)?;
        let proxy_config = self.render_proxy_config(&service, &deployment, dir)?;
        Ok(Rendered {
            pod,
            config_map,
            proxy_config,
        })
    }

    fn render_pod(
        &self,
        service: &Service,
        deployment: &mut Deployment,
        dir: &Path,
    ) -> Result<(Option<String>, Option<String>)> {
        let Some(template) = self.part_of(service, deployment).and_then(|p| p.pod) else {
            deployment.pod_name = None;
            return Ok((None, None));
        };
        let vars = deployment_vars(service, deployment, dir);
        let pod = render_file(&template, &vars)?;
        deployment.pod_name = Some(manifest_pod_name(&pod)?);
        let config_map = configmap(&config_map_name(&deployment.name), &service.config)?;
        Ok((Some(pod), config_map))
    }

    fn render_proxy_config(
        &self,
        service: &Service,
        deployment: &Deployment,
        dir: &Path,
    ) -> Result<Option<String>> {
        let Some(template) = self.part_of(service, deployment).and_then(|p| p.proxy_config) else {
            return Ok(None);
        };
        let vars = deployment_vars(service, deployment, dir);
        Ok(Some(render_file(&template, &vars)?))
    }

    fn part_of(&self, service: &Service, deployment: &Deployment) -> Option<crate::config::schema::Part> {
        let part = service.part(deployment.part.as_deref());
        if part.is_none() {
            tracing::warn!(
                deployment = %deployment.name,
                part = ?deployment.part,
                "Service no longer defines this part"
            );
        }
        part
    }

    async fn run_hooks(&self, phase: HookPhase, service: &Service, vars: &Vars, dir: &Path) -> Result<()> {
        if service.hooks_for(phase).next().is_none() {
            return Ok(());
        }
        let _extend = ExtendTimeout::start(self.ports.notifier.clone(), self.ports.env.hook_timeout());
        self.hooks
            .run(phase, &service.hooks, vars, dir, Some(self.ports.shutdown.subscribe()))
            .await?;
        Ok(())
    }

    /// Render templates into the document, persist it and run pre-start hooks.
    pub async fn prepare(&self, dir: &Path) -> Result<Deployment> {
        let (mut deployment, service) = self.load(dir)?;
        tracing::info!(deployment = %deployment.name, service = %service.name(), "Preparing deployment");

        deployment.pod_ip = None;
        let (pod, config_map) = self.render_pod(&service, &mut deployment, dir)?;
        deployment.templated_pod = pod;
        deployment.templated_config_map = config_map;
        self.ports.store.save_deployment(dir, &deployment)?;

        let vars = deployment_vars(&service, &deployment, dir);
        self.run_hooks(HookPhase::PreStart, &service, &vars, dir).await?;
        Ok(deployment)
    }

    /// Start the pod, record its address, start function sockets and the
    /// config unit, then report ready.
    pub async fn start(&self, dir: &Path) -> Result<Deployment> {
        let mut deployment = self.ports.store.load_deployment(dir)?;
        let service = self.ports.store.load_service(&deployment.service_dir)?;
        tracing::info!(deployment = %deployment.name, "Starting deployment");

        if let Some(manifest) = &deployment.templated_pod {
            let configmap = deployment.templated_config_map.as_deref().map(str::as_bytes);
            self.ports
                .engine
                .start_pod(dir, manifest.as_bytes(), configmap)
                .await?;
            let pod = deployment
                .pod_name
                .clone()
                .unwrap_or_else(|| deployment.name.clone());
            let ip = find_pod_ip(self.ports.engine.as_ref(), &pod, IP_ATTEMPTS, IP_SPACING).await?;
            tracing::info!(deployment = %deployment.name, pod = %pod, ip = %ip, "Pod is up");
            deployment.pod_ip = Some(ip);
            self.ports.store.save_deployment(dir, &deployment)?;
        }

        let vars = deployment_vars(&service, &deployment, dir);
        if let Err(e) = self.run_hooks(HookPhase::PostStart, &service, &vars, dir).await {
            tracing::warn!(deployment = %deployment.name, error = %e, "Post-start hook failed, continuing");
        }

        for function in &service.functions {
            let unit = function_socket_unit(&deployment.name, &function.name);
            self.ports.supervisor.start_unit(&unit).await?;
        }
        self.ports
            .supervisor
            .start_unit(&deployment_config_unit(&deployment.name))
            .await?;

        self.ports.notifier.notify(Notification::Ready);
        Ok(deployment)
    }

    /// Report stopping, run pre-stop hooks, take routes down and stop the pod.
    pub async fn stop(&self, dir: &Path) -> Result<()> {
        self.ports.notifier.notify(Notification::Stopping);

        match self.load(dir) {
            Ok((deployment, service)) => {
                tracing::info!(deployment = %deployment.name, "Stopping deployment");
                let vars = deployment_vars(&service, &deployment, dir);
                if let Err(e) = self.run_hooks(HookPhase::PreStop, &service, &vars, dir).await {
                    tracing::warn!(deployment = %deployment.name, error = %e, "Pre-stop hook failed, continuing");
                }

                let mut units: Vec<String> = service
                    .functions
                    .iter()
                    .map(|f| function_socket_unit(&deployment.name, &f.name))
                    .collect();
                units.push(deployment_config_unit(&deployment.name));
                for unit in units {
                    if let Err(e) = self.ports.supervisor.stop_unit(&unit, None).await {
                        tracing::warn!(unit = %unit, error = %e, "Failed to stop unit, continuing");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Cannot load deployment, stopping pod only");
            }
        }

        self.ports.engine.stop_pod(dir).await?;
        Ok(())
    }

    /// Run post-stop hooks. Files stay in place.
    pub async fn cleanup(&self, dir: &Path) -> Result<()> {
        let (deployment, service) = self.load(dir)?;
        tracing::info!(deployment = %deployment.name, "Cleaning up deployment");
        let vars = deployment_vars(&service, &deployment, dir);
        self.run_hooks(HookPhase::PostStop, &service, &vars, dir).await
    }

    /// Register or deregister the deployment's routes.
    ///
    /// Registration first makes sure the service-level config unit is up so
    /// service routes exist before deployment routes reference them.
    /// Deregistration removes exactly what was last registered.
    pub async fn caddy_register(&self, dir: &Path, register: bool) -> Result<()> {
        let (mut deployment, service) = self.load(dir)?;

        let text = if register {
            self.ports
                .supervisor
                .start_unit(&service_config_unit(&service.dir))
                .await?;
            let rendered = self.render_proxy_config(&service, &deployment, dir)?;
            if rendered != deployment.templated_proxy_config {
                deployment.templated_proxy_config = rendered.clone();
                self.ports.store.save_deployment(dir, &deployment)?;
            }
            rendered
        } else {
            match deployment.templated_proxy_config.clone() {
                Some(text) => Some(text),
                None => self.render_proxy_config(&service, &deployment, dir)?,
            }
        };

        let Some(text) = text else {
            tracing::debug!(deployment = %deployment.name, "No proxy config");
            return Ok(());
        };
        let items = parse_items(&text)?;
        tracing::info!(
            deployment = %deployment.name,
            items = items.len(),
            register,
            "Reconciling proxy config"
        );
        Reconciler::new(self.ports.proxy.clone())
            .reconcile(&items, register)
            .await?;
        Ok(())
    }
}

fn dir_name(dir: &Path) -> Result<String> {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::Config(ConfigError::NotFound {
                path: dir.to_path_buf(),
            })
        })
}
