//! The adapters one lifecycle invocation works through.

use std::sync::Arc;

use crate::config::{ConfigStore, EnvironmentContext};
use crate::container::{ContainerEngine, PodmanEngine};
use crate::proxy::{ProxyApi, ProxyClient, ProxyError};
use crate::runtime::Shutdown;
use crate::supervisor::{Notifier, SdNotifier, Supervisor, SystemdSupervisor};

/// Environment, store and ports shared by the deployment and service drivers.
#[derive(Clone)]
pub struct Ports {
    pub env: Arc<EnvironmentContext>,
    pub store: ConfigStore,
    pub supervisor: Arc<dyn Supervisor>,
    pub engine: Arc<dyn ContainerEngine>,
    pub proxy: Arc<dyn ProxyApi>,
    pub notifier: Arc<dyn Notifier>,
    pub shutdown: Shutdown,
}

impl Ports {
    /// systemd, podman, the proxy admin API and `NOTIFY_SOCKET`.
    pub fn system(env: EnvironmentContext, shutdown: Shutdown) -> Result<Self, ProxyError> {
        let env = Arc::new(env);
        let proxy = ProxyClient::new(&env.proxy_endpoint)?;
        Ok(Self {
            store: ConfigStore::new(env.clone()),
            supervisor: Arc::new(SystemdSupervisor::new(env.user_mode, env.term_grace())),
            engine: Arc::new(PodmanEngine::new(env.term_grace()).with_cancel(shutdown.subscribe())),
            proxy: Arc::new(proxy),
            notifier: Arc::new(SdNotifier::from_env()),
            env,
            shutdown,
        })
    }
}
