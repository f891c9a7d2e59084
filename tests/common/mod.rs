//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::header::{ETAG, IF_MATCH};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use futures_util::FutureExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

use conductor::config::{ConfigStore, EnvironmentContext};
use conductor::container::MemoryEngine;
use conductor::deployment::DeploymentDriver;
use conductor::ports::Ports;
use conductor::proxy::MemoryProxy;
use conductor::runtime::Shutdown;
use conductor::service::ServiceDriver;
use conductor::supervisor::memory::UnitAction;
use conductor::supervisor::units::{
    deployment_of_unit, unescape_path, DEPLOYMENT_CONFIG_UNIT_PREFIX, DEPLOYMENT_UNIT_PREFIX,
    SERVICE_CONFIG_UNIT_PREFIX,
};
use conductor::supervisor::{MemorySupervisor, RecordingNotifier};

/// Serve `proxy` over HTTP the way the Caddy admin API answers, and return
/// the endpoint URL.
pub async fn start_mock_proxy(proxy: Arc<MemoryProxy>) -> String {
    let app = Router::new()
        .route("/{*path}", any(handle_admin))
        .with_state(proxy);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn handle_admin(
    State(proxy): State<Arc<MemoryProxy>>,
    method: Method,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let method = match method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PATCH => "PATCH",
        Method::DELETE => "DELETE",
        _ => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    let if_match = headers.get(IF_MATCH).and_then(|v| v.to_str().ok());
    let body = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        }
    };

    let answer = proxy.handle(method, &path, if_match, body);
    let mut response = match answer.body {
        Some(body) => Json(body).into_response(),
        None => StatusCode::OK.into_response(),
    };
    *response.status_mut() = StatusCode::from_u16(answer.status).unwrap();
    if let Some(etag) = answer.etag {
        response
            .headers_mut()
            .insert(ETAG, HeaderValue::from_str(&etag).unwrap());
    }
    response
}

pub fn write(path: &Path, text: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, text).unwrap();
}

/// Caddy config with one HTTP server and no routes.
pub fn empty_caddy() -> Value {
    json!({"apps": {"http": {"servers": {"srv0": {"routes": []}}}}})
}

/// A rooted environment with every port in memory.
pub struct Fixture {
    pub root: TempDir,
    pub env: Arc<EnvironmentContext>,
    pub supervisor: Arc<MemorySupervisor>,
    pub engine: Arc<MemoryEngine>,
    pub proxy: Arc<MemoryProxy>,
    pub notifier: Arc<RecordingNotifier>,
    pub ports: Ports,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_env(|_| {})
    }

    pub fn with_env(tweak: impl FnOnce(&mut EnvironmentContext)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let root_path = root.path().canonicalize().unwrap();
        let mut env = EnvironmentContext::rooted_at(&root_path);
        tweak(&mut env);
        std::fs::create_dir_all(env.deployments_dir()).unwrap();
        let env = Arc::new(env);

        let supervisor = Arc::new(MemorySupervisor::new());
        let engine = Arc::new(MemoryEngine::new());
        let proxy = Arc::new(MemoryProxy::new(empty_caddy()));
        let notifier = Arc::new(RecordingNotifier::new());
        let ports = Ports {
            env: env.clone(),
            store: ConfigStore::new(env.clone()),
            supervisor: supervisor.clone(),
            engine: engine.clone(),
            proxy: proxy.clone(),
            notifier: notifier.clone(),
            shutdown: Shutdown::new(),
        };
        Self {
            root,
            env,
            supervisor,
            engine,
            proxy,
            notifier,
            ports,
        }
    }

    /// Write `services/<app>/<instance>/<name>` and return its path.
    pub fn service_file(&self, app: &str, instance: &str, name: &str, text: &str) -> PathBuf {
        let path = self.env.service_paths[0].join(app).join(instance).join(name);
        write(&path, text);
        path
    }

    pub fn service_driver(&self) -> ServiceDriver {
        ServiceDriver::new(self.ports.clone())
    }

    /// Make the memory supervisor run units the way their unit files do:
    /// deployment units prepare/start and stop/cleanup, config units
    /// register and deregister routes.
    pub fn wire_units(&self) {
        let driver = DeploymentDriver::new(self.ports.clone());
        let env = self.env.clone();
        self.supervisor.on_unit(DEPLOYMENT_UNIT_PREFIX, move |action, unit| {
            let driver = driver.clone();
            let dir = env.deployment_dir(deployment_of_unit(&unit).unwrap_or_default());
            async move {
                let result = match action {
                    UnitAction::Start => match driver.prepare(&dir).await {
                        Ok(_) => driver.start(&dir).await.map(|_| ()),
                        Err(e) => Err(e),
                    },
                    UnitAction::Stop => match driver.stop(&dir).await {
                        Ok(()) => driver.cleanup(&dir).await,
                        Err(e) => Err(e),
                    },
                };
                result.map_err(|e| e.to_string())
            }
            .boxed()
        });

        let driver = DeploymentDriver::new(self.ports.clone());
        let env = self.env.clone();
        self.supervisor.on_unit(DEPLOYMENT_CONFIG_UNIT_PREFIX, move |action, unit| {
            let driver = driver.clone();
            let name = unit
                .strip_prefix(DEPLOYMENT_CONFIG_UNIT_PREFIX)
                .and_then(|u| u.strip_suffix(".service"))
                .unwrap_or_default()
                .to_string();
            let dir = env.deployment_dir(&name);
            async move {
                driver
                    .caddy_register(&dir, action == UnitAction::Start)
                    .await
                    .map_err(|e| e.to_string())
            }
            .boxed()
        });

        let service = self.service_driver();
        self.supervisor.on_unit(SERVICE_CONFIG_UNIT_PREFIX, move |action, unit| {
            let service = service.clone();
            let escaped = unit
                .strip_prefix(SERVICE_CONFIG_UNIT_PREFIX)
                .and_then(|u| u.strip_suffix(".service"))
                .unwrap_or_default()
                .to_string();
            async move {
                service
                    .register(&unescape_path(&escaped), action == UnitAction::Start)
                    .await
                    .map_err(|e| e.to_string())
            }
            .boxed()
        });
    }
}

/// A service whose deployments run one pod and register one upstream.
pub const WEB_SERVICE: &str = r#"
app: web
instance: prod
config:
  greeting: hello
pod: pod.yml
proxy-config: proxy.json
service-proxy-config: service-proxy.json
"#;

pub const WEB_POD: &str = r#"apiVersion: v1
kind: Pod
metadata:
  name: ${CONDUCTOR_DEPLOYMENT}
spec:
  containers:
    - name: app
      image: docker.io/library/nginx
"#;

pub const WEB_PROXY: &str = r#"[
  {"mount": "apps/http/servers/srv0/routes/0/handle/0/upstreams",
   "config": {"@id": "${CONDUCTOR_DEPLOYMENT}.upstream",
              "dial": "unix/${CONDUCTOR_DEPLOYMENT_DIR}/${CONDUCTOR_DEPLOYMENT}.sock"}}
]"#;

pub const WEB_SERVICE_PROXY: &str = r#"[
  {"mount": "apps/http/servers/srv0/routes",
   "config": {"@id": "${CONDUCTOR_APP}-${CONDUCTOR_INSTANCE}.route",
              "handle": [{"handler": "reverse_proxy", "upstreams": []}]}}
]"#;

impl Fixture {
    /// Lay down the web service and its templates; returns the service file.
    pub fn web_service(&self) -> PathBuf {
        self.service_file("web", "prod", "pod.yml", WEB_POD);
        self.service_file("web", "prod", "proxy.json", WEB_PROXY);
        self.service_file("web", "prod", "service-proxy.json", WEB_SERVICE_PROXY);
        self.service_file("web", "prod", "service.yaml", WEB_SERVICE)
    }
}
