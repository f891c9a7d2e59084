//! Podman adapter.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::schema::{CONFIGMAP_FILE, POD_MANIFEST_FILE};
use crate::container::{write_manifests, ContainerEngine, ContainerError};
use crate::runtime::process::{self, CommandOutput, CommandSpec};
use crate::runtime::ShutdownSignal;

/// Drives `podman kube play` / `kube down` and reads `inspect` output.
#[derive(Debug, Clone)]
pub struct PodmanEngine {
    program: String,
    term_grace: Duration,
    cancel: Option<ShutdownSignal>,
}

impl PodmanEngine {
    pub fn new(term_grace: Duration) -> Self {
        Self {
            program: "podman".to_string(),
            term_grace,
            cancel: None,
        }
    }

    /// Cancel in-flight podman commands when `signal` fires.
    pub fn with_cancel(mut self, signal: ShutdownSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.program).term_grace(self.term_grace)
    }

    async fn run(
        &self,
        action: &'static str,
        spec: CommandSpec,
    ) -> Result<CommandOutput, ContainerError> {
        process::run(&spec, self.cancel.clone())
            .await
            .map_err(|source| ContainerError::Command { action, source })
    }

    async fn inspect(&self, kind: &'static str, targets: &[String]) -> Result<Value, ContainerError> {
        let spec = self.command().args([kind, "inspect"]).args(targets.iter().cloned());
        let output = self.run("inspect", spec).await?;
        serde_json::from_slice(&output.stdout).map_err(|e| ContainerError::Inspect {
            target: targets.join(" "),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl ContainerEngine for PodmanEngine {
    async fn start_pod(
        &self,
        dir: &Path,
        manifest: &[u8],
        configmap: Option<&[u8]>,
    ) -> Result<(), ContainerError> {
        let (_, configmap) = write_manifests(dir, manifest, configmap)?;

        let mut spec = self
            .command()
            .args(["kube", "play", "--replace"])
            .cwd(dir);
        if configmap.is_some() {
            spec = spec.args(["--configmap", CONFIGMAP_FILE]);
        }
        spec = spec.arg(POD_MANIFEST_FILE);

        tracing::info!(dir = %dir.display(), "Playing pod");
        self.run("kube play", spec).await?;
        Ok(())
    }

    async fn stop_pod(&self, dir: &Path) -> Result<(), ContainerError> {
        if !dir.join(POD_MANIFEST_FILE).exists() {
            tracing::debug!(dir = %dir.display(), "No pod manifest, nothing to stop");
            return Ok(());
        }
        let spec = self
            .command()
            .args(["kube", "down", POD_MANIFEST_FILE])
            .cwd(dir);
        tracing::info!(dir = %dir.display(), "Tearing down pod");
        self.run("kube down", spec).await?;
        Ok(())
    }

    async fn pod_ip(&self, pod: &str) -> Result<Option<String>, ContainerError> {
        let inspected = self.inspect("pod", &[pod.to_string()]).await?;
        let containers = pod_container_ids(&inspected);
        if containers.is_empty() {
            return Ok(None);
        }
        let inspected = self.inspect("container", &containers).await?;
        Ok(container_ip(&inspected))
    }
}

/// Container IDs of an inspected pod. Newer podman wraps the pod in an array.
fn pod_container_ids(inspected: &Value) -> Vec<String> {
    let pod = match inspected {
        Value::Array(pods) => pods.first().unwrap_or(&Value::Null),
        other => other,
    };
    pod.get("Containers")
        .and_then(Value::as_array)
        .map(|containers| {
            containers
                .iter()
                .filter_map(|c| c.get("Id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// First non-empty address over every container's networks.
fn container_ip(inspected: &Value) -> Option<String> {
    let containers = inspected.as_array()?;
    containers.iter().find_map(|container| {
        let settings = container.get("NetworkSettings")?;
        let from_networks = settings
            .get("Networks")
            .and_then(Value::as_object)
            .and_then(|networks| {
                networks
                    .values()
                    .filter_map(|n| n.get("IPAddress").and_then(Value::as_str))
                    .find(|ip| !ip.is_empty())
            });
        from_networks
            .or_else(|| {
                settings
                    .get("IPAddress")
                    .and_then(Value::as_str)
                    .filter(|ip| !ip.is_empty())
            })
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn container_ids_from_either_shape() {
        let single = json!({"Containers": [{"Id": "infra"}, {"Id": "app"}]});
        assert_eq!(pod_container_ids(&single), vec!["infra", "app"]);
        let wrapped = json!([{"Containers": [{"Id": "app"}]}]);
        assert_eq!(pod_container_ids(&wrapped), vec!["app"]);
        assert!(pod_container_ids(&json!([])).is_empty());
    }

    #[test]
    fn first_non_empty_address_wins() {
        let inspected = json!([
            {"NetworkSettings": {"IPAddress": "", "Networks": {"podman": {"IPAddress": ""}}}},
            {"NetworkSettings": {"Networks": {"podman": {"IPAddress": "10.88.0.7"}}}}
        ]);
        assert_eq!(container_ip(&inspected).as_deref(), Some("10.88.0.7"));

        let legacy = json!([{"NetworkSettings": {"IPAddress": "10.88.0.9"}}]);
        assert_eq!(container_ip(&legacy).as_deref(), Some("10.88.0.9"));

        let none = json!([{"NetworkSettings": {"IPAddress": ""}}]);
        assert_eq!(container_ip(&none), None);
    }

    #[tokio::test]
    async fn stop_without_manifest_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PodmanEngine {
            program: "/nonexistent/podman".to_string(),
            term_grace: Duration::from_secs(1),
            cancel: None,
        };
        engine.stop_pod(dir.path()).await.unwrap();
    }
}
