//! Container engine subsystem.
//!
//! # Data Flow
//! ```text
//! deployment driver
//!     → ContainerEngine::start_pod(dir, pod.yml, configmap.yml?)
//!         → podman.rs (kube play --replace / kube down / inspect)
//!         → memory.rs (in-process pods for tests)
//!     → find_pod_ip (poll pod → containers → networks)
//! ```
//!
//! # Design Decisions
//! - Manifests are written into the deployment directory before the engine
//!   runs, so `stop_pod` needs nothing but the directory
//! - IP discovery is polled because the engine reports the pod before its
//!   network is attached

pub mod memory;
pub mod podman;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::schema::{CONFIGMAP_FILE, POD_MANIFEST_FILE};
use crate::runtime::ProcessError;

pub use memory::MemoryEngine;
pub use podman::PodmanEngine;

/// Attempts made by [`find_pod_ip`] by default.
pub const IP_ATTEMPTS: u32 = 5;
/// Spacing between attempts of [`find_pod_ip`].
pub const IP_SPACING: Duration = Duration::from_secs(5);

/// Errors raised by container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("{action} failed: {source}")]
    Command {
        action: &'static str,
        #[source]
        source: ProcessError,
    },

    #[error("cannot write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse inspect output for {target}: {reason}")]
    Inspect { target: String, reason: String },

    #[error("container engine error: {0}")]
    Engine(String),

    #[error("pod manifest has no metadata.name")]
    UnnamedPod,

    #[error("no IP address for pod {pod} after {attempts} attempts")]
    PodIpNotFound { pod: String, attempts: u32 },
}

/// Operations on pods.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Write the manifests under `dir` and (re)play the pod.
    async fn start_pod(
        &self,
        dir: &Path,
        manifest: &[u8],
        configmap: Option<&[u8]>,
    ) -> Result<(), ContainerError>;

    /// Tear down the pod described by the manifests under `dir`.
    async fn stop_pod(&self, dir: &Path) -> Result<(), ContainerError>;

    /// One lookup of the pod's address. `None` while no network reports one.
    async fn pod_ip(&self, pod: &str) -> Result<Option<String>, ContainerError>;
}

/// Write `pod.yml` and, when given, `configmap.yml` under `dir`. A stale
/// config map is removed when none is given.
pub fn write_manifests(
    dir: &Path,
    manifest: &[u8],
    configmap: Option<&[u8]>,
) -> Result<(PathBuf, Option<PathBuf>), ContainerError> {
    let write = |path: PathBuf, bytes: &[u8]| {
        std::fs::write(&path, bytes)
            .map(|()| path.clone())
            .map_err(|source| ContainerError::Io { path, source })
    };
    let pod = write(dir.join(POD_MANIFEST_FILE), manifest)?;
    let configmap = match configmap {
        Some(bytes) => Some(write(dir.join(CONFIGMAP_FILE), bytes)?),
        None => {
            let path = dir.join(CONFIGMAP_FILE);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(ContainerError::Io { path, source }),
            }
            None
        }
    };
    Ok((pod, configmap))
}

/// `metadata.name` of the first document in a pod manifest.
pub fn manifest_pod_name(manifest: &str) -> Result<String, ContainerError> {
    use serde::Deserialize;

    for document in serde_yaml::Deserializer::from_str(manifest) {
        let Ok(value) = serde_yaml::Value::deserialize(document) else {
            continue;
        };
        if value.get("kind").and_then(|k| k.as_str()) != Some("Pod") {
            continue;
        }
        if let Some(name) = value
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
        {
            return Ok(name.to_string());
        }
    }
    Err(ContainerError::UnnamedPod)
}

/// Poll `engine` for the pod's address, `attempts` times `spacing` apart.
pub async fn find_pod_ip(
    engine: &dyn ContainerEngine,
    pod: &str,
    attempts: u32,
    spacing: Duration,
) -> Result<String, ContainerError> {
    for attempt in 1..=attempts {
        match engine.pod_ip(pod).await {
            Ok(Some(ip)) => {
                tracing::debug!(pod = %pod, ip = %ip, attempt, "Found pod IP");
                return Ok(ip);
            }
            Ok(None) => tracing::debug!(pod = %pod, attempt, "Pod has no IP yet"),
            Err(e) => tracing::warn!(pod = %pod, attempt, error = %e, "Pod inspection failed"),
        }
        if attempt < attempts {
            tokio::time::sleep(spacing).await;
        }
    }
    Err(ContainerError::PodIpNotFound {
        pod: pod.to_string(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
---
apiVersion: v1
kind: Pod
metadata:
  name: web-prod-1
spec:
  containers: []
";

    #[test]
    fn pod_name_skips_other_kinds() {
        assert_eq!(manifest_pod_name(MANIFEST).unwrap(), "web-prod-1");
        assert!(matches!(
            manifest_pod_name("kind: Pod\nspec: {}\n"),
            Err(ContainerError::UnnamedPod)
        ));
    }

    #[test]
    fn manifests_replace_stale_configmap() {
        let dir = tempfile::tempdir().unwrap();
        write_manifests(dir.path(), b"pod", Some(b"cm")).unwrap();
        assert!(dir.path().join(CONFIGMAP_FILE).exists());
        write_manifests(dir.path(), b"pod", None).unwrap();
        assert!(!dir.path().join(CONFIGMAP_FILE).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn ip_discovery_polls_then_gives_up() {
        let engine = MemoryEngine::new();
        let started = tokio::time::Instant::now();
        let err = find_pod_ip(&engine, "ghost", IP_ATTEMPTS, IP_SPACING).await.unwrap_err();
        assert!(matches!(err, ContainerError::PodIpNotFound { attempts: 5, .. }));
        assert_eq!(started.elapsed(), IP_SPACING * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn ip_discovery_waits_for_network() {
        let engine = std::sync::Arc::new(MemoryEngine::new());
        engine.delay_ip("web-prod-1", 2);
        let dir = tempfile::tempdir().unwrap();
        engine.start_pod(dir.path(), MANIFEST.as_bytes(), None).await.unwrap();

        let ip = find_pod_ip(engine.as_ref(), "web-prod-1", IP_ATTEMPTS, IP_SPACING)
            .await
            .unwrap();
        assert!(ip.starts_with("10.88.0."));
    }
}
