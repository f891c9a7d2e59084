//! In-process container engine.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::container::{manifest_pod_name, write_manifests, ContainerEngine, ContainerError};

#[derive(Default)]
struct State {
    /// Running pods by deployment directory.
    running: BTreeMap<PathBuf, String>,
    addresses: HashMap<String, String>,
    /// Lookups left before a pod reports its address.
    pending: HashMap<String, u32>,
    next_host: u8,
    fail_start: Option<String>,
    history: Vec<String>,
}

/// Pods are names in a map; addresses are handed out from 10.88.0.0/24.
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Names of running pods.
    pub fn running(&self) -> Vec<String> {
        self.lock().running.values().cloned().collect()
    }

    /// `start:<pod>` / `stop:<pod>` in call order.
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    /// Let `pod` report no address for its first `lookups` inspections.
    pub fn delay_ip(&self, pod: &str, lookups: u32) {
        self.lock().pending.insert(pod.to_string(), lookups);
    }

    /// Make the next `start_pod` fail with `reason`.
    pub fn fail_next_start(&self, reason: &str) {
        self.lock().fail_start = Some(reason.to_string());
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn start_pod(
        &self,
        dir: &Path,
        manifest: &[u8],
        configmap: Option<&[u8]>,
    ) -> Result<(), ContainerError> {
        write_manifests(dir, manifest, configmap)?;
        let pod = manifest_pod_name(&String::from_utf8_lossy(manifest))?;

        let mut state = self.lock();
        if let Some(reason) = state.fail_start.take() {
            return Err(ContainerError::Engine(reason));
        }
        if !state.addresses.contains_key(&pod) {
            state.next_host = state.next_host.wrapping_add(1).max(2);
            let ip = format!("10.88.0.{}", state.next_host);
            state.addresses.insert(pod.clone(), ip);
        }
        state.history.push(format!("start:{pod}"));
        state.running.insert(dir.to_path_buf(), pod);
        Ok(())
    }

    async fn stop_pod(&self, dir: &Path) -> Result<(), ContainerError> {
        let mut state = self.lock();
        match state.running.remove(dir) {
            Some(pod) => {
                state.history.push(format!("stop:{pod}"));
                state.addresses.remove(&pod);
            }
            None => tracing::debug!(dir = %dir.display(), "No pod to stop"),
        }
        Ok(())
    }

    async fn pod_ip(&self, pod: &str) -> Result<Option<String>, ContainerError> {
        let mut state = self.lock();
        if !state.running.values().any(|p| p == pod) {
            return Ok(None);
        }
        if let Some(left) = state.pending.get_mut(pod) {
            if *left > 0 {
                *left -= 1;
                return Ok(None);
            }
        }
        Ok(state.addresses.get(pod).cloned())
    }
}
