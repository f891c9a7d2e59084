//! Policy directory watcher for hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::loader::ConfigError;
use crate::config::store::load_policies;
use crate::policy::types::PolicySet;

/// Keeps a shared policy snapshot in sync with a directory.
pub struct PolicyWatcher {
    dir: PathBuf,
    policies: Arc<ArcSwap<PolicySet>>,
}

impl PolicyWatcher {
    pub fn new(dir: &Path, policies: Arc<ArcSwap<PolicySet>>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            policies,
        }
    }

    /// Reload every policy. On error the current snapshot is kept.
    pub fn reload(&self) -> Result<usize, ConfigError> {
        reload_into(&self.dir, &self.policies)
    }

    /// Start watching in the background. Dropping the returned watcher stops it.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let dir = self.dir.clone();
        let policies = self.policies.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        tracing::info!(dir = %dir.display(), "Policy change detected, reloading");
                        if let Err(e) = reload_into(&dir, &policies) {
                            tracing::error!(error = %e, "Failed to reload policies, keeping current set");
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Policy watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Cannot create policy directory");
        }
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        tracing::info!(dir = %self.dir.display(), "Policy watcher started");
        Ok(watcher)
    }
}

fn reload_into(dir: &Path, policies: &ArcSwap<PolicySet>) -> Result<usize, ConfigError> {
    let fresh = load_policies(dir)?;
    let count = fresh.len();
    policies.store(Arc::new(fresh));
    tracing::debug!(count, "Policies loaded");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_replaces_snapshot_and_keeps_it_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let policies = Arc::new(ArcSwap::from_pointee(PolicySet::new()));
        let watcher = PolicyWatcher::new(dir.path(), policies.clone());

        std::fs::write(dir.path().join("open.yaml"), "name: open\nalways: true\n").unwrap();
        assert_eq!(watcher.reload().unwrap(), 1);
        assert!(policies.load().contains_key("open"));

        std::fs::write(dir.path().join("broken.yaml"), "name: [\n").unwrap();
        assert!(watcher.reload().is_err());
        assert!(policies.load().contains_key("open"));
    }
}
