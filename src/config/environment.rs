//! Process-wide environment context.
//!
//! Built once at program entry from `conductor.toml` plus environment
//! overrides, then passed explicitly to every subsystem.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::loader::ConfigError;
use crate::observability::logging::LogFormat;

/// Default location of the environment file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/conductor/conductor.toml";

/// Runtime directories and tunables shared by all lifecycle drivers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvironmentContext {
    /// Root of hand-authored configuration (policies, services).
    pub config_dir: PathBuf,

    /// Root of volatile runtime state; deployments live below it.
    pub runtime_dir: PathBuf,

    /// Root of persistent state.
    pub state_dir: PathBuf,

    /// Directory where supervisor drop-ins are written.
    pub unit_dir: PathBuf,

    /// Directories searched for services by name.
    pub service_paths: Vec<PathBuf>,

    /// Base URL of the reverse proxy's config API.
    pub proxy_endpoint: String,

    /// Talk to the per-user supervisor instead of the system one.
    pub user_mode: bool,

    /// Deadline for a single hook execution.
    pub hook_timeout_secs: u64,

    /// Highest deployment slot index.
    pub max_index: u32,

    /// Time a deployment gets to stop before escalation.
    pub stop_grace_secs: u64,

    /// Time between SIGTERM and SIGKILL.
    pub term_grace_secs: u64,

    /// Interval of the service monitoring loop.
    pub monitor_interval_secs: u64,

    pub log_level: String,
    pub log_format: LogFormat,

    /// Prometheus exporter bind address (sidecar only).
    pub metrics_address: Option<String>,

    /// Idle shutdown delay of socket-activated sidecars.
    pub idle_after_secs: u64,
}

impl Default for EnvironmentContext {
    fn default() -> Self {
        let config_dir = PathBuf::from("/etc/conductor");
        Self {
            service_paths: vec![config_dir.join("services")],
            config_dir,
            runtime_dir: PathBuf::from("/run/conductor"),
            state_dir: PathBuf::from("/var/lib/conductor"),
            unit_dir: PathBuf::from("/run/systemd/system"),
            proxy_endpoint: "http://localhost:2019".to_string(),
            user_mode: false,
            hook_timeout_secs: 60,
            max_index: 10,
            stop_grace_secs: 90,
            term_grace_secs: 10,
            monitor_interval_secs: 30,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_address: None,
            idle_after_secs: 30,
        }
    }
}

impl EnvironmentContext {
    /// Load from `CONDUCTOR_CONFIG` (or the default path) and apply
    /// environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os("CONDUCTOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut ctx = Self::from_file(&path)?;
        ctx.apply_overrides(|key| std::env::var(key).ok());
        Ok(ctx)
    }

    /// Parse a TOML file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No environment file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(e),
        })
    }

    /// Apply `CONDUCTOR_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("CONDUCTOR_CONFIG_DIR") {
            let dir = PathBuf::from(dir);
            // Service search path follows the config dir unless set explicitly
            if self.service_paths == vec![self.config_dir.join("services")] {
                self.service_paths = vec![dir.join("services")];
            }
            self.config_dir = dir;
        }
        if let Some(dir) = lookup("CONDUCTOR_RUNTIME_DIR") {
            self.runtime_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CONDUCTOR_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CONDUCTOR_UNIT_DIR") {
            self.unit_dir = PathBuf::from(dir);
        }
        if let Some(paths) = lookup("CONDUCTOR_SERVICE_PATH") {
            self.service_paths = std::env::split_paths(&paths).collect();
        }
        if let Some(endpoint) = lookup("CONDUCTOR_PROXY_ENDPOINT") {
            self.proxy_endpoint = endpoint;
        }
        if let Some(flag) = lookup("CONDUCTOR_USER_MODE") {
            self.user_mode = matches!(flag.as_str(), "1" | "true" | "yes");
        }
    }

    /// Directory holding one subdirectory per deployment.
    pub fn deployments_dir(&self) -> PathBuf {
        self.runtime_dir.join("deployments")
    }

    /// Directory of the named deployment.
    pub fn deployment_dir(&self, name: &str) -> PathBuf {
        self.deployments_dir().join(name)
    }

    /// Directory holding policy documents.
    pub fn policies_dir(&self) -> PathBuf {
        self.config_dir.join("policies")
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn term_grace(&self) -> Duration {
        Duration::from_secs(self.term_grace_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    /// Context rooted entirely below `root`, for tests and local runs.
    pub fn rooted_at(root: &Path) -> Self {
        let config_dir = root.join("etc");
        Self {
            service_paths: vec![config_dir.join("services")],
            config_dir,
            runtime_dir: root.join("run"),
            state_dir: root.join("state"),
            unit_dir: root.join("units"),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_sane() {
        let ctx = EnvironmentContext::default();
        assert_eq!(ctx.hook_timeout(), Duration::from_secs(60));
        assert_eq!(ctx.max_index, 10);
        assert_eq!(ctx.deployment_dir("web-prod-1"), PathBuf::from("/run/conductor/deployments/web-prod-1"));
    }

    #[test]
    fn parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        std::fs::write(&path, "runtime_dir = \"/tmp/rt\"\nmax_index = 3\nlog_format = \"json\"\n").unwrap();
        let ctx = EnvironmentContext::from_file(&path).unwrap();
        assert_eq!(ctx.runtime_dir, PathBuf::from("/tmp/rt"));
        assert_eq!(ctx.max_index, 3);
        assert_eq!(ctx.log_format, LogFormat::Json);
        assert_eq!(ctx.hook_timeout_secs, 60);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let ctx = EnvironmentContext::from_file(Path::new("/nonexistent/conductor.toml")).unwrap();
        assert_eq!(ctx.proxy_endpoint, "http://localhost:2019");
    }

    #[test]
    fn overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("CONDUCTOR_CONFIG_DIR", "/srv/etc"),
            ("CONDUCTOR_RUNTIME_DIR", "/srv/run"),
            ("CONDUCTOR_USER_MODE", "1"),
        ]
        .into_iter()
        .collect();
        let mut ctx = EnvironmentContext::default();
        ctx.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(ctx.config_dir, PathBuf::from("/srv/etc"));
        assert_eq!(ctx.service_paths, vec![PathBuf::from("/srv/etc/services")]);
        assert_eq!(ctx.runtime_dir, PathBuf::from("/srv/run"));
        assert!(ctx.user_mode);
    }
}
