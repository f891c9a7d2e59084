//! On-disk document store.
//!
//! Services are looked up below the configured search paths as
//! `<root>/<app>/<instance>/service.yaml`. Deployments are directories below
//! the runtime root; a deployment exists exactly when its directory holds a
//! seed. Policies are YAML files below the config root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::environment::EnvironmentContext;
use crate::config::loader::{self, ConfigError};
use crate::config::schema::{
    ConfigValue, Deployment, Seed, Service, DEPLOYMENT_FILE, SEED_FILE, SERVICE_FILE,
};
use crate::config::validation::validate_policy;
use crate::policy::types::Policy;

/// Which deployments [`ConfigStore::list_deployments`] returns.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    pub service_dir: Option<PathBuf>,
    pub service_id: Option<String>,
    /// `Some(None)` selects deployments of the unnamed part.
    pub part: Option<Option<String>>,
}

impl DeploymentFilter {
    pub fn service(dir: &Path) -> Self {
        Self {
            service_dir: Some(dir.to_path_buf()),
            ..Self::default()
        }
    }

    fn accepts(&self, seed: &Seed) -> bool {
        self.service_dir.as_ref().map_or(true, |d| *d == seed.service_dir)
            && self.service_id.as_ref().map_or(true, |id| *id == seed.service_id)
            && self.part.as_ref().map_or(true, |p| *p == seed.part)
    }
}

/// A deployment directory found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentEntry {
    pub name: String,
    pub dir: PathBuf,
    pub seed: Seed,
}

/// Loads and saves services, deployments and policies.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    env: Arc<EnvironmentContext>,
}

impl ConfigStore {
    pub fn new(env: Arc<EnvironmentContext>) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &EnvironmentContext {
        &self.env
    }

    pub fn load_service(&self, path: &Path) -> Result<Service, ConfigError> {
        loader::load_service(path)
    }

    /// Resolve a service by path, `app/instance`, or `app-instance` name.
    pub fn load_service_by_name(&self, name: &str) -> Result<Service, ConfigError> {
        let as_path = Path::new(name);
        if as_path.is_absolute() || name.starts_with('.') {
            return self.load_service(as_path);
        }
        if let Some((app, instance)) = name.split_once('/') {
            for root in &self.env.service_paths {
                let candidate = root.join(app).join(instance).join(SERVICE_FILE);
                if candidate.exists() {
                    return self.load_service(&candidate);
                }
            }
            return Err(ConfigError::UnknownService(name.to_string()));
        }
        self.list_services()?
            .into_iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| ConfigError::UnknownService(name.to_string()))
    }

    /// Every service below the search paths. Unloadable documents are
    /// logged and skipped.
    pub fn list_services(&self) -> Result<Vec<Service>, ConfigError> {
        let mut services = Vec::new();
        for root in &self.env.service_paths {
            for app_dir in subdirs(root)? {
                for instance_dir in subdirs(&app_dir)? {
                    let file = instance_dir.join(SERVICE_FILE);
                    if !file.exists() {
                        continue;
                    }
                    match loader::load_service(&file) {
                        Ok(service) => services.push(service),
                        Err(e) => {
                            tracing::warn!(file = %file.display(), error = %e, "Skipping service")
                        }
                    }
                }
            }
        }
        services.sort_by(|a, b| a.name().cmp(&b.name()));
        Ok(services)
    }

    /// Set one key of the service's `config` map in its own document.
    ///
    /// Inherited values are shadowed, not edited.
    pub fn set_service_config(
        &self,
        service: &Service,
        key: &str,
        value: Option<ConfigValue>,
    ) -> Result<(), ConfigError> {
        let text = loader::read_file(&service.file)?;
        let mut doc: serde_yaml::Mapping = if text.trim().is_empty() {
            serde_yaml::Mapping::new()
        } else {
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
                path: service.file.clone(),
                source: Box::new(e),
            })?
        };
        let config = doc
            .entry(serde_yaml::Value::from("config"))
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
        if !config.is_mapping() {
            *config = serde_yaml::Value::Mapping(Default::default());
        }
        if let serde_yaml::Value::Mapping(map) = config {
            match value {
                Some(v) => {
                    let v = serde_yaml::to_value(&v).map_err(|e| ConfigError::Parse {
                        path: service.file.clone(),
                        source: Box::new(e),
                    })?;
                    map.insert(serde_yaml::Value::from(key), v);
                }
                None => {
                    map.remove(key);
                }
            }
        }
        let text = serde_yaml::to_string(&doc).map_err(|e| ConfigError::Parse {
            path: service.file.clone(),
            source: Box::new(e),
        })?;
        write_atomic(&service.file, text.as_bytes())
    }

    pub fn load_deployment(&self, dir: &Path) -> Result<Deployment, ConfigError> {
        read_json(&dir.join(DEPLOYMENT_FILE))
    }

    pub fn save_deployment(&self, dir: &Path, deployment: &Deployment) -> Result<(), ConfigError> {
        write_json(&dir.join(DEPLOYMENT_FILE), deployment)
    }

    pub fn load_seed(&self, dir: &Path) -> Result<Seed, ConfigError> {
        read_json(&dir.join(SEED_FILE))
    }

    pub fn save_seed(&self, dir: &Path, seed: &Seed) -> Result<(), ConfigError> {
        write_json(&dir.join(SEED_FILE), seed)
    }

    /// Deployment directories matching `filter`, ordered by name.
    pub fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> Result<Vec<DeploymentEntry>, ConfigError> {
        let mut entries = Vec::new();
        for dir in subdirs(&self.env.deployments_dir())? {
            let Some(name) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let seed = match self.load_seed(&dir) {
                Ok(seed) => seed,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    tracing::warn!(deployment = %name, error = %e, "Unreadable seed");
                    continue;
                }
            };
            if filter.accepts(&seed) {
                entries.push(DeploymentEntry { name, dir, seed });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn policy_path(&self, name: &str) -> PathBuf {
        self.env.policies_dir().join(format!("{name}.yaml"))
    }

    pub fn load_policy(&self, name: &str) -> Result<Policy, ConfigError> {
        load_policy_file(&self.policy_path(name))
    }

    pub fn save_policy(&self, policy: &Policy) -> Result<(), ConfigError> {
        let path = self.policy_path(&policy.name);
        validate_policy(policy).map_err(|errors| ConfigError::Validation {
            path: path.clone(),
            errors,
        })?;
        let text = serde_yaml::to_string(policy).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            source: Box::new(e),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
        }
        write_atomic(&path, text.as_bytes())
    }

    pub fn list_policies(&self) -> Result<Vec<Policy>, ConfigError> {
        let mut policies: Vec<_> = load_policies(&self.env.policies_dir())?.into_values().collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(policies)
    }
}

/// Parse and validate one policy file.
fn load_policy_file(path: &Path) -> Result<Policy, ConfigError> {
    let text = loader::read_file(path)?;
    let policy: Policy = serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;
    validate_policy(&policy).map_err(|errors| ConfigError::Validation {
        path: path.to_path_buf(),
        errors,
    })?;
    Ok(policy)
}

/// Every `*.yaml` policy in `dir`, keyed by name. A missing directory is empty.
pub fn load_policies(dir: &Path) -> Result<HashMap<String, Policy>, ConfigError> {
    let mut policies = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(policies),
        Err(e) => return Err(ConfigError::io(dir, e)),
    };
    for entry in entries {
        let path = entry.map_err(|e| ConfigError::io(dir, e))?.path();
        if path.extension().map_or(true, |ext| ext != "yaml") {
            continue;
        }
        let policy = load_policy_file(&path)?;
        policies.insert(policy.name.clone(), policy);
    }
    Ok(policies)
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ConfigError::io(dir, e)),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| ConfigError::io(dir, e))?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = loader::read_file(path)?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(e),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Write through a temporary sibling and rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ConfigError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(|e| ConfigError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| ConfigError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::{Bearer, Matcher};
    use std::fs;

    fn store(root: &Path) -> ConfigStore {
        ConfigStore::new(Arc::new(EnvironmentContext::rooted_at(root)))
    }

    fn add_service(root: &Path, app: &str, instance: &str, body: &str) -> PathBuf {
        let dir = root.join("etc/services").join(app).join(instance);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SERVICE_FILE), body).unwrap();
        dir
    }

    #[test]
    fn finds_services_by_name() {
        let root = tempfile::tempdir().unwrap();
        add_service(root.path(), "web", "prod", "config: {A: x}\n");
        add_service(root.path(), "web", "dev", "");
        let store = store(root.path());

        let names: Vec<_> = store.list_services().unwrap().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["web-dev", "web-prod"]);
        assert_eq!(store.load_service_by_name("web-prod").unwrap().instance, "prod");
        assert_eq!(store.load_service_by_name("web/dev").unwrap().instance, "dev");
        assert!(matches!(
            store.load_service_by_name("api-prod"),
            Err(ConfigError::UnknownService(_))
        ));
    }

    #[test]
    fn deployments_filter_by_seed() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());
        for (name, id, part) in [("web-prod-1", "a", None), ("web-prod-2", "b", None), ("web-prod-api-1", "b", Some("api"))] {
            let dir = store.env().deployment_dir(name);
            fs::create_dir_all(&dir).unwrap();
            let seed = Seed {
                service_dir: PathBuf::from("/srv/web/prod"),
                service_id: id.into(),
                part: part.map(str::to_string),
            };
            store.save_seed(&dir, &seed).unwrap();
        }
        fs::create_dir_all(store.env().deployment_dir("stray")).unwrap();

        let all = store.list_deployments(&DeploymentFilter::default()).unwrap();
        assert_eq!(all.len(), 3);

        let filter = DeploymentFilter {
            service_id: Some("b".into()),
            part: Some(None),
            ..DeploymentFilter::service(Path::new("/srv/web/prod"))
        };
        let names: Vec<_> = store.list_deployments(&filter).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["web-prod-2"]);
    }

    #[test]
    fn deployment_document_round_trips_on_disk() {
        let root = tempfile::tempdir().unwrap();
        let dir = add_service(root.path(), "web", "prod", "");
        let store = store(root.path());
        let service = store.load_service(&dir).unwrap();
        let mut deployment = Deployment::from_service("web-prod-1", &service, None);
        deployment.pod_ip = Some("10.0.0.2".into());

        let ddir = store.env().deployment_dir("web-prod-1");
        fs::create_dir_all(&ddir).unwrap();
        store.save_deployment(&ddir, &deployment).unwrap();
        assert_eq!(store.load_deployment(&ddir).unwrap(), deployment);
        assert!(store.load_deployment(&root.path().join("nope")).unwrap_err().is_not_found());
    }

    #[test]
    fn config_set_edits_own_document() {
        let root = tempfile::tempdir().unwrap();
        let dir = add_service(root.path(), "web", "prod", "config:\n  A: one\n");
        let store = store(root.path());
        let service = store.load_service(&dir).unwrap();

        store.set_service_config(&service, "B", Some(ConfigValue::Number("2".into()))).unwrap();
        store.set_service_config(&service, "A", None).unwrap();

        let reloaded = store.load_service(&dir).unwrap();
        assert!(!reloaded.config.contains_key("A"));
        assert_eq!(reloaded.config["B"], ConfigValue::Number("2".into()));
        assert_ne!(reloaded.id, service.id);
    }

    #[test]
    fn policies_save_and_list() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());
        let policy = Policy {
            name: "api".into(),
            matcher: Matcher {
                bearer: Some(vec![Bearer { token: Some("T".into()), ..Default::default() }]),
                ..Default::default()
            },
        };
        store.save_policy(&policy).unwrap();
        assert_eq!(store.load_policy("api").unwrap(), policy);
        assert_eq!(store.list_policies().unwrap().len(), 1);

        let invalid = Policy {
            name: "bad".into(),
            matcher: Matcher { bearer: Some(vec![Bearer::default()]), ..Default::default() },
        };
        assert!(matches!(store.save_policy(&invalid), Err(ConfigError::Validation { .. })));
    }
}
