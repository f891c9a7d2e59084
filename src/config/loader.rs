//! Configuration loading from disk.
//!
//! Service documents are read in two shapes: a shallow one exposing only
//! `inherit`, and the full document as a JSON value. Parents are loaded
//! recursively and the child is overlaid on top of them.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::digest;
use crate::config::merge::overlay;
use crate::config::schema::{Service, ServiceDocument, SERVICE_FILE};
use crate::config::validation::{validate_service, ValidationError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("inheritance cycle through {}", path.display())]
    InheritanceCycle { path: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {}: {}", path.display(), join_errors(.errors))]
    Validation {
        path: PathBuf,
        errors: Vec<ValidationError>,
    },

    #[error("no service named '{0}'")]
    UnknownService(String),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ConfigError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfigError::NotFound { .. })
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Only the `inherit` list of a document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InheritShape {
    inherit: Vec<String>,
}

/// Read a text file, mapping a missing file to [`ConfigError::NotFound`].
pub fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))
}

/// Parse YAML text into a JSON value.
pub fn parse_yaml(path: &Path, text: &str) -> Result<Value, ConfigError> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;
    Ok(match value {
        Value::Null => Value::Object(Default::default()),
        other => other,
    })
}

/// Resolve `path` to the service document it names.
///
/// A directory (or a path with a trailing slash) means its `service.yaml`.
pub fn service_file_path(path: &Path) -> PathBuf {
    let trailing_slash = path.as_os_str().to_string_lossy().ends_with('/');
    if trailing_slash || path.is_dir() {
        path.join(SERVICE_FILE)
    } else {
        path.to_path_buf()
    }
}

/// Load and fully resolve the service at `path`.
pub fn load_service(path: &Path) -> Result<Service, ConfigError> {
    let file = service_file_path(path);
    let file = file.canonicalize().map_err(|e| ConfigError::io(&file, e))?;
    let mut visiting = Vec::new();
    let resolved = load_resolved(&file, &mut visiting)?;
    build_service(&file, resolved)
}

/// Load one document and everything it inherits from.
fn load_resolved(file: &Path, visiting: &mut Vec<PathBuf>) -> Result<Value, ConfigError> {
    if visiting.iter().any(|p| p == file) {
        return Err(ConfigError::InheritanceCycle {
            path: file.to_path_buf(),
        });
    }

    let text = read_file(file)?;
    let mut value = parse_yaml(file, &text)?;
    let shallow: InheritShape =
        serde_json::from_value(value.clone()).map_err(|e| ConfigError::Parse {
            path: file.to_path_buf(),
            source: Box::new(e),
        })?;

    let dir = file.parent().unwrap_or(Path::new("/")).to_path_buf();
    resolve_paths(&mut value, &dir);
    if let Value::Object(map) = &mut value {
        map.remove("inherit");
    }

    let mut base = Value::Object(Default::default());
    visiting.push(file.to_path_buf());
    for entry in &shallow.inherit {
        let (ignore_missing, target) = match entry.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, entry.as_str()),
        };
        let parent = service_file_path(&dir.join(target));
        let parent = match parent.canonicalize() {
            Ok(p) => p,
            Err(e) if ignore_missing && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(parent = %parent.display(), "Optional parent missing");
                continue;
            }
            Err(e) => {
                visiting.pop();
                return Err(ConfigError::io(&parent, e));
            }
        };
        match load_resolved(&parent, visiting) {
            Ok(parent_value) => overlay(&mut base, parent_value),
            Err(e) if ignore_missing && e.is_not_found() => {
                tracing::debug!(parent = %parent.display(), "Optional parent missing");
            }
            Err(e) => {
                visiting.pop();
                return Err(e);
            }
        }
    }
    visiting.pop();

    overlay(&mut base, value);
    Ok(base)
}

/// Make the path-typed fields of one document absolute, relative to `dir`.
fn resolve_paths(doc: &mut Value, dir: &Path) {
    let Value::Object(map) = doc else {
        return;
    };
    for key in ["pod", "proxy-config", "service-proxy-config"] {
        if let Some(v) = map.get_mut(key) {
            absolutize(v, dir);
        }
    }
    if let Some(Value::Array(parts)) = map.get_mut("pods") {
        for part in parts.iter_mut().filter_map(Value::as_object_mut) {
            for key in ["pod", "proxy-config"] {
                if let Some(v) = part.get_mut(key) {
                    absolutize(v, dir);
                }
            }
        }
    }
    for key in ["hooks", "functions"] {
        if let Some(Value::Array(entries)) = map.get_mut(key) {
            for exec in entries.iter_mut().filter_map(|e| e.get_mut("exec")) {
                match exec {
                    Value::Array(argv) => {
                        if let Some(first) = argv.first_mut() {
                            absolutize_program(first, dir);
                        }
                    }
                    single => absolutize_program(single, dir),
                }
            }
        }
    }
    if let Some(Value::Array(conditions)) = map.get_mut("conditions") {
        for v in conditions.iter_mut().filter_map(|c| c.get_mut("exists")) {
            absolutize(v, dir);
        }
    }
}

fn absolutize(value: &mut Value, dir: &Path) {
    if let Value::String(s) = value {
        let path = Path::new(s.as_str());
        if path.is_relative() {
            *s = dir.join(path).to_string_lossy().into_owned();
        }
    }
}

/// Programs are resolved only when written as a relative path (`./x`, `bin/x`);
/// bare names stay subject to `PATH` lookup.
fn absolutize_program(value: &mut Value, dir: &Path) {
    if let Value::String(s) = value {
        if s.contains('/') && Path::new(s.as_str()).is_relative() {
            *s = dir.join(s.as_str()).to_string_lossy().into_owned();
        }
    }
}

/// Apply defaults, compute identity, validate.
fn build_service(file: &Path, mut resolved: Value) -> Result<Service, ConfigError> {
    let dir = file.parent().unwrap_or(Path::new("/")).to_path_buf();
    let parse_err = |e: serde_json::Error| ConfigError::Parse {
        path: file.to_path_buf(),
        source: Box::new(e),
    };

    let mut doc: ServiceDocument = serde_json::from_value(resolved.clone()).map_err(parse_err)?;
    let app = doc.app.take().unwrap_or_else(|| {
        dir.parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let instance = doc.instance.take().unwrap_or_else(|| {
        dir.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    if let Value::Object(map) = &mut resolved {
        map.insert("app".to_string(), Value::String(app.clone()));
        map.insert("instance".to_string(), Value::String(instance.clone()));
    }

    let service = Service {
        id: digest::identity(&resolved),
        dir,
        file: file.to_path_buf(),
        app,
        instance,
        config: doc.config,
        pod: doc.pod,
        proxy_config: doc.proxy_config,
        service_proxy_config: doc.service_proxy_config,
        hooks: doc.hooks,
        functions: doc.functions,
        pods: doc.pods,
        policies: doc.policies,
        columns: doc.columns,
        conditions: doc.conditions,
    };

    validate_service(&service).map_err(|errors| ConfigError::Validation {
        path: file.to_path_buf(),
        errors,
    })?;
    Ok(service)
}
