//! `${NAME}` template rendering.
//!
//! `$$` renders a literal dollar. A `$` followed by anything else is kept
//! as is. Every referenced variable must be defined.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::json;
use thiserror::Error;

use crate::config::ConfigValue;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("{}: undefined variable ${{{name}}}", source_name(.path))]
    UnknownVariable { path: Option<PathBuf>, name: String },

    #[error("{}: unterminated ${{ at byte {offset}", source_name(.path))]
    Unterminated { path: Option<PathBuf>, offset: usize },

    #[error("cannot read template {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode config map: {0}")]
    Encode(#[from] serde_yaml::Error),
}

fn source_name(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => path.display().to_string(),
        None => "template".to_string(),
    }
}

impl TemplateError {
    fn at(self, template: &Path) -> Self {
        let path = Some(template.to_path_buf());
        match self {
            TemplateError::UnknownVariable { name, .. } => TemplateError::UnknownVariable { path, name },
            TemplateError::Unterminated { offset, .. } => TemplateError::Unterminated { path, offset },
            other => other,
        }
    }
}

/// Substitute `${NAME}` from `vars`.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut consumed = 0;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            consumed += pos + 2;
            rest = tail;
        } else if let Some(tail) = after.strip_prefix('{') {
            let Some(end) = tail.find('}') else {
                return Err(TemplateError::Unterminated {
                    path: None,
                    offset: consumed + pos,
                });
            };
            let name = &tail[..end];
            let value = vars.get(name).ok_or_else(|| TemplateError::UnknownVariable {
                path: None,
                name: name.to_string(),
            })?;
            out.push_str(value);
            consumed += pos + 2 + end + 1;
            rest = &tail[end + 1..];
        } else {
            out.push('$');
            consumed += pos + 1;
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Read and render the template at `path`.
pub fn render_file(path: &Path, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let text = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    render(&text, vars).map_err(|e| e.at(path))
}

/// Config-map manifest named `name` carrying `config`. `None` when empty.
pub fn configmap(
    name: &str,
    config: &BTreeMap<String, ConfigValue>,
) -> Result<Option<String>, TemplateError> {
    if config.is_empty() {
        return Ok(None);
    }
    let data: BTreeMap<&str, String> = config.iter().map(|(k, v)| (k.as_str(), v.as_env())).collect();
    let manifest = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name },
        "data": data,
    });
    Ok(Some(serde_yaml::to_string(&manifest)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, String> {
        [("APP", "web"), ("POD_IP_ADDRESS", "10.88.0.2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_and_escapes() {
        let out = render("name: ${APP}\ndial: ${POD_IP_ADDRESS}:80\ncost: $$5 $x", &vars()).unwrap();
        assert_eq!(out, "name: web\ndial: 10.88.0.2:80\ncost: $5 $x");
    }

    #[test]
    fn unknown_variable_fails_closed() {
        let err = render("${APP} ${MISSING}", &vars()).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownVariable { ref name, .. } if name == "MISSING"));
    }

    #[test]
    fn unterminated_reference() {
        let err = render("ab ${APP", &vars()).unwrap_err();
        assert!(matches!(err, TemplateError::Unterminated { offset: 3, .. }));
    }

    #[test]
    fn file_errors_carry_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pod.yml");
        std::fs::write(&path, "${NOPE}").unwrap();
        let err = render_file(&path, &vars()).unwrap_err();
        assert!(err.to_string().contains("pod.yml"));
        assert!(err.to_string().contains("${NOPE}"));
    }

    #[test]
    fn configmap_from_config() {
        let config: BTreeMap<String, ConfigValue> = [
            ("PORT".to_string(), ConfigValue::Number("8080".into())),
            ("DEBUG".to_string(), ConfigValue::Bool(false)),
        ]
        .into_iter()
        .collect();
        let manifest = configmap("web-prod-1", &config).unwrap().unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&manifest).unwrap();
        assert_eq!(parsed["kind"], "ConfigMap");
        assert_eq!(parsed["metadata"]["name"], "web-prod-1");
        assert_eq!(parsed["data"]["PORT"], "8080");
        assert_eq!(parsed["data"]["DEBUG"], "false");
        assert!(configmap("x", &BTreeMap::new()).unwrap().is_none());
    }
}
