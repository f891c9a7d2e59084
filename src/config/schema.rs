//! Configuration schema definitions.
//!
//! Service documents are hand-authored YAML; deployment documents and seeds
//! are machine-written JSON inside each deployment directory.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// Canonical service document name inside a service directory.
pub const SERVICE_FILE: &str = "service.yaml";
/// Deployment document name inside a deployment directory.
pub const DEPLOYMENT_FILE: &str = "deployment.json";
/// Seed written when a deployment directory is allocated.
pub const SEED_FILE: &str = "seed.json";
/// Rendered pod manifest.
pub const POD_MANIFEST_FILE: &str = "pod.yml";
/// Rendered config-map manifest.
pub const CONFIGMAP_FILE: &str = "configmap.yml";

/// A value in a service's `config` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    String(String),
    Bool(bool),
    Null,
    /// Numbers are carried as text.
    Number(String),
}

impl ConfigValue {
    /// Representation used in environments and templates.
    pub fn as_env(&self) -> String {
        match self {
            ConfigValue::String(s) | ConfigValue::Number(s) => s.clone(),
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::Null => String::new(),
        }
    }

    /// Parse a command-line value: `true`/`false`/`null`, numbers, else string.
    pub fn parse_cli(raw: &str) -> Self {
        match raw {
            "true" => ConfigValue::Bool(true),
            "false" => ConfigValue::Bool(false),
            "null" => ConfigValue::Null,
            _ if raw.parse::<serde_json::Number>().is_ok() => ConfigValue::Number(raw.to_string()),
            _ => ConfigValue::String(raw.to_string()),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Null => write!(f, "null"),
            other => write!(f, "{}", other.as_env()),
        }
    }
}

impl Serialize for ConfigValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConfigValue::String(s) => serializer.serialize_str(s),
            ConfigValue::Bool(b) => serializer.serialize_bool(*b),
            ConfigValue::Null => serializer.serialize_unit(),
            ConfigValue::Number(n) => match n.parse::<serde_json::Number>() {
                Ok(num) => num.serialize(serializer),
                Err(_) => serializer.serialize_str(n),
            },
        }
    }
}

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ConfigValueVisitor;

        impl<'de> Visitor<'de> for ConfigValueVisitor {
            type Value = ConfigValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string, boolean, number or null")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ConfigValue, E> {
                Ok(ConfigValue::String(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<ConfigValue, E> {
                Ok(ConfigValue::String(v))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<ConfigValue, E> {
                Ok(ConfigValue::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ConfigValue, E> {
                Ok(ConfigValue::Number(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ConfigValue, E> {
                Ok(ConfigValue::Number(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<ConfigValue, E> {
                Ok(ConfigValue::Number(v.to_string()))
            }

            fn visit_unit<E: de::Error>(self) -> Result<ConfigValue, E> {
                Ok(ConfigValue::Null)
            }

            fn visit_none<E: de::Error>(self) -> Result<ConfigValue, E> {
                Ok(ConfigValue::Null)
            }
        }

        deserializer.deserialize_any(ConfigValueVisitor)
    }
}

/// Lifecycle phase a hook runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPhase {
    PreStart,
    PostStart,
    PreStop,
    PostStop,
    PreStopService,
    PostStopService,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::PreStart => "pre-start",
            HookPhase::PostStart => "post-start",
            HookPhase::PreStop => "pre-stop",
            HookPhase::PostStop => "post-stop",
            HookPhase::PreStopService => "pre-stop-service",
            HookPhase::PostStopService => "post-stop-service",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accept `exec: ./run.sh` as well as `exec: [./run.sh, --flag]`.
fn string_or_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Exec {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Exec::deserialize(deserializer)? {
        Exec::One(s) => vec![s],
        Exec::Many(v) => v,
    })
}

/// External executable invoked at a lifecycle phase.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Hook {
    pub when: HookPhase,
    #[serde(deserialize_with = "string_or_list")]
    pub exec: Vec<String>,
}

/// One-shot request handler exposed through a socket unit.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Function {
    pub name: String,
    #[serde(deserialize_with = "string_or_list")]
    pub exec: Vec<String>,
    /// `name` or `name/authorization` entries.
    #[serde(default)]
    pub policies: Vec<String>,
}

/// A named pod of a multi-pod service.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PodPart {
    pub name: String,
    #[serde(default)]
    pub pod: Option<PathBuf>,
    #[serde(default)]
    pub proxy_config: Option<PathBuf>,
}

/// Extra column shown by `service ls`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Column {
    pub name: String,
    pub jsonpath: String,
}

/// Predicate on the host deciding whether a service activates here.
///
/// Every field that is set must hold.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Condition {
    pub hostname: Option<String>,
    pub exists: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Condition {
    pub fn holds(&self, host: &HostContext) -> bool {
        if let Some(hostname) = &self.hostname {
            if !hostname.eq_ignore_ascii_case(&host.hostname) {
                return false;
            }
        }
        if let Some(path) = &self.exists {
            if !path.exists() {
                return false;
            }
        }
        self.env
            .iter()
            .all(|(k, v)| host.env.get(k).map(|actual| actual == v).unwrap_or(false))
    }
}

/// Facts about the local host that conditions are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    pub hostname: String,
    pub env: HashMap<String, String>,
}

impl HostContext {
    pub fn current() -> Self {
        Self {
            hostname: hostname(),
            env: std::env::vars().collect(),
        }
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return String::new();
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Service document after inheritance, before defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServiceDocument {
    pub app: Option<String>,
    pub instance: Option<String>,
    pub config: BTreeMap<String, ConfigValue>,
    pub pod: Option<PathBuf>,
    pub proxy_config: Option<PathBuf>,
    pub service_proxy_config: Option<PathBuf>,
    pub hooks: Vec<Hook>,
    pub functions: Vec<Function>,
    pub pods: Vec<PodPart>,
    pub policies: Vec<String>,
    pub columns: Vec<Column>,
    pub conditions: Vec<Condition>,
}

/// A fully resolved service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Service {
    /// Canonical directory; the service's key.
    pub dir: PathBuf,
    /// Canonical path of the service document.
    pub file: PathBuf,
    /// Identity digest of the resolved document.
    pub id: String,
    pub app: String,
    pub instance: String,
    pub config: BTreeMap<String, ConfigValue>,
    pub pod: Option<PathBuf>,
    pub proxy_config: Option<PathBuf>,
    pub service_proxy_config: Option<PathBuf>,
    pub hooks: Vec<Hook>,
    pub functions: Vec<Function>,
    pub pods: Vec<PodPart>,
    pub policies: Vec<String>,
    pub columns: Vec<Column>,
    pub conditions: Vec<Condition>,
}

/// The slice of a service one deployment realizes.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub name: Option<String>,
    pub pod: Option<PathBuf>,
    pub proxy_config: Option<PathBuf>,
}

impl Service {
    /// `{app}-{instance}`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.app, self.instance)
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    /// Parts to deploy: one per entry of `pods`, or a single unnamed part.
    pub fn parts(&self) -> Vec<Part> {
        if self.pods.is_empty() {
            return vec![Part {
                name: None,
                pod: self.pod.clone(),
                proxy_config: self.proxy_config.clone(),
            }];
        }
        self.pods
            .iter()
            .map(|p| Part {
                name: Some(p.name.clone()),
                pod: p.pod.clone(),
                proxy_config: p.proxy_config.clone(),
            })
            .collect()
    }

    pub fn part(&self, name: Option<&str>) -> Option<Part> {
        self.parts().into_iter().find(|p| p.name.as_deref() == name)
    }

    pub fn hooks_for(&self, phase: HookPhase) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(move |h| h.when == phase)
    }

    /// Whether every condition holds on `host`.
    pub fn active_on(&self, host: &HostContext) -> bool {
        self.conditions.iter().all(|c| c.holds(host))
    }

    /// JSON record used by selectors and `service inspect`.
    pub fn to_record(&self) -> serde_json::Value {
        let mut record = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(map) = &mut record {
            map.insert("name".to_string(), serde_json::Value::String(self.name()));
        }
        record
    }
}

/// Origin of a deployment, written when its directory is allocated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Seed {
    pub service_dir: PathBuf,
    pub service_id: String,
    #[serde(default)]
    pub part: Option<String>,
}

/// The materialized state of one deployment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Deployment {
    pub name: String,
    pub service_dir: PathBuf,
    pub service_id: String,
    #[serde(default)]
    pub part: Option<String>,
    pub app: String,
    pub instance: String,
    #[serde(default)]
    pub pod_name: Option<String>,
    #[serde(default)]
    pub templated_pod: Option<String>,
    #[serde(default)]
    pub templated_config_map: Option<String>,
    #[serde(default)]
    pub templated_proxy_config: Option<String>,
    #[serde(default)]
    pub pod_ip: Option<String>,
}

impl Deployment {
    /// Fresh document for `name` realizing `part` of `service`.
    pub fn from_service(name: &str, service: &Service, part: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            service_dir: service.dir.clone(),
            service_id: service.id.clone(),
            part: part.map(str::to_string),
            app: service.app.clone(),
            instance: service.instance.clone(),
            pod_name: None,
            templated_pod: None,
            templated_config_map: None,
            templated_proxy_config: None,
            pod_ip: None,
        }
    }

    pub fn service_file(&self) -> PathBuf {
        self.service_dir.join(SERVICE_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_values_keep_their_kind() {
        let yaml = "a: text\nb: true\nc: null\nd: 1.50\ne: 42\n";
        let map: BTreeMap<String, ConfigValue> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(map["a"], ConfigValue::String("text".into()));
        assert_eq!(map["b"], ConfigValue::Bool(true));
        assert_eq!(map["c"], ConfigValue::Null);
        assert_eq!(map["e"], ConfigValue::Number("42".into()));
        assert_eq!(map["c"].as_env(), "");
        assert_eq!(map["b"].as_env(), "true");
    }

    #[test]
    fn config_values_reject_nested() {
        let res: Result<BTreeMap<String, ConfigValue>, _> = serde_yaml::from_str("a: [1, 2]\n");
        assert!(res.is_err());
    }

    #[test]
    fn cli_values_are_typed() {
        assert_eq!(ConfigValue::parse_cli("false"), ConfigValue::Bool(false));
        assert_eq!(ConfigValue::parse_cli("8080"), ConfigValue::Number("8080".into()));
        assert_eq!(ConfigValue::parse_cli("web"), ConfigValue::String("web".into()));
    }

    #[test]
    fn hook_exec_accepts_string_or_list() {
        let hooks: Vec<Hook> = serde_yaml::from_str(
            "- when: pre-start\n  exec: ./migrate.sh\n- when: post-stop\n  exec: [rm, -rf, cache]\n",
        )
        .unwrap();
        assert_eq!(hooks[0].exec, vec!["./migrate.sh"]);
        assert_eq!(hooks[1].when, HookPhase::PostStop);
        assert_eq!(hooks[1].exec.len(), 3);
    }

    #[test]
    fn conditions_require_every_field() {
        let host = HostContext {
            hostname: "edge-1".into(),
            env: [("ROLE".to_string(), "edge".to_string())].into_iter().collect(),
        };
        let cond = Condition {
            hostname: Some("EDGE-1".into()),
            exists: None,
            env: [("ROLE".to_string(), "edge".to_string())].into_iter().collect(),
        };
        assert!(cond.holds(&host));

        let cond = Condition {
            env: [("ROLE".to_string(), "core".to_string())].into_iter().collect(),
            ..cond
        };
        assert!(!cond.holds(&host));
    }
}
