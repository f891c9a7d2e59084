//! Proxy configuration items.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::proxy::ProxyError;

/// One snippet to register with the proxy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProxyConfigItem {
    /// Path below the config root, or `id/<id>`.
    pub mount: String,
    pub config: Value,
    /// Scalars only: add on register, leave in place on deregister.
    #[serde(default)]
    pub register_only: bool,
}

/// Shape of an item's config.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    /// Object identified by `@id`, replaced as a unit.
    Aggregate { id: String },
    /// Member of the array at the mount point.
    Scalar,
}

impl ProxyConfigItem {
    pub fn kind(&self) -> Result<ItemKind, ProxyError> {
        let invalid = |reason: &str| ProxyError::InvalidItem {
            mount: self.mount.clone(),
            reason: reason.to_string(),
        };
        let kind = match &self.config {
            Value::Object(map) => match map.get("@id") {
                Some(Value::String(id)) if !id.is_empty() => ItemKind::Aggregate { id: id.clone() },
                _ => return Err(invalid("object config needs a non-empty string @id")),
            },
            Value::String(_) | Value::Number(_) | Value::Bool(_) => ItemKind::Scalar,
            Value::Array(_) => return Err(invalid("arrays are not registrable")),
            Value::Null => return Err(invalid("null is not registrable")),
        };
        if self.register_only && kind != ItemKind::Scalar {
            return Err(invalid("register_only is only valid for scalar items"));
        }
        Ok(kind)
    }

    /// API path of the mount point.
    pub fn mount_path(&self) -> String {
        mount_path(&self.mount)
    }
}

/// `id/...` paths are used as they are; everything else lives below `config/`.
pub fn mount_path(mount: &str) -> String {
    let mount = mount.trim_matches('/');
    if mount.starts_with("id/") || mount.starts_with("config/") {
        mount.to_string()
    } else {
        format!("config/{mount}")
    }
}

pub fn id_path(id: &str) -> String {
    format!("id/{id}")
}

/// Parse a rendered proxy-config document: a JSON array of items.
pub fn parse_items(text: &str) -> Result<Vec<ProxyConfigItem>, ProxyError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(text).map_err(|source| ProxyError::Decode {
        path: "proxy-config".to_string(),
        source,
    })
}
