//! Service selection for listings.
//!
//! # Data Flow
//! ```text
//! Service → record() (flat attributes) → Selector (key<op>=value flags)
//!         → to_record() (full JSON)     → Bracket (stop/resume JSONPath)
//! ```
//!
//! JSONPath conditions are evaluated against a one-element array holding
//! the document, so `$[?@.app == 'web']` tests the document itself. A
//! condition holds when it selects at least one node and none of the
//! selected nodes is `false` or `null`.

pub mod bracket;
pub mod filter;

use std::collections::BTreeMap;

use serde_json::Value;
use serde_json_path::JsonPath;
use thiserror::Error;

use crate::config::Service;

pub use bracket::Bracket;
pub use filter::{Filter, Selector};

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("invalid filter '{0}': expected key[op]=value")]
    Syntax(String),

    #[error("invalid regex '{pattern}': {reason}")]
    Regex { pattern: String, reason: String },

    #[error("invalid JSONPath '{path}': {reason}")]
    JsonPath { path: String, reason: String },
}

/// Whether `path` holds for `doc`.
pub fn path_holds(path: &JsonPath, doc: &Value) -> bool {
    let wrapped = Value::Array(vec![doc.clone()]);
    let nodes = path.query(&wrapped).all();
    !nodes.is_empty() && nodes.iter().all(|v| !matches!(v, Value::Bool(false) | Value::Null))
}

/// Flat attributes of a service: `name, app, instance, dir, id, config.*`.
pub fn record(service: &Service) -> BTreeMap<String, String> {
    let mut record = BTreeMap::from([
        ("name".to_string(), service.name()),
        ("app".to_string(), service.app.clone()),
        ("instance".to_string(), service.instance.clone()),
        ("dir".to_string(), service.dir.display().to_string()),
        ("id".to_string(), service.id.clone()),
    ]);
    for (key, value) in &service.config {
        record.insert(format!("config.{key}"), value.as_env());
    }
    record
}

/// Services passing `selector`, then cut down by `bracket`.
pub fn select(services: Vec<Service>, selector: &Selector, bracket: &Bracket) -> Vec<Service> {
    let selected = services
        .into_iter()
        .filter(|s| selector.matches(&record(s)))
        .collect();
    bracket.apply(selected, Service::to_record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness() {
        let doc = json!({"ok": true, "off": false, "none": null, "n": 0});
        let holds = |p: &str| path_holds(&JsonPath::parse(p).unwrap(), &doc);
        assert!(holds("$[?@.ok == true]"));
        assert!(holds("$[0].ok"));
        assert!(holds("$[0].n"));
        assert!(!holds("$[0].off"));
        assert!(!holds("$[0].none"));
        assert!(!holds("$[0].absent"));
    }
}
