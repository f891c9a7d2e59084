//! Service identity digest.
//!
//! SHA-256 over the canonical JSON of the resolved document. Path-typed
//! fields and path-like hook/function programs contribute the digest of the
//! file they point at, not the path, and display-only or host-only fields
//! are left out.

use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Top-level keys that never affect what a deployment runs.
const VOLATILE_KEYS: &[&str] = &["inherit", "columns", "conditions"];

/// Top-level keys holding template paths.
const PATH_KEYS: &[&str] = &["pod", "proxy-config", "service-proxy-config"];

/// Compute the identity digest of a resolved service document.
pub fn identity(document: &Value) -> String {
    let mut doc = document.clone();
    if let Value::Object(map) = &mut doc {
        for key in VOLATILE_KEYS {
            map.remove(*key);
        }
        for key in PATH_KEYS {
            if let Some(value) = map.get_mut(*key) {
                replace_path(value);
            }
        }
        if let Some(Value::Array(parts)) = map.get_mut("pods") {
            for part in parts.iter_mut().filter_map(Value::as_object_mut) {
                for key in ["pod", "proxy-config"] {
                    if let Some(value) = part.get_mut(key) {
                        replace_path(value);
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
                                replace_program(first);
                            }
                        }
                        single => replace_program(single),
                    }
                }
            }
        }
    }

    // serde_json maps are ordered by key, so this serialization is canonical
    let canonical = serde_json::to_vec(&doc).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

fn replace_path(value: &mut Value) {
    if let Value::String(path) = value {
        *value = Value::String(file_digest(Path::new(path.as_str())));
    }
}

/// Programs named by path are replaced by their content digest; bare names
/// and unreadable paths stay as written.
fn replace_program(value: &mut Value) {
    if let Value::String(program) = value {
        if !program.contains('/') {
            return;
        }
        if let Ok(bytes) = std::fs::read(program.as_str()) {
            *value = Value::String(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))));
        }
    }
}

/// `sha256:<hex>` of a file's content, or `absent`.
pub fn file_digest(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => format!("sha256:{}", hex::encode(Sha256::digest(&bytes))),
        Err(_) => "absent".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"app":"web","instance":"prod"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"instance":"prod","app":"web"}"#).unwrap();
        assert_eq!(identity(&a), identity(&b));
    }

    #[test]
    fn volatile_fields_are_ignored() {
        let a = json!({"app": "web", "columns": [{"name": "x", "jsonpath": "$.app"}]});
        let b = json!({"app": "web", "conditions": [{"hostname": "h"}]});
        assert_eq!(identity(&a), identity(&b));
    }

    #[test]
    fn template_content_not_path_decides() {
        let dir = tempfile::tempdir().unwrap();
        let one = dir.path().join("one.yml");
        let two = dir.path().join("two.yml");
        std::fs::write(&one, "kind: Pod\n").unwrap();
        std::fs::write(&two, "kind: Pod\n").unwrap();

        let a = json!({"pod": one.to_str().unwrap()});
        let b = json!({"pod": two.to_str().unwrap()});
        assert_eq!(identity(&a), identity(&b));

        std::fs::write(&two, "kind: Pod\nmetadata: {}\n").unwrap();
        assert_ne!(identity(&a), identity(&b));
    }

    #[test]
    fn moved_hook_program_keeps_identity() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        for dir in [old.path(), new.path()] {
            std::fs::write(dir.join("hook.sh"), "#!/bin/sh\necho up\n").unwrap();
        }
        let doc = |dir: &Path| {
            let program = dir.join("hook.sh").to_str().unwrap().to_string();
            json!({
                "hooks": [{"when": "pre-start", "exec": [program.clone(), "now"]}],
                "functions": [{"name": "f", "exec": program}],
            })
        };
        assert_eq!(identity(&doc(old.path())), identity(&doc(new.path())));

        std::fs::write(new.path().join("hook.sh"), "#!/bin/sh\necho down\n").unwrap();
        assert_ne!(identity(&doc(old.path())), identity(&doc(new.path())));

        let bare = |arg: &str| json!({"hooks": [{"when": "pre-start", "exec": ["true", arg]}]});
        assert_ne!(identity(&bare("a")), identity(&bare("b")));
    }

    #[test]
    fn config_changes_identity() {
        let a = json!({"app": "web", "config": {"PORT": "80"}});
        let b = json!({"app": "web", "config": {"PORT": "81"}});
        assert_ne!(identity(&a), identity(&b));
    }
}
