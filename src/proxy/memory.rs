//! In-memory proxy configuration store.
//!
//! Follows the admin API's semantics closely enough to exercise the
//! reconciler: per-path ETags, `id/<id>` lookups, POST appending to arrays.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::proxy::{write_outcome, Fetched, ProxyApi, ProxyError, WriteOutcome};

/// HTTP-shaped result of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryResponse {
    pub status: u16,
    pub body: Option<Value>,
    pub etag: Option<String>,
}

impl MemoryResponse {
    fn status(status: u16) -> Self {
        Self {
            status,
            body: None,
            etag: None,
        }
    }
}

/// One recorded write.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub method: &'static str,
    pub path: String,
    pub body: Option<Value>,
    pub status: u16,
}

#[derive(Debug, Default)]
struct Inner {
    root: Value,
    log: Vec<Operation>,
    injected_conflicts: u32,
}

/// Proxy configuration held in process.
#[derive(Debug)]
pub struct MemoryProxy {
    inner: Mutex<Inner>,
}

impl Default for MemoryProxy {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl MemoryProxy {
    pub fn new(root: Value) -> Self {
        Self {
            inner: Mutex::new(Inner {
                root,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The whole configuration.
    pub fn snapshot(&self) -> Value {
        self.lock().root.clone()
    }

    /// Writes performed so far, in order.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().log.clone()
    }

    /// Answer the next `n` conditional writes with 412.
    pub fn inject_conflicts(&self, n: u32) {
        self.lock().injected_conflicts = n;
    }

    /// Handle one request. `path` is `config/...` or `id/...`.
    pub fn handle(
        &self,
        method: &'static str,
        path: &str,
        if_match: Option<&str>,
        body: Option<Value>,
    ) -> MemoryResponse {
        let mut inner = self.lock();
        let Some(pointer) = resolve(&inner.root, path) else {
            return MemoryResponse::status(404);
        };

        if method == "GET" {
            return match inner.root.pointer(&pointer) {
                Some(value) => MemoryResponse {
                    status: 200,
                    etag: Some(etag(path, value)),
                    body: Some(value.clone()),
                },
                None => MemoryResponse::status(404),
            };
        }

        if let Some(expected) = if_match {
            let current = inner.root.pointer(&pointer).unwrap_or(&Value::Null);
            let conflict = expected != etag(path, current) || inner.injected_conflicts > 0;
            if conflict {
                inner.injected_conflicts = inner.injected_conflicts.saturating_sub(1);
                return record(&mut inner, method, path, body, 412);
            }
        }

        let status = match method {
            "POST" => post(&mut inner.root, &pointer, body.clone().unwrap_or(Value::Null)),
            "PATCH" => match inner.root.pointer_mut(&pointer) {
                Some(slot) => {
                    *slot = body.clone().unwrap_or(Value::Null);
                    200
                }
                None => 404,
            },
            "DELETE" => delete(&mut inner.root, &pointer),
            _ => 405,
        };
        record(&mut inner, method, path, body, status)
    }
}

fn record(
    inner: &mut Inner,
    method: &'static str,
    path: &str,
    body: Option<Value>,
    status: u16,
) -> MemoryResponse {
    inner.log.push(Operation {
        method,
        path: path.to_string(),
        body,
        status,
    });
    MemoryResponse::status(status)
}

/// Quoted `"<path> <sha256>"` over the value's JSON.
fn etag(path: &str, value: &Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    format!("\"/{} {}\"", path.trim_start_matches('/'), hex::encode(digest))
}

/// Translate an API path to a JSON pointer into the root.
fn resolve(root: &Value, path: &str) -> Option<String> {
    let mut segments = path.trim_matches('/').split('/');
    let base = match segments.next()? {
        "config" => String::new(),
        "id" => find_id(root, segments.next()?, String::new())?,
        _ => return None,
    };
    let rest: Vec<String> = segments
        .filter(|s| !s.is_empty())
        .map(|s| s.replace('~', "~0").replace('/', "~1"))
        .collect();
    if rest.is_empty() {
        Some(base)
    } else {
        Some(format!("{base}/{}", rest.join("/")))
    }
}

fn find_id(value: &Value, id: &str, at: String) -> Option<String> {
    match value {
        Value::Object(map) => {
            if map.get("@id").and_then(Value::as_str) == Some(id) {
                return Some(at);
            }
            map.iter().find_map(|(k, v)| {
                find_id(v, id, format!("{at}/{}", k.replace('~', "~0").replace('/', "~1")))
            })
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, v)| find_id(v, id, format!("{at}/{i}"))),
        _ => None,
    }
}

fn split_pointer(pointer: &str) -> Option<(&str, String)> {
    let (parent, key) = pointer.rsplit_once('/')?;
    Some((parent, key.replace("~1", "/").replace("~0", "~")))
}

/// POST appends to arrays and sets anything else, creating missing parents.
fn post(root: &mut Value, pointer: &str, body: Value) -> u16 {
    if let Some(target) = root.pointer_mut(pointer) {
        match target {
            Value::Array(items) => items.push(body),
            other => *other = body,
        }
        return 200;
    }
    let Some((parent, key)) = split_pointer(pointer) else {
        *root = body;
        return 200;
    };
    if root.pointer(parent).is_none() && post(root, parent, Value::Object(Map::new())) != 200 {
        return 400;
    }
    match root.pointer_mut(parent) {
        Some(Value::Object(map)) => {
            map.insert(key, body);
            200
        }
        _ => 400,
    }
}

fn delete(root: &mut Value, pointer: &str) -> u16 {
    let Some((parent, key)) = split_pointer(pointer) else {
        *root = Value::Object(Map::new());
        return 200;
    };
    match root.pointer_mut(parent) {
        Some(Value::Object(map)) => {
            if map.remove(&key).is_some() {
                200
            } else {
                404
            }
        }
        Some(Value::Array(items)) => match key.parse::<usize>() {
            Ok(i) if i < items.len() => {
                items.remove(i);
                200
            }
            _ => 404,
        },
        _ => 404,
    }
}

#[async_trait]
impl ProxyApi for MemoryProxy {
    async fn get(&self, path: &str) -> Result<Fetched, ProxyError> {
        let resp = self.handle("GET", path, None, None);
        if resp.status == 404 {
            return Ok(Fetched::absent());
        }
        let body = resp.body.unwrap_or(Value::Null);
        Ok(Fetched {
            present: !body.is_null(),
            body,
            etag: resp.etag,
        })
    }

    async fn post(
        &self,
        etag: Option<&str>,
        path: &str,
        body: &Value,
    ) -> Result<WriteOutcome, ProxyError> {
        let resp = self.handle("POST", path, etag, Some(body.clone()));
        write_outcome("POST", path, resp.status, String::new)
    }

    async fn patch(
        &self,
        etag: Option<&str>,
        path: &str,
        body: &Value,
    ) -> Result<WriteOutcome, ProxyError> {
        let resp = self.handle("PATCH", path, etag, Some(body.clone()));
        write_outcome("PATCH", path, resp.status, String::new)
    }

    async fn delete(&self, etag: Option<&str>, path: &str) -> Result<WriteOutcome, ProxyError> {
        let resp = self.handle("DELETE", path, etag, None);
        write_outcome("DELETE", path, resp.status, String::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn post_creates_and_appends() {
        let proxy = MemoryProxy::default();
        assert_eq!(proxy.handle("POST", "config/apps/http/upstreams", None, Some(json!(["a"]))).status, 200);
        assert_eq!(proxy.handle("POST", "config/apps/http/upstreams", None, Some(json!("b"))).status, 200);
        assert_eq!(proxy.snapshot(), json!({"apps": {"http": {"upstreams": ["a", "b"]}}}));
    }

    #[test]
    fn ids_resolve_anywhere() {
        let proxy = MemoryProxy::new(json!({"apps": {"routes": [{"@id": "web", "to": 1}]}}));
        let got = proxy.handle("GET", "id/web/to", None, None);
        assert_eq!(got.body, Some(json!(1)));
        assert_eq!(proxy.handle("DELETE", "id/web", None, None).status, 200);
        assert_eq!(proxy.snapshot(), json!({"apps": {"routes": []}}));
        assert_eq!(proxy.handle("GET", "id/web", None, None).status, 404);
    }

    #[test]
    fn stale_etag_conflicts() {
        let proxy = MemoryProxy::new(json!({"list": []}));
        let etag = proxy.handle("GET", "config/list", None, None).etag.unwrap();
        assert_eq!(proxy.handle("POST", "config/list", Some(&etag), Some(json!(1))).status, 200);
        assert_eq!(proxy.handle("POST", "config/list", Some(&etag), Some(json!(2))).status, 412);
        assert_eq!(proxy.snapshot(), json!({"list": [1]}));
    }

    #[test]
    fn injected_conflicts_are_consumed() {
        let proxy = MemoryProxy::new(json!({"list": []}));
        proxy.inject_conflicts(1);
        let etag = proxy.handle("GET", "config/list", None, None).etag.unwrap();
        assert_eq!(proxy.handle("POST", "config/list", Some(&etag), Some(json!(1))).status, 412);
        assert_eq!(proxy.handle("POST", "config/list", Some(&etag), Some(json!(1))).status, 200);
    }
}
