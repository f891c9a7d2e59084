//! Reverse-proxy configuration subsystem.
//!
//! # Data Flow
//! ```text
//! rendered proxy-config ([{mount, config, register_only}])
//!     → item.rs (classify: aggregate @id object or scalar)
//!     → reconciler.rs (ordered register / reversed deregister)
//!     → ProxyApi (GET → PATCH/POST/DELETE with If-Match)
//!         → client.rs (HTTP admin API)
//!         → memory.rs (in-process store for tests)
//!     ← 412 → retry with backoff
//! ```
//!
//! # Design Decisions
//! - Optimistic concurrency via ETags; contention is expected
//! - Every operation is idempotent per item
//! - Only 412 is retried; any other failure is fatal

pub mod client;
pub mod item;
pub mod memory;
pub mod reconciler;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use client::ProxyClient;
pub use item::{ItemKind, ProxyConfigItem};
pub use memory::MemoryProxy;
pub use reconciler::Reconciler;

/// Errors raised talking to the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid proxy endpoint '{0}'")]
    Endpoint(String),

    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },

    #[error("invalid JSON at {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid item at {mount}: {reason}")]
    InvalidItem { mount: String, reason: String },

    #[error("{path} is not an array")]
    NotAnArray { path: String },

    #[error("gave up on {path} after {attempts} conflicting attempts")]
    TooManyConflicts { path: String, attempts: u32 },
}

/// Result of a GET.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub body: Value,
    pub present: bool,
    pub etag: Option<String>,
}

impl Fetched {
    pub fn absent() -> Self {
        Self {
            body: Value::Null,
            present: false,
            etag: None,
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// `If-Match` did not hold; re-read and retry.
    Conflict,
}

/// The proxy's JSON configuration API.
///
/// Paths are relative to the endpoint: `config/<mount>` or `id/<id>`.
#[async_trait]
pub trait ProxyApi: Send + Sync {
    async fn get(&self, path: &str) -> Result<Fetched, ProxyError>;

    async fn post(&self, etag: Option<&str>, path: &str, body: &Value)
        -> Result<WriteOutcome, ProxyError>;

    async fn patch(&self, etag: Option<&str>, path: &str, body: &Value)
        -> Result<WriteOutcome, ProxyError>;

    async fn delete(&self, etag: Option<&str>, path: &str) -> Result<WriteOutcome, ProxyError>;
}

/// Map a write response status.
pub(crate) fn write_outcome(
    method: &'static str,
    path: &str,
    status: u16,
    body: impl FnOnce() -> String,
) -> Result<WriteOutcome, ProxyError> {
    match status {
        200..=299 => Ok(WriteOutcome::Applied),
        412 => Ok(WriteOutcome::Conflict),
        _ => Err(ProxyError::Status {
            method,
            path: path.to_string(),
            status,
            body: body(),
        }),
    }
}
