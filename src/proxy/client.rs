//! HTTP client for the proxy admin API.
//!
//! # Responsibilities
//! - ETag-aware GET/POST/PATCH/DELETE against `<endpoint>/<path>`
//! - Send `If-Match` on every write whose ETag is known
//! - Map 404 on GET to absence and 412 on writes to a conflict

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, ETAG, IF_MATCH};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use url::Url;

use crate::observability::metrics;
use crate::proxy::{write_outcome, Fetched, ProxyApi, ProxyError, WriteOutcome};

/// Client keyed by the admin endpoint URL.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    base: Url,
    http: reqwest::Client,
}

impl ProxyClient {
    pub fn new(endpoint: &str) -> Result<Self, ProxyError> {
        let mut base =
            Url::parse(endpoint).map_err(|_| ProxyError::Endpoint(endpoint.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .no_proxy()
            .build()?;
        Ok(Self { base, http })
    }

    fn url(&self, path: &str) -> Result<Url, ProxyError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|_| ProxyError::Endpoint(format!("{}{}", self.base, path)))
    }

    async fn write(
        &self,
        method: Method,
        label: &'static str,
        etag: Option<&str>,
        path: &str,
        body: Option<&Value>,
    ) -> Result<WriteOutcome, ProxyError> {
        let mut request = self.http.request(method, self.url(path)?);
        if let Some(etag) = etag {
            request = request.header(IF_MATCH, etag);
        }
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, "application/json").json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        metrics::record_proxy_request(label, status.as_u16());
        tracing::debug!(method = label, path = %path, status = status.as_u16(), "Proxy write");

        let text = if status.is_success() || status == StatusCode::PRECONDITION_FAILED {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        write_outcome(label, path, status.as_u16(), || text.trim().to_string())
    }
}

#[async_trait]
impl ProxyApi for ProxyClient {
    async fn get(&self, path: &str) -> Result<Fetched, ProxyError> {
        let response = self.http.get(self.url(path)?).send().await?;
        let status = response.status();
        metrics::record_proxy_request("GET", status.as_u16());

        if status == StatusCode::NOT_FOUND {
            return Ok(Fetched::absent());
        }
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ProxyError::Status {
                method: "GET",
                path: path.to_string(),
                status: status.as_u16(),
                body: text.trim().to_string(),
            });
        }

        let body: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|source| ProxyError::Decode {
                path: path.to_string(),
                source,
            })?
        };
        // The admin API answers `null` for a missing key below an existing object.
        let present = !body.is_null();
        Ok(Fetched {
            body,
            present,
            etag,
        })
    }

    async fn post(
        &self,
        etag: Option<&str>,
        path: &str,
        body: &Value,
    ) -> Result<WriteOutcome, ProxyError> {
        self.write(Method::POST, "POST", etag, path, Some(body)).await
    }

    async fn patch(
        &self,
        etag: Option<&str>,
        path: &str,
        body: &Value,
    ) -> Result<WriteOutcome, ProxyError> {
        self.write(Method::PATCH, "PATCH", etag, path, Some(body)).await
    }

    async fn delete(&self, etag: Option<&str>, path: &str) -> Result<WriteOutcome, ProxyError> {
        self.write(Method::DELETE, "DELETE", etag, path, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_below_endpoint() {
        let client = ProxyClient::new("http://localhost:2019").unwrap();
        assert_eq!(
            client.url("config/apps/http").unwrap().as_str(),
            "http://localhost:2019/config/apps/http"
        );
        let client = ProxyClient::new("http://127.0.0.1:9/admin").unwrap();
        assert_eq!(client.url("/id/web").unwrap().as_str(), "http://127.0.0.1:9/admin/id/web");
    }

    #[test]
    fn rejects_bad_endpoint() {
        assert!(matches!(ProxyClient::new("not a url"), Err(ProxyError::Endpoint(_))));
    }
}
