//! Socket-activated CGI server for a deployment's functions.
//!
//! Every request is checked against the function's policies, then handed
//! to the function's executable with CGI/1.1 variables in the environment
//! and the request body on stdin. The executable's output is parsed as a
//! CGI response.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;

use crate::config::schema::Function;
use crate::config::store::load_policies;
use crate::config::{ConfigStore, DeploymentFilter};
use crate::deployment::env::{function_vars, Vars};
use crate::error::{Error, Result};
use crate::http::request::with_request_tracing;
use crate::observability::metrics;
use crate::policy::{MatchContext, PolicyRef, PolicySet, RequestContext};
use crate::runtime::process::{self, CommandSpec, ProcessError};

/// Largest request body handed to a function.
pub const MAX_BODY: usize = 16 * 1024 * 1024;

/// Everything needed to serve one function.
#[derive(Debug, Clone)]
pub struct FunctionTarget {
    pub deployment: String,
    pub dir: PathBuf,
    pub function: Function,
    pub vars: Vars,
    pub policies: Vec<PolicyRef>,
}

/// Find the function behind `<deployment>-<function>`.
pub fn resolve(store: &ConfigStore, id: &str) -> Result<FunctionTarget> {
    for entry in store.list_deployments(&DeploymentFilter::default())? {
        let Some(name) = id
            .strip_prefix(entry.name.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
        else {
            continue;
        };
        let deployment = store.load_deployment(&entry.dir)?;
        let service = store.load_service(&deployment.service_dir)?;
        let Some(function) = service.functions.iter().find(|f| f.name == name) else {
            continue;
        };
        let vars = function_vars(&service, &deployment, &entry.dir, function);
        let policies = vars
            .get("CONDUCTOR_FUNCTION_POLICIES")
            .map(|p| p.split_whitespace().map(PolicyRef::parse).collect())
            .unwrap_or_default();
        return Ok(FunctionTarget {
            deployment: deployment.name,
            dir: entry.dir,
            function: function.clone(),
            vars,
            policies,
        });
    }
    Err(Error::UnknownFunction(id.to_string()))
}

#[derive(Clone)]
struct FunctionState {
    target: Arc<FunctionTarget>,
    policies: Arc<PolicySet>,
    timeout: Duration,
    term_grace: Duration,
}

/// Router answering every path and method with the function.
pub fn router(target: FunctionTarget, store: &ConfigStore) -> Result<Router> {
    let policies = load_policies(&store.env().policies_dir())?;
    let state = FunctionState {
        target: Arc::new(target),
        policies: Arc::new(policies),
        timeout: store.env().hook_timeout(),
        term_grace: store.env().term_grace(),
    };
    Ok(with_request_tracing(
        Router::new().fallback(handle).with_state(state),
    ))
}

/// Outcome of the policy check: `policy/authorization` tuples and meta.
type Grant = (Vec<String>, BTreeMap<String, String>);

fn authorize(state: &FunctionState, parts: &Parts) -> Option<Grant> {
    let request = RequestContext::from_headers(&parts.headers);
    let ctx = MatchContext::new(&state.policies, &request);
    let mut authorizations = Vec::new();
    let mut meta = BTreeMap::new();
    for reference in &state.target.policies {
        let decision = ctx.decide(reference);
        metrics::record_policy_decision(&reference.name, decision.matched);
        if !decision.matched {
            tracing::info!(policy = %reference.name, function = %state.target.function.name, "Policy denied");
            return None;
        }
        authorizations.push(format!("{}/{}", reference.name, decision.authorization));
        meta.extend(decision.meta);
    }
    Some((authorizations, meta))
}

async fn handle(State(state): State<FunctionState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let Some(grant) = authorize(&state, &parts) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let body = match to_bytes(body, MAX_BODY).await {
        Ok(body) => body,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };

    let target = &state.target;
    let Some((program, args)) = target.function.exec.split_first() else {
        tracing::error!(function = %target.function.name, "Function has no command");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let spec = CommandSpec::new(program.as_str())
        .args(args.iter().cloned())
        .envs(target.vars.iter().map(|(k, v)| (k.clone(), v.clone())))
        .envs(cgi_env(&parts, &body, &grant))
        .stdin(body.to_vec())
        .cwd(&target.dir)
        .timeout(state.timeout)
        .term_grace(state.term_grace);

    match process::run(&spec, None).await {
        Ok(output) => parse_response(&output.stdout).unwrap_or_else(|e| {
            tracing::error!(function = %target.function.name, error = %e, "Malformed CGI response");
            StatusCode::BAD_GATEWAY.into_response()
        }),
        Err(ProcessError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT.into_response(),
        Err(e) => {
            tracing::error!(function = %target.function.name, error = %e, "Function failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// CGI/1.1 meta-variables for a request.
fn cgi_env(parts: &Parts, body: &Bytes, grant: &Grant) -> Vec<(String, String)> {
    let mut env = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_PROTOCOL".to_string(), format!("{:?}", parts.version)),
        ("REQUEST_METHOD".to_string(), parts.method.to_string()),
        ("REQUEST_URI".to_string(), parts.uri.to_string()),
        ("SCRIPT_NAME".to_string(), String::new()),
        ("PATH_INFO".to_string(), parts.uri.path().to_string()),
        ("QUERY_STRING".to_string(), parts.uri.query().unwrap_or("").to_string()),
        ("CONTENT_LENGTH".to_string(), body.len().to_string()),
    ];
    if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        env.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
    }
    for (name, value) in &parts.headers {
        if name == header::AUTHORIZATION || name == header::CONTENT_TYPE || name == header::CONTENT_LENGTH {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        let key = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
        env.push((key, value.to_string()));
    }

    let (authorizations, meta) = grant;
    env.push(("CONDUCTOR_AUTHORIZATION".to_string(), authorizations.join(" ")));
    for (key, value) in meta {
        let key = key.to_ascii_uppercase().replace('-', "_");
        env.push((format!("CONDUCTOR_META_{key}"), value.clone()));
    }
    env
}

/// Parse CGI output: header lines, a blank line, then the body.
///
/// `Status:` sets the code only when it parses; `Location:` without a
/// status is a 302.
pub fn parse_response(output: &[u8]) -> std::result::Result<Response, String> {
    let (head, body) = split_head(output);
    let head = std::str::from_utf8(head).map_err(|_| "headers are not UTF-8".to_string())?;

    let mut status = None;
    let mut headers = axum::http::HeaderMap::new();
    for line in head.lines().map(|l| l.trim_end_matches('\r')).filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("invalid header line '{line}'"))?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().unwrap_or("");
            match code.parse::<u16>().ok().and_then(|c| StatusCode::from_u16(c).ok()) {
                Some(code) => status = Some(code),
                None => tracing::warn!(status = %value, "Ignoring unparsable CGI status"),
            }
            continue;
        }
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| format!("invalid header name '{name}'"))?;
        let value = HeaderValue::from_str(value).map_err(|_| format!("invalid value for {name}"))?;
        headers.append(name, value);
    }

    let status = status.unwrap_or(if headers.contains_key(header::LOCATION) {
        StatusCode::FOUND
    } else {
        StatusCode::OK
    });
    let mut response = Response::new(Body::from(body.to_vec()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn split_head(output: &[u8]) -> (&[u8], &[u8]) {
    let crlf = output.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    let lf = output.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    match split {
        Some((at, len)) => (&output[..at], &output[at + len..]),
        None => (output, &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn parses_status_and_headers() {
        let response =
            parse_response(b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nmissing").unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(body_of(response).await, "missing");
    }

    #[tokio::test]
    async fn bad_status_keeps_default() {
        let response = parse_response(b"Status: teapot\n\nhi").unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "hi");
    }

    #[test]
    fn location_implies_redirect() {
        let response = parse_response(b"Location: /elsewhere\n\n").unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[test]
    fn rejects_garbage_headers() {
        assert!(parse_response(b"no colon here\n\nbody").is_err());
    }

    #[test]
    fn cgi_variables() {
        let (parts, _) = axum::http::Request::builder()
            .method("POST")
            .uri("/greet?name=ada")
            .header("content-type", "text/plain")
            .header("x-trace", "abc")
            .header("authorization", "Bearer secret")
            .body(())
            .unwrap()
            .into_parts();
        let grant = (
            vec!["api/read".to_string()],
            [("peer".to_string(), "edge".to_string())].into_iter().collect(),
        );
        let env: BTreeMap<String, String> = cgi_env(&parts, &Bytes::from_static(b"hey"), &grant)
            .into_iter()
            .collect();
        assert_eq!(env["REQUEST_METHOD"], "POST");
        assert_eq!(env["PATH_INFO"], "/greet");
        assert_eq!(env["QUERY_STRING"], "name=ada");
        assert_eq!(env["CONTENT_LENGTH"], "3");
        assert_eq!(env["CONTENT_TYPE"], "text/plain");
        assert_eq!(env["HTTP_X_TRACE"], "abc");
        assert!(!env.contains_key("HTTP_AUTHORIZATION"));
        assert_eq!(env["CONDUCTOR_AUTHORIZATION"], "api/read");
        assert_eq!(env["CONDUCTOR_META_PEER"], "edge");
    }
}
