//! HTTP handler of the authorization sidecar.

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};

use crate::http::request::with_request_tracing;
use crate::observability::metrics;
use crate::policy::matcher::{MatchContext, RequestContext};
use crate::policy::types::{PolicyRef, PolicySet};
use crate::policy::PolicyError;

/// Request header naming the policies to check. May repeat.
pub const POLICY_HEADER: &str = "conductor-policy";
/// Response header carrying `policy/authorization` per matched policy.
pub const AUTHORIZATION_HEADER: &str = "conductor-authorization";
/// Prefix of response headers carrying meta tags.
pub const META_HEADER_PREFIX: &str = "conductor-meta-";

/// Sidecar state injected into handlers.
#[derive(Clone)]
pub struct SidecarState {
    pub policies: Arc<ArcSwap<PolicySet>>,
}

/// Build the sidecar router.
pub fn router(state: SidecarState) -> Router {
    with_request_tracing(Router::new().route("/", post(check_handler)).with_state(state))
}

async fn check_handler(State(state): State<SidecarState>, headers: HeaderMap) -> Response {
    let policies = state.policies.load();
    match check(&policies, &headers) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Policy check failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// References named by the request, in header order.
pub fn policy_refs(headers: &HeaderMap) -> Vec<PolicyRef> {
    headers
        .get_all(POLICY_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PolicyRef::parse)
        .collect()
}

/// Evaluate every referenced policy. All must match for a 204.
pub fn check(policies: &PolicySet, headers: &HeaderMap) -> Result<Response, PolicyError> {
    let refs = policy_refs(headers);
    if refs.is_empty() {
        tracing::debug!("Request names no policy");
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    }

    let request = RequestContext::from_headers(headers);
    let ctx = MatchContext::new(policies, &request);
    let mut out = HeaderMap::new();

    for reference in &refs {
        let decision = ctx.decide(reference);
        metrics::record_policy_decision(&reference.name, decision.matched);
        if !decision.matched {
            tracing::info!(policy = %reference.name, authorization = %reference.authorization, "Policy denied");
            return Ok(StatusCode::UNAUTHORIZED.into_response());
        }
        tracing::debug!(
            policy = %reference.name,
            leaf = %decision.leaf,
            authorization = %decision.authorization,
            "Policy matched"
        );

        let value = format!("{}/{}", reference.name, decision.authorization);
        out.append(AUTHORIZATION_HEADER, header_value(&value)?);
        for (key, value) in &decision.meta {
            let name = HeaderName::from_bytes(format!("{META_HEADER_PREFIX}{key}").as_bytes())
                .map_err(|_| PolicyError::Header(key.clone()))?;
            out.insert(name, header_value(value)?);
        }
    }

    Ok((StatusCode::NO_CONTENT, out).into_response())
}

fn header_value(value: &str) -> Result<HeaderValue, PolicyError> {
    HeaderValue::from_str(value).map_err(|_| PolicyError::Header(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::Policy;

    fn set(docs: &[&str]) -> PolicySet {
        docs.iter()
            .map(|d| {
                let p: Policy = serde_yaml::from_str(d).unwrap();
                (p.name.clone(), p)
            })
            .collect()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(HeaderName::from_bytes(k.as_bytes()).unwrap(), v.parse().unwrap());
        }
        h
    }

    #[test]
    fn no_policy_header_is_unauthorized() {
        let resp = check(&set(&[]), &headers(&[("authorization", "Bearer T")])).unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn all_listed_policies_must_match() {
        let policies = set(&[
            "name: a\nbearer: [{token: T}]\nmeta: {team: core}\n",
            "name: b\norigin: [https://x.example]\n",
        ]);
        let ok = check(
            &policies,
            &headers(&[
                ("conductor-policy", "a/read"),
                ("conductor-policy", "b/read"),
                ("authorization", "Bearer T"),
                ("origin", "https://x.example"),
            ]),
        )
        .unwrap();
        assert_eq!(ok.status(), StatusCode::NO_CONTENT);
        let authz: Vec<_> = ok.headers().get_all(AUTHORIZATION_HEADER).iter().collect();
        assert_eq!(authz, vec!["a/read", "b/read"]);
        assert_eq!(ok.headers()["conductor-meta-team"], "core");

        let denied = check(
            &policies,
            &headers(&[("conductor-policy", "a/read, b/read"), ("authorization", "Bearer T")]),
        )
        .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn unusable_meta_key_is_internal_error() {
        let policies = set(&["name: a\nalways: true\nmeta: {'bad key': x}\n"]);
        let err = check(&policies, &headers(&[("conductor-policy", "a/read")])).unwrap_err();
        assert!(matches!(err, PolicyError::Header(_)));
    }
}
