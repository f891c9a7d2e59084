//! Matcher evaluation.
//!
//! A node counts the sub-predicates it defines and fails on the first one
//! that does not hold. A node with nothing defined never matches.

use std::collections::BTreeMap;

use axum::http::{header, HeaderMap};

use crate::policy::jwt;
use crate::policy::types::{Bearer, Matcher, PolicyRef, PolicySet};

/// The parts of an HTTP request matchers look at.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Tokens of every `Authorization: Bearer` header, in order.
    pub bearer_tokens: Vec<String>,
    pub origin: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let bearer_tokens = headers
            .get_all(header::AUTHORIZATION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| {
                let (scheme, token) = v.trim().split_once(' ')?;
                scheme
                    .eq_ignore_ascii_case("bearer")
                    .then(|| token.trim().to_string())
            })
            .filter(|t| !t.is_empty())
            .collect();
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Self {
            bearer_tokens,
            origin,
        }
    }
}

/// Everything a match runs against.
pub struct MatchContext<'a> {
    pub policies: &'a PolicySet,
    pub request: &'a RequestContext,
}

/// Result of evaluating a policy reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub matched: bool,
    /// Authorization after every transform on the matching path.
    pub authorization: String,
    /// Innermost policy reached through `policy` references.
    pub leaf: String,
    pub meta: BTreeMap<String, String>,
}

impl<'a> MatchContext<'a> {
    pub fn new(policies: &'a PolicySet, request: &'a RequestContext) -> Self {
        Self { policies, request }
    }

    /// Evaluate the referenced policy.
    ///
    /// A match that ends with an empty authorization is denied.
    pub fn decide(&self, reference: &PolicyRef) -> Decision {
        let mut authorization = reference.authorization.clone();
        let mut meta = BTreeMap::new();
        let mut leaf = reference.name.clone();
        let mut visiting = Vec::new();
        let matched = self.match_policy(
            &reference.name,
            &mut authorization,
            &mut leaf,
            &mut meta,
            &mut visiting,
        ) && !authorization.is_empty();

        if !matched {
            meta.clear();
        }
        Decision {
            matched,
            authorization,
            leaf,
            meta,
        }
    }

    fn match_policy(
        &self,
        name: &str,
        authorization: &mut String,
        leaf: &mut String,
        meta: &mut BTreeMap<String, String>,
        visiting: &mut Vec<String>,
    ) -> bool {
        if visiting.iter().any(|v| v == name) {
            tracing::warn!(policy = %name, "Policy reference cycle");
            return false;
        }
        let Some(policy) = self.policies.get(name) else {
            tracing::debug!(policy = %name, "Unknown policy");
            return false;
        };
        visiting.push(name.to_string());
        *leaf = name.to_string();
        let matched = self.match_node(&policy.matcher, authorization, leaf, meta, visiting);
        visiting.pop();
        matched
    }

    /// Evaluate one node. On success the node's authorization and meta are
    /// written back to the caller.
    fn match_node(
        &self,
        m: &Matcher,
        authorization: &mut String,
        leaf: &mut String,
        meta: &mut BTreeMap<String, String>,
        visiting: &mut Vec<String>,
    ) -> bool {
        let mut authz = authorization.clone();
        let mut local_meta = BTreeMap::new();
        let mut local_leaf = leaf.clone();
        let mut n = 0usize;

        if let Some(map) = &m.authorizations {
            if let Some(mapped) = map.get(&authz).or_else(|| map.get("")) {
                authz = mapped.clone();
            }
        }

        let matched = 'eval: {
            if m.always {
                n += 1;
            }
            if m.never {
                break 'eval false;
            }
            if m.skip {
                break 'eval n > 0;
            }

            if let Some(children) = &m.all {
                n += 1;
                let mut current = authz.clone();
                for child in children {
                    let mut child_authz = current.clone();
                    if !self.match_node(child, &mut child_authz, &mut local_leaf, &mut local_meta, visiting) {
                        break 'eval false;
                    }
                    current = child_authz;
                }
                authz = current;
            }

            if let Some(children) = &m.any {
                n += 1;
                let mut hit = false;
                for child in children {
                    let mut child_authz = authz.clone();
                    if self.match_node(child, &mut child_authz, &mut local_leaf, &mut local_meta, visiting) {
                        authz = child_authz;
                        hit = true;
                        break;
                    }
                }
                if !hit {
                    break 'eval false;
                }
            }

            if let Some(children) = &m.none {
                n += 1;
                for child in children {
                    let mut child_authz = authz.clone();
                    let mut scratch_leaf = local_leaf.clone();
                    let mut scratch = BTreeMap::new();
                    if self.match_node(child, &mut child_authz, &mut scratch_leaf, &mut scratch, visiting) {
                        break 'eval false;
                    }
                }
            }

            if let Some(bearers) = &m.bearer {
                n += 1;
                if !self.match_bearer(bearers, &authz) {
                    break 'eval false;
                }
            }

            if let Some(origins) = &m.origin {
                n += 1;
                let Some(origin) = &self.request.origin else {
                    break 'eval false;
                };
                if !origins.iter().any(|o| o == origin) {
                    break 'eval false;
                }
            }

            if let Some(name) = &m.policy {
                n += 1;
                if !self.match_policy(name, &mut authz, &mut local_leaf, &mut local_meta, visiting) {
                    break 'eval false;
                }
            }

            n > 0
        };

        if matched {
            for (k, v) in &m.meta {
                local_meta.entry(k.clone()).or_insert_with(|| v.clone());
            }
            for (k, v) in local_meta {
                meta.entry(k).or_insert(v);
            }
            *authorization = authz;
            *leaf = local_leaf;
        }
        matched
    }

    fn match_bearer(&self, bearers: &[Bearer], authorization: &str) -> bool {
        self.request.bearer_tokens.iter().any(|token| {
            bearers
                .iter()
                .any(|bearer| bearer_accepts(bearer, token, authorization))
        })
    }
}

fn bearer_accepts(bearer: &Bearer, token: &str, authorization: &str) -> bool {
    let granted = match &bearer.authorizations {
        Some(list) => list.iter().any(|a| a == authorization),
        None => !authorization.is_empty(),
    };
    if !granted {
        return false;
    }

    let mut defined = 0;
    if let Some(expected) = &bearer.token {
        defined += 1;
        if expected != token {
            return false;
        }
    }
    if let Some(key) = &bearer.jwt {
        defined += 1;
        if let Err(e) = jwt::verify(token, key) {
            tracing::debug!(error = %e, "Bearer JWT rejected");
            return false;
        }
    }
    defined > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::{JwtKey, Policy};
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn policies(docs: &[&str]) -> PolicySet {
        docs.iter()
            .map(|d| {
                let p: Policy = serde_yaml::from_str(d).unwrap();
                (p.name.clone(), p)
            })
            .collect()
    }

    fn request(tokens: &[&str], origin: Option<&str>) -> RequestContext {
        RequestContext {
            bearer_tokens: tokens.iter().map(|t| t.to_string()).collect(),
            origin: origin.map(str::to_string),
        }
    }

    fn decide(set: &PolicySet, req: &RequestContext, reference: &str) -> Decision {
        MatchContext::new(set, req).decide(&PolicyRef::parse(reference))
    }

    #[test]
    fn wrong_bearer_is_denied() {
        let set = policies(&["name: p1\nany:\n  - bearer: [{token: T}]\n"]);
        assert!(!decide(&set, &request(&["U"], None), "p1/read").matched);
        assert!(decide(&set, &request(&["T"], None), "p1/read").matched);
    }

    #[test]
    fn empty_authorization_without_default_is_denied() {
        let set = policies(&[
            "name: p1\nbearer: [{token: T}]\n",
            "name: open\nalways: true\n",
            "name: defaulted\nauthorizations: {'': guest}\nbearer: [{token: T}]\n",
        ]);
        let req = request(&["T"], None);
        assert!(!decide(&set, &req, "p1").matched);
        assert!(!decide(&set, &req, "open").matched);

        let d = decide(&set, &req, "defaulted");
        assert!(d.matched);
        assert_eq!(d.authorization, "guest");
    }

    #[test]
    fn authorization_map_rewrites() {
        let set = policies(&[
            "name: p\nauthorizations: {admin: write, '': read}\nbearer: [{token: T, authorizations: [read, write]}]\n",
        ]);
        let req = request(&["T"], None);
        assert_eq!(decide(&set, &req, "p/admin").authorization, "write");
        assert_eq!(decide(&set, &req, "p/other").authorization, "read");
    }

    #[test]
    fn bearer_authorization_list_limits_grant() {
        let set = policies(&["name: p\nbearer: [{token: T, authorizations: [read]}]\n"]);
        let req = request(&["T"], None);
        assert!(decide(&set, &req, "p/read").matched);
        assert!(!decide(&set, &req, "p/write").matched);
    }

    #[test]
    fn never_and_skip() {
        let set = policies(&[
            "name: never\nalways: true\nnever: true\n",
            "name: skip\nalways: true\nskip: true\nbearer: [{token: T}]\n",
            "name: bare-skip\nskip: true\n",
        ]);
        let req = request(&[], None);
        assert!(!decide(&set, &req, "never/x").matched);
        assert!(decide(&set, &req, "skip/x").matched);
        assert!(!decide(&set, &req, "bare-skip/x").matched);
    }

    #[test]
    fn empty_matcher_never_matches() {
        let set = policies(&["name: empty\n", "name: empty-any\nany: []\n"]);
        let req = request(&["T"], None);
        assert!(!decide(&set, &req, "empty/x").matched);
        assert!(!decide(&set, &req, "empty-any/x").matched);
    }

    #[test]
    fn all_and_none() {
        let set = policies(&[
            "name: p\nall:\n  - bearer: [{token: T}]\n  - origin: [https://a.example]\nnone:\n  - origin: [https://evil.example]\n",
        ]);
        assert!(decide(&set, &request(&["T"], Some("https://a.example")), "p/x").matched);
        assert!(!decide(&set, &request(&["T"], Some("https://b.example")), "p/x").matched);
        assert!(!decide(&set, &request(&["T"], None), "p/x").matched);
    }

    #[test]
    fn policy_references_and_cycles() {
        let set = policies(&[
            "name: outer\npolicy: inner\nmeta: {layer: outer, from: outer}\n",
            "name: inner\nbearer: [{token: T}]\nmeta: {layer: inner}\n",
            "name: a\npolicy: b\n",
            "name: b\npolicy: a\n",
            "name: dangling\npolicy: missing\n",
        ]);
        let req = request(&["T"], None);
        let d = decide(&set, &req, "outer/x");
        assert!(d.matched);
        assert_eq!(d.leaf, "inner");
        assert_eq!(d.meta["layer"], "inner");
        assert_eq!(d.meta["from"], "outer");

        assert!(!decide(&set, &req, "a/x").matched);
        assert!(!decide(&set, &req, "dangling/x").matched);
    }

    #[test]
    fn meta_comes_only_from_the_matching_branch() {
        let set = policies(&[
            "name: peers\nauthorizations: {'': peer}\nany:\n  - bearer: [{token: A}]\n    meta: {peer: alice}\n  - bearer: [{token: B}]\n    meta: {peer: bob}\n",
        ]);
        let d = decide(&set, &request(&["B"], None), "peers");
        assert!(d.matched);
        assert_eq!(d.authorization, "peer");
        assert_eq!(d.meta.get("peer").map(String::as_str), Some("bob"));

        let d = decide(&set, &request(&["C"], None), "peers");
        assert!(!d.matched);
        assert!(d.meta.is_empty());
    }

    #[test]
    fn jwt_bearer() {
        let token = encode(
            &Header::default(),
            &serde_json::json!({"sub": "svc"}),
            &EncodingKey::from_secret(b"k"),
        )
        .unwrap();
        let mut set = PolicySet::new();
        set.insert(
            "jwt".into(),
            Policy {
                name: "jwt".into(),
                matcher: Matcher {
                    bearer: Some(vec![Bearer {
                        jwt: Some(JwtKey { alg: "HS256".into(), secret: Some("k".into()), public_key: None }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
            },
        );
        assert!(decide(&set, &request(&["garbage", &token], None), "jwt/x").matched);
        assert!(!decide(&set, &request(&["garbage"], None), "jwt/x").matched);
    }

    #[test]
    fn parses_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::AUTHORIZATION, "Bearer one".parse().unwrap());
        headers.append(header::AUTHORIZATION, "Basic Zm9v".parse().unwrap());
        headers.append(header::AUTHORIZATION, "bearer  two ".parse().unwrap());
        headers.insert(header::ORIGIN, "https://a.example".parse().unwrap());
        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.bearer_tokens, vec!["one", "two"]);
        assert_eq!(ctx.origin.as_deref(), Some("https://a.example"));
    }
}
