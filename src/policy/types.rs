//! Policy documents.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Policies keyed by name.
pub type PolicySet = HashMap<String, Policy>;

/// A named matcher tree.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Policy {
    pub name: String,
    #[serde(flatten)]
    pub matcher: Matcher,
}

/// A conjunctive predicate node.
///
/// Every defined sub-predicate must pass, and at least one must be defined
/// for the node to match at all.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Matcher {
    #[serde(skip_serializing_if = "is_false")]
    pub always: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub never: bool,
    /// Stop evaluating here; the node matches if anything before it was defined.
    #[serde(skip_serializing_if = "is_false")]
    pub skip: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<Matcher>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub any: Option<Vec<Matcher>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub none: Option<Vec<Matcher>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer: Option<Vec<Bearer>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Vec<String>>,
    /// Name of another policy to evaluate in place.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,

    /// Tags reported to the caller when this node matches.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,

    /// Rewrites the current authorization; the `""` key is the fallback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorizations: Option<BTreeMap<String, String>>,
}

/// Accepted bearer credential.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Bearer {
    /// Literal token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Verification key for JWT bearers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<JwtKey>,
    /// Authorizations this credential grants. Unset grants any non-empty one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorizations: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct JwtKey {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// PEM encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A `name[/authorization]` reference as carried in request headers and
/// function environments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRef {
    pub name: String,
    pub authorization: String,
}

impl PolicyRef {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.split_once('/') {
            Some((name, authz)) => Self {
                name: name.to_string(),
                authorization: authz.to_string(),
            },
            None => Self {
                name: raw.to_string(),
                authorization: String::new(),
            },
        }
    }
}

impl std::fmt::Display for PolicyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.authorization)
    }
}
