//! `key<op>=value` attribute filters.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde_json::Value;
use serde_json_path::JsonPath;

use crate::selector::{path_holds, SelectorError};

/// Comparison applied to a record attribute.
#[derive(Debug, Clone)]
pub enum Op {
    /// `=`
    Equals(String),
    /// `*=`
    Regex(Regex),
    /// `~=`
    Token(String),
    /// `~json=`
    JsonContains(String),
    /// `~jsonpath=`
    JsonPath(JsonPath),
    /// `^=`
    Prefix(String),
    /// `$=`
    Suffix(String),
}

/// One parsed flag.
#[derive(Debug, Clone)]
pub struct Filter {
    pub key: String,
    pub negated: bool,
    pub op: Op,
}

/// Operator suffixes, longest first so `~jsonpath` wins over `~json` and `~`.
const OPERATORS: [&str; 6] = ["~jsonpath", "~json", "~", "*", "^", "$"];

impl Filter {
    pub fn parse(raw: &str) -> Result<Self, SelectorError> {
        let (negated, body) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let (lhs, value) = body
            .split_once('=')
            .ok_or_else(|| SelectorError::Syntax(raw.to_string()))?;

        let (key, op) = OPERATORS
            .iter()
            .find_map(|op| lhs.strip_suffix(op).map(|key| (key, *op)))
            .unwrap_or((lhs, ""));
        if key.is_empty() {
            return Err(SelectorError::Syntax(raw.to_string()));
        }

        let value = value.to_string();
        let op = match op {
            "" => Op::Equals(value),
            "*" => Op::Regex(Regex::new(&value).map_err(|e| SelectorError::Regex {
                pattern: value.clone(),
                reason: e.to_string(),
            })?),
            "~" => Op::Token(value),
            "~json" => Op::JsonContains(value),
            "~jsonpath" => Op::JsonPath(JsonPath::parse(&value).map_err(|e| {
                SelectorError::JsonPath {
                    path: value.clone(),
                    reason: e.to_string(),
                }
            })?),
            "^" => Op::Prefix(value),
            _ => Op::Suffix(value),
        };
        Ok(Self {
            key: key.to_string(),
            negated,
            op,
        })
    }

    /// Result of the operator against `actual`, before negation.
    fn holds(&self, actual: &str) -> bool {
        match &self.op {
            Op::Equals(v) => actual == v,
            Op::Regex(re) => re.is_match(actual),
            Op::Token(v) => actual.split_whitespace().any(|t| t == v),
            Op::JsonContains(v) => match serde_json::from_str::<Value>(actual) {
                Ok(Value::Array(items)) => items.iter().any(|item| match item {
                    Value::String(s) => s == v,
                    other => other.to_string() == *v,
                }),
                _ => false,
            },
            Op::JsonPath(path) => serde_json::from_str::<Value>(actual)
                .map(|doc| path_holds(path, &doc))
                .unwrap_or(false),
            Op::Prefix(v) => actual.starts_with(v.as_str()),
            Op::Suffix(v) => actual.ends_with(v.as_str()),
        }
    }

    /// Whether `record` passes. A missing attribute fails the operator.
    pub fn matches(&self, record: &BTreeMap<String, String>) -> bool {
        let held = record.get(&self.key).map(|v| self.holds(v)).unwrap_or(false);
        held != self.negated
    }
}

/// A set of filters: same key is OR, different keys AND.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    filters: Vec<Filter>,
}

impl Selector {
    pub fn parse<S: AsRef<str>>(flags: &[S]) -> Result<Self, SelectorError> {
        let filters = flags
            .iter()
            .map(|f| Filter::parse(f.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self { filters })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn matches(&self, record: &BTreeMap<String, String>) -> bool {
        let keys: BTreeSet<&str> = self.filters.iter().map(|f| f.key.as_str()).collect();
        keys.into_iter().all(|key| {
            self.filters
                .iter()
                .filter(|f| f.key == key)
                .any(|f| f.matches(record))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> BTreeMap<String, String> {
        [
            ("app", "web"),
            ("instance", "prod-eu"),
            ("config.TAGS", "edge public"),
            ("config.REGIONS", r#"["eu", "us", 3]"#),
            ("config.LIMITS", r#"{"cpu": 2, "burst": true}"#),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn check(flag: &str) -> bool {
        Filter::parse(flag).unwrap().matches(&record())
    }

    #[test]
    fn each_operator() {
        assert!(check("app=web"));
        assert!(!check("app=we"));
        assert!(check("instance*=^prod-(eu|us)$"));
        assert!(check("config.TAGS~=public"));
        assert!(!check("config.TAGS~=pub"));
        assert!(check("config.REGIONS~json=us"));
        assert!(check("config.REGIONS~json=3"));
        assert!(!check("config.REGIONS~json=ap"));
        assert!(check("config.LIMITS~jsonpath=$[?@.burst]"));
        assert!(!check("config.LIMITS~jsonpath=$[?@.missing]"));
        assert!(check("instance^=prod"));
        assert!(check("instance$=-eu"));
    }

    #[test]
    fn negation_inverts_every_operator() {
        for flag in [
            "app=web",
            "instance*=eu",
            "config.TAGS~=edge",
            "config.REGIONS~json=eu",
            "config.LIMITS~jsonpath=$[?@.burst]",
            "instance^=prod",
            "instance$=eu",
            "app=api",
        ] {
            assert_eq!(check(&format!("!{flag}")), !check(flag), "{flag}");
        }
    }

    #[test]
    fn missing_attribute_fails() {
        assert!(!check("owner=me"));
        assert!(check("!owner=me"));
    }

    #[test]
    fn same_key_or_different_keys_and() {
        let sel = Selector::parse(&["app=api", "app=web", "instance^=prod"]).unwrap();
        assert!(sel.matches(&record()));
        let sel = Selector::parse(&["app=web", "instance^=staging"]).unwrap();
        assert!(!sel.matches(&record()));
    }

    #[test]
    fn rejects_malformed_flags() {
        assert!(matches!(Filter::parse("app"), Err(SelectorError::Syntax(_))));
        assert!(matches!(Filter::parse("=web"), Err(SelectorError::Syntax(_))));
        assert!(matches!(Filter::parse("app*=("), Err(SelectorError::Regex { .. })));
        assert!(matches!(Filter::parse("a~jsonpath=$[["), Err(SelectorError::JsonPath { .. })));
    }
}
