//! Semantic validation of service and policy documents.
//!
//! # Responsibilities
//! - Check what serde cannot: empty names, duplicates, unusable entries
//! - Walk policy matcher trees and check bearer and JWT declarations
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function over an already parsed document

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::config::schema::Service;
use crate::policy::types::{Matcher, Policy};

/// A single semantic problem, located by a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a resolved service.
pub fn validate_service(service: &Service) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if service.app.is_empty() {
        errors.push(ValidationError::new("app", "must not be empty"));
    }
    if service.instance.is_empty() {
        errors.push(ValidationError::new("instance", "must not be empty"));
    }
    for (field, value) in [("app", &service.app), ("instance", &service.instance)] {
        if value.contains('/') || value.chars().any(char::is_whitespace) {
            errors.push(ValidationError::new(
                field,
                format!("'{value}' must not contain '/' or whitespace"),
            ));
        }
    }

    let mut parts = HashSet::new();
    for (i, part) in service.pods.iter().enumerate() {
        if part.name.is_empty() {
            errors.push(ValidationError::new(format!("pods[{i}].name"), "must not be empty"));
        } else if !parts.insert(part.name.as_str()) {
            errors.push(ValidationError::new(
                format!("pods[{i}].name"),
                format!("duplicate part '{}'", part.name),
            ));
        }
    }

    let mut functions = HashSet::new();
    for (i, function) in service.functions.iter().enumerate() {
        if !functions.insert(function.name.as_str()) {
            errors.push(ValidationError::new(
                format!("functions[{i}].name"),
                format!("duplicate function '{}'", function.name),
            ));
        }
        if function.exec.is_empty() {
            errors.push(ValidationError::new(format!("functions[{i}].exec"), "must not be empty"));
        }
    }

    for (i, hook) in service.hooks.iter().enumerate() {
        if hook.exec.first().map(|p| p.is_empty()).unwrap_or(true) {
            errors.push(ValidationError::new(format!("hooks[{i}].exec"), "must not be empty"));
        }
    }

    for (i, column) in service.columns.iter().enumerate() {
        if serde_json_path::JsonPath::parse(&column.jsonpath).is_err() {
            errors.push(ValidationError::new(
                format!("columns[{i}].jsonpath"),
                format!("invalid JSONPath '{}'", column.jsonpath),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a policy document.
pub fn validate_policy(policy: &Policy) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    if policy.name.is_empty() || policy.name.contains('/') {
        errors.push(ValidationError::new("name", "must be non-empty and contain no '/'"));
    }
    validate_matcher(&policy.matcher, "", &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_matcher(matcher: &Matcher, at: &str, errors: &mut Vec<ValidationError>) {
    let field = |name: &str| {
        if at.is_empty() {
            name.to_string()
        } else {
            format!("{at}.{name}")
        }
    };

    for (name, children) in [("all", &matcher.all), ("any", &matcher.any), ("none", &matcher.none)] {
        for (i, child) in children.iter().flatten().enumerate() {
            validate_matcher(child, &field(&format!("{name}[{i}]")), errors);
        }
    }

    for (i, bearer) in matcher.bearer.iter().flatten().enumerate() {
        let here = field(&format!("bearer[{i}]"));
        if bearer.token.is_none() && bearer.jwt.is_none() {
            errors.push(ValidationError::new(&here, "needs a token or a jwt key"));
        }
        if let Some(jwt) = &bearer.jwt {
            if jsonwebtoken::Algorithm::from_str(&jwt.alg).is_err() {
                errors.push(ValidationError::new(
                    format!("{here}.jwt.alg"),
                    format!("unknown algorithm '{}'", jwt.alg),
                ));
            }
            if jwt.secret.is_none() && jwt.public_key.is_none() {
                errors.push(ValidationError::new(
                    format!("{here}.jwt"),
                    "needs a secret or a public-key",
                ));
            }
        }
    }

    if matcher.policy.as_deref() == Some("") {
        errors.push(ValidationError::new(field("policy"), "must not be empty"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{Function, Hook, HookPhase, PodPart};
    use crate::policy::types::{Bearer, JwtKey};
    use std::path::PathBuf;

    fn service() -> Service {
        Service {
            dir: PathBuf::from("/srv/web/prod"),
            file: PathBuf::from("/srv/web/prod/service.yaml"),
            id: "0".repeat(64),
            app: "web".into(),
            instance: "prod".into(),
            config: Default::default(),
            pod: None,
            proxy_config: None,
            service_proxy_config: None,
            hooks: vec![],
            functions: vec![],
            pods: vec![],
            policies: vec![],
            columns: vec![],
            conditions: vec![],
        }
    }

    #[test]
    fn valid_service_passes() {
        assert!(validate_service(&service()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut svc = service();
        svc.app = String::new();
        svc.pods = vec![
            PodPart { name: "api".into(), pod: None, proxy_config: None },
            PodPart { name: "api".into(), pod: None, proxy_config: None },
        ];
        svc.hooks = vec![Hook { when: HookPhase::PreStart, exec: vec![] }];
        svc.functions = vec![Function { name: "f".into(), exec: vec![], policies: vec![] }];

        let errors = validate_service(&svc).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["app", "pods[1].name", "functions[0].exec", "hooks[0].exec"]);
    }

    #[test]
    fn policy_bearer_needs_token_or_jwt() {
        let policy = Policy {
            name: "p".into(),
            matcher: Matcher {
                any: Some(vec![Matcher {
                    bearer: Some(vec![
                        Bearer::default(),
                        Bearer {
                            jwt: Some(JwtKey {
                                alg: "XX999".into(),
                                secret: Some("s".into()),
                                public_key: None,
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }]),
                ..Default::default()
            },
        };
        let errors = validate_policy(&policy).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "any[0].bearer[0]");
        assert_eq!(errors[1].field, "any[0].bearer[1].jwt.alg");
    }
}
