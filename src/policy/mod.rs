//! Policy engine and authorization sidecar.
//!
//! # Data Flow
//! ```text
//! POST / (Conductor-Policy: name[/authz], ...)
//!     → server.rs (collect references, load policy snapshot)
//!     → matcher.rs (evaluate each reference against the request)
//!         → jwt.rs (verify JWT bearers)
//!     → 204 + Conductor-Authorization / Conductor-Meta-* headers
//!       or 401
//!
//! peer invite <name>
//!     → invite.rs (add a random bearer to the `peers` policy)
//! ```
//!
//! # Design Decisions
//! - Evaluation is pure; policies are an immutable snapshot per request
//! - JWT failures reject the token, never the whole matcher
//! - Unknown or cyclic policy references evaluate to no match

pub mod invite;
pub mod jwt;
pub mod matcher;
pub mod server;
pub mod types;

use thiserror::Error;

use crate::config::ConfigError;

pub use matcher::{Decision, MatchContext, RequestContext};
pub use types::{Bearer, JwtKey, Matcher, Policy, PolicyRef, PolicySet};

/// Errors raised by the policy subsystem.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unknown JWT algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("JWT key material missing")]
    MissingKey,

    #[error("JWT rejected: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("invalid response header: {0}")]
    Header(String),

    #[error("invalid peer name '{0}'")]
    InvalidPeer(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
