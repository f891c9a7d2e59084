//! conductor: podman pods as systemd services behind Caddy.
//!
//! # Architecture Overview
//!
//! ```text
//!   operator ── conductor (cli) ──┐
//!                                 ▼
//!   systemd units ── conductor _ ...  ──▶ service ──▶ deployment
//!                                         lifecycle    driver
//!                                            │            │
//!                  ┌─────────────────────────┼────────────┼──────────────┐
//!                  ▼                         ▼            ▼              ▼
//!             supervisor               container        proxy        config
//!          (systemctl, sd_notify)      (podman)   (Caddy admin API)  (YAML/JSON store)
//!
//!   Caddy forward_auth ──▶ conductor-policy ──▶ policy matcher
//!   function socket    ──▶ conductor _ function serve ──▶ CGI executable
//! ```
//!
//! Every external system sits behind a trait in [`ports::Ports`]; the
//! in-memory implementations next to each real one drive the tests.

// Lifecycle
pub mod deployment;
pub mod service;

// Adapters
pub mod container;
pub mod proxy;
pub mod supervisor;

// Configuration and policy
pub mod config;
pub mod policy;
pub mod selector;

// Serving
pub mod http;

// Cross-cutting concerns
pub mod error;
pub mod observability;
pub mod ports;
pub mod resilience;
pub mod runtime;

pub mod cli;

pub use error::{Error, Result};
pub use ports::Ports;
