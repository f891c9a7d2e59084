//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! conductor.toml + CONDUCTOR_* env
//!     → environment.rs (EnvironmentContext, built once at entry)
//!
//! service.yaml
//!     → loader.rs (parse, resolve inherit[] recursively)
//!     → merge.rs (overlay child on parents)
//!     → digest.rs (identity of the resolved document)
//!     → validation.rs (semantic checks)
//!     → Service (immutable)
//!
//! deployment dir
//!     → store.rs (seed.json, deployment.json, policies)
//!
//! policies dir change
//!     → watcher.rs → atomic swap of the policy snapshot
//! ```
//!
//! # Design Decisions
//! - Services are never mutated in place; an edit yields a new identity
//! - All fields have defaults to allow minimal documents
//! - Validation separates syntactic (serde) from semantic checks

pub mod digest;
pub mod environment;
pub mod loader;
pub mod merge;
pub mod schema;
pub mod store;
pub mod validation;
pub mod watcher;

pub use environment::EnvironmentContext;
pub use loader::ConfigError;
pub use schema::{ConfigValue, Deployment, HookPhase, Seed, Service};
pub use store::{ConfigStore, DeploymentEntry, DeploymentFilter};
