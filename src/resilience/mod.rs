//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Mutation against the proxy config API:
//!     → 412 Precondition Failed
//!     → retries.rs (attempt budget, jittered delay before re-reading the ETag)
//! ```
//!
//! # Design Decisions
//! - Only optimistic-concurrency conflicts are retried
//! - Jittered backoff spreads concurrent reconcilers apart

pub mod retries;

pub use retries::ConflictRetry;
