//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events on stderr)
//!     → metrics.rs (counters)
//!
//! Consumers:
//!     → journald (stderr of supervised units)
//!     → Metrics endpoint (Prometheus scrape, sidecar only)
//! ```
//!
//! # Design Decisions
//! - Structured fields (service, deployment, unit) on every lifecycle event
//! - stdout is reserved for command output
//! - Metrics are cheap no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
