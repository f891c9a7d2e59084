//! Service lifecycle subsystem.
//!
//! # Data Flow
//! ```text
//! _ service start|reload
//!     → lifecycle.rs start_or_reload, per part:
//!         list deployments (dir + identity) → supervisor state
//!         reuse active | wait activating | start inactive | claim slot
//!         claim slot → symlink + seed.json + drop-ins → daemon-reload
//!         → start conductor-deployment@<name>
//!     → retire siblings not in the target set (remove.rs)
//!     → READY → monitor every interval until no deployment is left
//!
//! _ service stop → STOPPING → hooks → stop every deployment unit
//! ```
//!
//! # Design Decisions
//! - New deployments are active before any sibling is removed
//! - Slots are claimed with mkdir, so two drivers never share one
//! - Removal escalates stop → SIGTERM → SIGKILL and only fails on the filesystem

pub mod lifecycle;
pub mod remove;

pub use lifecycle::{ServiceDriver, StartOptions};
