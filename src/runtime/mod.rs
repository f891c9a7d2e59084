//! Process runtime primitives shared by every lifecycle driver.
//!
//! # Data Flow
//! ```text
//! OS signals (signals.rs)
//!     SIGTERM/SIGINT → Shutdown::trigger()
//!
//! Shutdown (shutdown.rs)
//!     → ShutdownSignal handed to background tasks and subprocesses
//!
//! Subprocess (process.rs)
//!     spawn → wait | deadline | cancel
//!     deadline/cancel → SIGTERM → term_grace → SIGKILL
//! ```
//!
//! # Design Decisions
//! - Every call that crosses the process boundary goes through `process::run`
//! - Cancellation is a value passed down, never a global

pub mod process;
pub mod shutdown;
pub mod signals;

pub use process::{CommandOutput, CommandSpec, ProcessError};
pub use shutdown::{Shutdown, ShutdownSignal};
