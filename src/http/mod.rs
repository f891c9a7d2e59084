//! HTTP serving for socket-activated sidecars.
//!
//! # Data Flow
//! ```text
//! LISTEN_FDS socket or bound address
//!     → activation.rs (Listener)
//!     → idle.rs (accept loop, per-connection state, idle timer)
//!     → request.rs (request IDs, trace spans)
//!     → axum Router
//! ```
//!
//! # Design Decisions
//! - The process exits once idle; the supervisor restarts it on the next
//!   connection to the socket
//! - Shutdown is graceful: in-flight requests finish before exit

pub mod activation;
pub mod idle;
pub mod request;

pub use activation::Listener;
pub use idle::{IdleServer, IdleTracker, StopReason};
