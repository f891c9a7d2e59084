//! OS signal handling.
//!
//! SIGTERM and SIGINT both translate into a [`Shutdown`] trigger so the
//! lifecycle driver can send `stopping` and unwind instead of dying mid-step.

use tokio::signal::unix::{signal, SignalKind};

use crate::runtime::Shutdown;

/// Wait for SIGTERM or SIGINT.
pub async fn terminated() -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = term.recv() => tracing::info!("SIGTERM received"),
        _ = int.recv() => tracing::info!("SIGINT received"),
    }
    Ok(())
}

/// Spawn a task that triggers `shutdown` on the first termination signal.
pub fn spawn_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        match terminated().await {
            Ok(()) => shutdown.trigger(),
            Err(e) => tracing::error!(error = %e, "Failed to install signal handlers"),
        }
    });
}
