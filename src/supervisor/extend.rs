//! Start/stop timeout extension.
//!
//! While a long reconciliation runs, the supervisor of this process is told
//! every 30 seconds to extend its timeout by the interval plus a margin.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::supervisor::notify::{Notification, Notifier};

pub const EXTEND_INTERVAL: Duration = Duration::from_secs(30);

/// Runs the extension loop until dropped.
#[derive(Debug)]
pub struct ExtendTimeout {
    handle: JoinHandle<()>,
}

impl ExtendTimeout {
    /// Notify immediately, then every [`EXTEND_INTERVAL`], asking for
    /// `EXTEND_INTERVAL + extra`.
    pub fn start(notifier: Arc<dyn Notifier>, extra: Duration) -> Self {
        Self::with_interval(notifier, EXTEND_INTERVAL, extra)
    }

    pub fn with_interval(notifier: Arc<dyn Notifier>, interval: Duration, extra: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                notifier.notify(Notification::ExtendTimeout(interval + extra));
            }
        });
        Self { handle }
    }
}

impl Drop for ExtendTimeout {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
