//! Cancellation coordination.

use std::sync::Arc;
use tokio::sync::watch;

/// Cancellation token for one lifecycle invocation.
///
/// Clones share the same state. Any clone may trigger; every subscriber
/// observes the trigger, including subscribers created afterwards.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create a new, untriggered token.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Subscribe to the cancellation signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Trigger cancellation. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a [`Shutdown`] token.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait until cancellation is triggered.
    ///
    /// Also completes when every [`Shutdown`] handle has been dropped.
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }

    /// Whether cancellation has already been requested.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn late_subscriber_sees_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut signal = shutdown.subscribe();
        tokio::time::timeout(Duration::from_millis(100), signal.recv())
            .await
            .expect("signal should already be set");
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        let mut signal = shutdown.subscribe();
        assert!(!signal.is_triggered());

        let waiter = tokio::spawn(async move { signal.recv().await });
        clone.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());
    }
}
