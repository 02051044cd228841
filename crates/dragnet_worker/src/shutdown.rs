//! Worker shutdown signaling.
//!
//! A worker has three long-lived tasks (dispatcher, heartbeat, any
//! in-flight scan stream) that all need to learn about shutdown at their
//! next suspension point. The signal wraps a watch channel: tick loops
//! await [`ShutdownSignal::signalled`] inside their `select!`, and code
//! that is between awaits can poll [`ShutdownSignal::is_signalled`].
//!
//! Job-level cancellation is deliberately NOT routed through here; a
//! cancelled row is observed at the handler's job-status checkpoint.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared shutdown flag for a worker's cooperative tasks.
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request shutdown. Idempotent; every clone observes it.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Non-blocking check for use between suspension points.
    pub fn is_signalled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once shutdown has been requested. Safe to race against
    /// other futures in a `select!`; resolves immediately if the signal
    /// already fired.
    pub async fn signalled(&self) {
        let mut receiver = self.sender.subscribe();
        // Err means the sender is gone, which we hold, so this only
        // returns on a real signal.
        let _ = receiver.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_reaches_every_clone() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_signalled());

        signal.trigger();
        assert!(observer.is_signalled());
        // Already-fired signals resolve immediately.
        tokio::time::timeout(Duration::from_secs(1), observer.signalled())
            .await
            .expect("signalled() should resolve after trigger");
    }

    #[tokio::test]
    async fn signalled_wakes_a_waiting_task() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.signalled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
