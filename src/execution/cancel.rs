//! Caller-owned cancellation signal.
//!
//! A [`Cancellation`] is handed to every consumption point that may block for
//! the lifetime of a container (waiting, log streaming, image pulls). Clones
//! share the same flag, so one task can cancel work observed by another.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared, clonable cancellation flag.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    /// Creates a signal that has not been cancelled.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Marks the signal as cancelled and wakes every waiter.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves when the signal is cancelled. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
