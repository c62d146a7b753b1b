//! Cancellation signal
//!
//! Broadcast-based signal used to stop a leader term's tasks and, at process
//! level, the whole node. Late subscribers still observe a signal that was
//! already fired.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shutdown signal broadcaster
///
/// Clone it into every task that must stop together, then call
/// [`wait`](ShutdownSignal::wait) from each of them.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<broadcast::Sender<()>>,
    fired: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender: Arc::new(sender),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Trigger shutdown; idempotent
    pub fn shutdown(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.sender.send(());
        }
    }

    /// True once [`shutdown`](ShutdownSignal::shutdown) was called
    pub fn is_shutdown(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Create a new receiver for this signal
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Resolve once the signal fires, including if it already has
    pub async fn wait(&self) {
        let mut receiver = self.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = receiver.recv().await;
    }

    /// Check if any receivers exist
    pub fn has_receivers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
