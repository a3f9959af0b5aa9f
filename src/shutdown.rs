//! Close-once shutdown broadcast.
//!
//! Shutdown is a single channel closed exactly once. The trigger consumes
//! its sender on first use, so a second trigger (another monitor tripping,
//! a signal racing a monitor) is a no-op rather than a double close.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Create a linked trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(());
    (
        ShutdownTrigger {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        ShutdownSignal { rx },
    )
}

/// Fires the shutdown broadcast. Cloneable; only the first trigger fires.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<Mutex<Option<watch::Sender<()>>>>,
}

impl ShutdownTrigger {
    /// Close the shutdown channel. Returns true when this call closed it.
    pub fn trigger(&self) -> bool {
        self.tx.lock().take().is_some()
    }
}

/// Observes the shutdown broadcast.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<()>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been triggered.
    pub async fn wait(&mut self) {
        // changed() errs when the sender is dropped, which is the trigger.
        while self.rx.changed().await.is_ok() {}
    }

    /// Whether shutdown has already been triggered.
    pub fn is_shutdown(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}
