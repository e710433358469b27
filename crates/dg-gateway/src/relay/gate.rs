//! Single-shot completion gate

use std::sync::Mutex;

use tokio::sync::oneshot;

/// Lets any number of racing tasks report completion; only the first
/// report is delivered
pub struct CompletionGate<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> CompletionGate<T> {
    /// Create a gate and the receiver that observes the first trigger
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Report completion; returns true only for the first caller
    pub fn trigger(&self, value: T) -> bool {
        let sender = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match sender {
            Some(tx) => {
                // The receiver may already be gone; the gate is spent either way
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    /// Whether the gate has fired
    pub fn is_triggered(&self) -> bool {
        match self.tx.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}
