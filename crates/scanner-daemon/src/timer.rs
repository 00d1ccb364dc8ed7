//! Delayed self-addressed events.
//!
//! Controllers never hold timer handles.  A delayed callback is just an event
//! that arrives later on the controller's own channel, stamped with the
//! `Generation` it was scheduled under; by the time it lands the controller
//! may have moved on, and it drops anything from an older generation.

use std::time::Duration;
use tokio::sync::mpsc;

/// Epoch counter for one controller.  Bumped whenever in-flight callbacks
/// must stop mattering (feed change, stop, mode switch).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub fn bump(&mut self) -> Generation {
        self.0 += 1;
        *self
    }
}

pub struct Scheduler<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for Scheduler<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Send + 'static> Scheduler<E> {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver now.  Returns false once the receiving loop is gone.
    pub fn send(&self, event: E) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Deliver after `delay`.
    pub fn after(&self, delay: Duration, event: E) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }
}
