//! Callback delivery thread
//!
//! Transitions enqueue notifications here while holding the entry lock, so
//! the queue order is the transition order. A single dedicated thread drains
//! the queue and runs callbacks with no broker lock held.

use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::resource::{ResourcePresence, ResourceState};
use crate::error::{Error, Result};

/// A pending callback invocation
pub(crate) struct Notification {
    pub(crate) entry: Arc<ResourcePresence>,
    pub(crate) state: ResourceState,
}

/// Sending side of the callback delivery queue
#[derive(Clone)]
pub(crate) struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    /// Start the delivery thread
    ///
    /// The thread exits once every `Notifier` clone is dropped and the queue
    /// is drained.
    pub(crate) fn spawn() -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();

        thread::Builder::new()
            .name("presence-notifier".to_string())
            .spawn(move || {
                while let Some(notification) = rx.blocking_recv() {
                    notification.entry.deliver(notification.state);
                }
                debug!("Presence notifier stopped");
            })
            .map_err(|e| Error::runtime(format!("failed to spawn presence notifier: {}", e)))?;

        Ok(Self { tx })
    }

    /// Queue a callback for `entry`
    pub(crate) fn enqueue(&self, entry: Arc<ResourcePresence>, state: ResourceState) {
        if let Err(mpsc::error::SendError(dropped)) = self.tx.send(Notification { entry, state }) {
            warn!(
                "Presence notifier is gone, dropping {:?} notification for {}",
                dropped.state,
                dropped.entry.identity()
            );
        }
    }

    /// Notifier whose queue is read by the caller instead of a thread
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}
