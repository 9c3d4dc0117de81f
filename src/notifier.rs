//! Machine-keyed wake-up registry.
//!
//! Owned by the composition root and handed to the importers (publishers) and the
//! analysis schedulers (subscribers). A notification sent while nobody waits is
//! kept until the next wait, so an import completing just before the scheduler goes
//! idle is not lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::trace;

/// "Data imported" notifications per machine.
#[derive(Debug, Default)]
pub struct MachineNotifier {
    listeners: Mutex<HashMap<u32, Arc<Notify>>>,
}

impl MachineNotifier {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake-up handle of a machine.
    pub fn subscribe(&self, machine_id: u32) -> Arc<Notify> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.entry(machine_id).or_default().clone()
    }

    /// Signal that new data was imported for a machine.
    pub fn notify(&self, machine_id: u32) {
        let listener = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&machine_id)
            .cloned();
        if let Some(listener) = listener {
            trace!(machine_id, "data imported notification");
            listener.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notification_before_wait_is_kept() {
        let notifier = MachineNotifier::new();
        let listener = notifier.subscribe(7);
        notifier.notify(7);
        notifier.notify(8);
        tokio::time::timeout(Duration::from_millis(100), listener.notified())
            .await
            .expect("stored permit wakes the listener");
    }
}
