//! Lock-free pause request of a machine loop.
//!
//! A modification analysis running on the same machine asks the loop to pause
//! while it holds the machine; only the requester may release the pause.

use std::sync::atomic::{AtomicU64, Ordering};

/// Pause request, identified by the triggering modification id.
#[derive(Debug, Default)]
pub struct PauseGate {
    /// 0 when no pause is requested
    modification_id: AtomicU64,
}

impl PauseGate {
    /// Gate without pause request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pause on behalf of `modification_id` (non-zero).
    ///
    /// Returns false when another modification already holds the pause.
    pub fn request_pause(&self, modification_id: u64) -> bool {
        debug_assert_ne!(modification_id, 0);
        match self
            .modification_id
            .compare_exchange(0, modification_id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == modification_id,
        }
    }

    /// Release the pause held by `modification_id`; returns whether it was held.
    pub fn release_pause(&self, modification_id: u64) -> bool {
        self.modification_id
            .compare_exchange(modification_id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether a pause is requested.
    pub fn is_pause_requested(&self) -> bool {
        self.modification_id.load(Ordering::Acquire) != 0
    }

    /// Modification holding the pause.
    pub fn triggering_modification_id(&self) -> Option<u64> {
        match self.modification_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_the_holder_releases() {
        let gate = PauseGate::new();
        assert!(!gate.is_pause_requested());
        assert!(gate.request_pause(12));
        assert!(gate.request_pause(12));
        assert!(!gate.request_pause(13));
        assert!(!gate.release_pause(13));
        assert_eq!(gate.triggering_modification_id(), Some(12));
        assert!(gate.release_pause(12));
        assert!(!gate.is_pause_requested());
    }
}
