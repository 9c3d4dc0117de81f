//! Liveness reporting shared between a worker and the watchdog.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Inner {
    /// Milliseconds since the epoch of the last report, 0 before the first one
    last_active_ms: AtomicI64,
    paused: AtomicBool,
    error: AtomicBool,
    exit_requested: AtomicBool,
    exited: AtomicBool,
}

/// Handle a worker uses to prove it is alive.
///
/// Checks start paused: a unit is only supervised once it reported activity at
/// least once. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct LivenessHandle {
    inner: Arc<Inner>,
}

impl LivenessHandle {
    /// New handle, not reported yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// "I'm alive".
    pub fn set_active(&self) {
        self.inner
            .last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Suspend the liveness check (long blocking call ahead).
    pub fn pause_check(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Resume the liveness check; counts as a report.
    pub fn resume_check(&self) {
        self.set_active();
        self.inner.paused.store(false, Ordering::Release);
    }

    /// Whether the check is suspended, explicitly or because nothing was reported yet.
    pub fn is_check_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire) || self.last_active().is_none()
    }

    /// Report an unrecoverable error; the watchdog faults the unit on its next tick.
    pub fn set_error(&self) {
        self.inner.error.store(true, Ordering::Release);
    }

    /// Whether an error was reported.
    pub fn is_error(&self) -> bool {
        self.inner.error.load(Ordering::Acquire)
    }

    /// Ask the worker to leave its loop.
    pub fn request_exit(&self) {
        self.inner.exit_requested.store(true, Ordering::Release);
    }

    /// Whether the worker was asked to leave.
    pub fn exit_requested(&self) -> bool {
        self.inner.exit_requested.load(Ordering::Acquire)
    }

    /// Mark the worker as gone.
    pub fn set_exited(&self) {
        self.inner.exited.store(true, Ordering::Release);
    }

    /// Whether the worker is gone.
    pub fn is_exited(&self) -> bool {
        self.inner.exited.load(Ordering::Acquire)
    }

    /// Time of the last report.
    pub fn last_active(&self) -> Option<DateTime<Utc>> {
        match self.inner.last_active_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// How long the worker has been silent at `now`.
    pub fn silent_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_active()
            .map(|at| (now - at).to_std().unwrap_or_default())
    }
}
