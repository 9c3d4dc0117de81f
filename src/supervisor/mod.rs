//! Acquisition supervisor.
//!
//! One acquisition unit runs per configured (machine, module), either on its own OS
//! thread (in-process driver) or as a child OS process. The [`Supervisor`] owns the
//! units; the [`Watchdog`] polls their liveness and restarts the silent ones.
//!
//! ## Unit lifecycle
//!
//! ```text
//! Configured -> Starting -> Running -> Stopping -> Stopped
//!                              |
//!                              +-----> Faulted -> (restart) -> Stopping -> Stopped -> Starting
//! ```
//!
//! Supervision is purely observational: a worker reports "I'm alive" through its
//! [`LivenessHandle`], the watchdog compares the last report with the unit timeout.
//! A hung unit never blocks another one.

pub mod liveness;
pub mod manager;
pub mod unit;
pub mod watchdog;
pub mod worker;

pub use liveness::LivenessHandle;
pub use manager::{Supervisor, UnitStatus};
pub use unit::{StopOutcome, UnitHandle};
pub use watchdog::{LivenessChecker, Watchdog};
pub use worker::{AcquisitionWorker, MockAcquisition, WorkerContext, WorkerFactory};

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of an acquisition unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Declared, not started
    Configured,
    /// Worker being launched
    Starting,
    /// Worker running and supervised
    Running,
    /// Cancellation signalled, waiting for the worker
    Stopping,
    /// Worker gone
    Stopped,
    /// Liveness deadline missed, error reported, or stop failed
    Faulted,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Configured => "configured",
            UnitState::Starting => "starting",
            UnitState::Running => "running",
            UnitState::Stopping => "stopping",
            UnitState::Stopped => "stopped",
            UnitState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Sleep for `duration` unless `cancel` fires first. Returns true when cancelled.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.cancelled() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancellable_sleep() {
        let cancel = CancellationToken::new();
        assert!(!cancellable_sleep(Duration::from_millis(1), &cancel).await);
        cancel.cancel();
        assert!(cancellable_sleep(Duration::from_secs(3600), &cancel).await);
    }

    #[tokio::test]
    async fn test_cancellation_wakes_the_sleeper() {
        let cancel = CancellationToken::new();
        let mut sleep = tokio_test::task::spawn(cancellable_sleep(Duration::from_secs(3600), &cancel));
        tokio_test::assert_pending!(sleep.poll());
        cancel.cancel();
        assert!(sleep.is_woken());
        tokio_test::assert_ready_eq!(sleep.poll(), true);
    }
}
