//! Periodic liveness polling of the acquisition units.

use crate::error::AppResult;
use crate::model::ModuleRef;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{cancellable_sleep, Supervisor};

/// Extra check polled on every watchdog tick.
pub trait LivenessChecker: Send + Sync {
    /// Checker name, for logs.
    fn name(&self) -> &str;

    /// Called once, before the first tick.
    fn initialize(&self) -> AppResult<()> {
        Ok(())
    }

    /// `Ok(false)` requests a process exit. Errors are logged and ignored.
    fn check(&self) -> AppResult<bool>;
}

/// Polls the supervisor's units and the additional checkers.
pub struct Watchdog {
    supervisor: Arc<Supervisor>,
    checkers: Vec<Arc<dyn LivenessChecker>>,
}

impl Watchdog {
    /// Watchdog of `supervisor`'s units.
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            checkers: Vec::new(),
        }
    }

    /// Add a checker polled on every tick.
    pub fn with_checker(mut self, checker: Arc<dyn LivenessChecker>) -> Self {
        self.checkers.push(checker);
        self
    }

    fn initialize(&self) {
        for checker in &self.checkers {
            if let Err(e) = checker.initialize() {
                error!(checker = checker.name(), error = %e, "checker initialization failed");
            }
        }
    }

    /// One pass: fault silent units, schedule their restart, poll the checkers.
    ///
    /// Returns the units faulted by this pass. Restarts run in the background.
    pub fn tick(&self) -> Vec<ModuleRef> {
        let faulted = self.supervisor.evaluate(Utc::now());
        let settings = self.supervisor.settings().clone();

        for key in &faulted {
            if !settings.restart {
                warn!(unit = %key, "restart disabled, unit stays faulted");
                continue;
            }
            let supervisor = Arc::clone(&self.supervisor);
            let key = *key;
            tokio::spawn(async move {
                match supervisor.restart(key).await {
                    Ok(()) => {}
                    Err(crate::error::PipelineError::Cancelled) => {
                        debug!(unit = %key, "restart abandoned, shutting down");
                    }
                    Err(e) => {
                        error!(unit = %key, error = %e, "restart failed");
                        if settings.force_exit_on_failed_restart {
                            tokio::time::sleep(settings.sleep_before_force_exit).await;
                            supervisor.request_process_exit();
                        }
                    }
                }
            });
        }

        for checker in &self.checkers {
            match checker.check() {
                Ok(true) => {}
                Ok(false) => {
                    error!(checker = checker.name(), "checker reported a failure");
                    self.supervisor.request_process_exit();
                }
                Err(e) => warn!(checker = checker.name(), error = %e, "checker error ignored"),
            }
        }
        faulted
    }

    /// Tick every `frequency` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let frequency = self.supervisor.settings().frequency;
        info!(?frequency, checkers = self.checkers.len(), "acquisition watchdog started");
        self.initialize();

        while !cancellable_sleep(frequency, &cancel).await {
            self.tick();
        }
        info!("acquisition watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueSettings, WatchdogSettings};
    use crate::queue::QueueBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChecker {
        calls: AtomicUsize,
        healthy: bool,
    }

    impl LivenessChecker for CountingChecker {
        fn name(&self) -> &str {
            "counting"
        }

        fn check(&self) -> AppResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.healthy)
        }
    }

    #[tokio::test]
    async fn test_failing_checker_requests_process_exit() {
        let supervisor = Arc::new(Supervisor::new(
            WatchdogSettings::default(),
            Arc::new(QueueBus::new(QueueSettings::default())),
        ));
        let shutdown = CancellationToken::new();
        supervisor.start(&[], shutdown.clone()).await;

        let checker = Arc::new(CountingChecker {
            calls: AtomicUsize::new(0),
            healthy: false,
        });
        let watchdog = Watchdog::new(supervisor).with_checker(checker.clone());
        assert!(watchdog.tick().is_empty());
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
        assert!(shutdown.is_cancelled());
    }
}
