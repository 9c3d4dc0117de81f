//! Registry of acquisition units.
//!
//! The supervisor owns one entry per (machine, module). Each entry keeps the unit
//! configuration, its lifecycle state, its liveness handle, its own cancellation
//! token and the handle of the running worker. The registry lock is only held to
//! read or swap entries, never while a worker is started, awaited or killed.

use crate::config::{ExecutionMode, UnitConfig, WatchdogSettings};
use crate::error::{AppResult, PipelineError};
use crate::model::ModuleRef;
use crate::queue::QueueBus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::unit::{StopOutcome, UnitHandle};
use super::worker::{MockAcquisition, WorkerContext, WorkerFactory};
use super::{cancellable_sleep, LivenessHandle, UnitState};

/// Point-in-time view of a unit, for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    /// Unit identity
    pub key: ModuleRef,
    /// Execution mode
    pub mode: ExecutionMode,
    /// Lifecycle state
    pub state: UnitState,
    /// Last liveness report
    pub last_activity: Option<DateTime<Utc>>,
}

struct UnitEntry {
    config: UnitConfig,
    state: UnitState,
    liveness: LivenessHandle,
    cancel: CancellationToken,
    handle: Option<UnitHandle>,
}

/// Starts, tracks, restarts and stops the acquisition units.
pub struct Supervisor {
    settings: WatchdogSettings,
    bus: Arc<QueueBus>,
    factories: HashMap<String, WorkerFactory>,
    units: Mutex<HashMap<ModuleRef, UnitEntry>>,
    shutdown: Mutex<CancellationToken>,
    stopped: AtomicBool,
}

impl Supervisor {
    /// Supervisor with the built-in `mock` driver registered.
    pub fn new(settings: WatchdogSettings, bus: Arc<QueueBus>) -> Self {
        let mut supervisor = Self {
            settings,
            bus,
            factories: HashMap::new(),
            units: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            stopped: AtomicBool::new(false),
        };
        supervisor.register_factory("mock", MockAcquisition::from_config);
        supervisor
    }

    /// Register an in-process driver.
    pub fn register_factory(&mut self, driver: &str, factory: WorkerFactory) {
        self.factories.insert(driver.to_string(), factory);
    }

    /// Watchdog settings.
    pub fn settings(&self) -> &WatchdogSettings {
        &self.settings
    }

    fn lock_units(&self) -> MutexGuard<'_, HashMap<ModuleRef, UnitEntry>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Start every unit of `units`; returns the number of running units.
    ///
    /// A unit failing to start is logged and excluded. Every unit token is a child
    /// of `shutdown`, which the watchdog also cancels to force a process exit.
    pub async fn start(&self, units: &[UnitConfig], shutdown: CancellationToken) -> usize {
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = shutdown;
        self.stopped.store(false, Ordering::Release);

        let mut started = 0;
        for config in units {
            let key = ModuleRef::new(config.machine_id, config.module_id);
            if self.lock_units().contains_key(&key) {
                warn!(unit = %key, "unit already registered, skipped");
                continue;
            }
            if !config.enabled {
                debug!(unit = %key, "unit disabled");
                self.lock_units().insert(
                    key,
                    UnitEntry {
                        config: config.clone(),
                        state: UnitState::Configured,
                        liveness: LivenessHandle::new(),
                        cancel: CancellationToken::new(),
                        handle: None,
                    },
                );
                continue;
            }
            match self.start_unit(config).await {
                Ok(()) => started += 1,
                Err(e) => error!(unit = %key, mode = %config.mode, error = %e, "unit failed to start, excluded"),
            }
        }
        info!(started, configured = units.len(), "acquisition units started");
        started
    }

    async fn start_unit(&self, config: &UnitConfig) -> AppResult<()> {
        let key = ModuleRef::new(config.machine_id, config.module_id);
        let liveness = LivenessHandle::new();
        let cancel = self.shutdown_token().child_token();
        self.lock_units().insert(
            key,
            UnitEntry {
                config: config.clone(),
                state: UnitState::Starting,
                liveness: liveness.clone(),
                cancel: cancel.clone(),
                handle: None,
            },
        );

        match self.spawn(config, key, liveness, cancel) {
            Ok(handle) => {
                if let Some(entry) = self.lock_units().get_mut(&key) {
                    entry.handle = Some(handle);
                    entry.state = UnitState::Running;
                }
                debug!(unit = %key, "unit running");
                Ok(())
            }
            Err(e) => {
                self.lock_units().remove(&key);
                Err(e)
            }
        }
    }

    fn spawn(
        &self,
        config: &UnitConfig,
        key: ModuleRef,
        liveness: LivenessHandle,
        cancel: CancellationToken,
    ) -> AppResult<UnitHandle> {
        let ctx = WorkerContext {
            key,
            liveness,
            queues: self.bus.machine_set(key.machine_id, key.module_id)?,
            cancel,
        };
        match config.mode {
            ExecutionMode::Thread => {
                let factory = self.factories.get(&config.driver).ok_or_else(|| {
                    PipelineError::worker(key, format!("unknown driver '{}'", config.driver))
                })?;
                let worker = factory(config)?;
                UnitHandle::spawn_thread(worker, ctx)
            }
            ExecutionMode::Process => UnitHandle::spawn_process(config, ctx),
        }
    }

    /// Snapshot of every unit.
    pub fn units(&self) -> Vec<UnitStatus> {
        let mut statuses: Vec<UnitStatus> = self
            .lock_units()
            .iter()
            .map(|(key, entry)| UnitStatus {
                key: *key,
                mode: entry.config.mode,
                state: entry.state,
                last_activity: entry.liveness.last_active(),
            })
            .collect();
        statuses.sort_by_key(|status| status.key);
        statuses
    }

    /// State of one unit.
    pub fn state(&self, key: ModuleRef) -> Option<UnitState> {
        self.lock_units().get(&key).map(|entry| entry.state)
    }

    /// Liveness handle of one unit.
    pub fn liveness(&self, key: ModuleRef) -> Option<LivenessHandle> {
        self.lock_units().get(&key).map(|entry| entry.liveness.clone())
    }

    /// Fault every running unit that reported an error, exited, or stayed silent
    /// past its timeout at `now`. Returns the newly faulted units.
    ///
    /// Units whose check is paused are only faulted on error or exit.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Vec<ModuleRef> {
        let mut faulted = Vec::new();
        for (key, entry) in self.lock_units().iter_mut() {
            if entry.state != UnitState::Running {
                continue;
            }
            let timeout = entry
                .config
                .not_responding_timeout
                .unwrap_or(self.settings.not_responding_timeout);

            let reason = if entry.liveness.is_error() {
                Some("error reported".to_string())
            } else if entry.liveness.is_exited() {
                Some("worker exited".to_string())
            } else if entry.liveness.is_check_paused() {
                None
            } else {
                match entry.liveness.silent_for(now) {
                    Some(silence) if silence > timeout => {
                        Some(format!("not responding for {:?} (timeout {:?})", silence, timeout))
                    }
                    _ => None,
                }
            };

            if let Some(reason) = reason {
                error!(unit = %key, mode = %entry.config.mode, %reason, "acquisition unit faulted");
                entry.state = UnitState::Faulted;
                faulted.push(*key);
            }
        }
        faulted.sort();
        faulted
    }

    /// Stop a faulted unit and start it again.
    ///
    /// Returns an error when the old worker could not be stopped within
    /// `restart_timeout` or the new one could not be started.
    pub async fn restart(&self, key: ModuleRef) -> AppResult<()> {
        let (config, handle) = {
            let mut units = self.lock_units();
            let entry = units
                .get_mut(&key)
                .ok_or_else(|| PipelineError::worker(key, "unknown unit"))?;
            entry.cancel.cancel();
            entry.liveness.request_exit();
            entry.state = UnitState::Stopping;
            (entry.config.clone(), entry.handle.take())
        };

        if let Some(handle) = handle {
            match handle.stop(key, self.settings.restart_timeout).await? {
                StopOutcome::Detached => {
                    self.set_state(key, UnitState::Faulted);
                    return Err(PipelineError::worker(key, "previous worker still running"));
                }
                outcome => debug!(unit = %key, ?outcome, "faulted unit stopped"),
            }
        }
        self.set_state(key, UnitState::Stopped);

        info!(unit = %key, delay = ?self.settings.sleep_before_restart, "restarting unit");
        if cancellable_sleep(self.settings.sleep_before_restart, &self.shutdown_token()).await
            || self.stopped.load(Ordering::Acquire)
        {
            return Err(PipelineError::Cancelled);
        }

        let liveness = LivenessHandle::new();
        let cancel = self.shutdown_token().child_token();
        let handle = match self.spawn(&config, key, liveness.clone(), cancel.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                self.set_state(key, UnitState::Faulted);
                return Err(e);
            }
        };

        // Checked under the units lock: `stop` sets the flag before walking the units.
        let orphan = {
            let mut units = self.lock_units();
            match units.get_mut(&key) {
                Some(entry) if !self.stopped.load(Ordering::Acquire) => {
                    entry.liveness = liveness;
                    entry.cancel = cancel;
                    entry.handle = Some(handle);
                    entry.state = UnitState::Running;
                    info!(unit = %key, "unit restarted");
                    return Ok(());
                }
                Some(_) => (handle, PipelineError::Cancelled),
                None => (handle, PipelineError::worker(key, "unit removed during restart")),
            }
        };

        let (handle, err) = orphan;
        cancel.cancel();
        liveness.request_exit();
        match handle.stop(key, self.settings.stop_timeout).await {
            Ok(outcome) => debug!(unit = %key, ?outcome, "worker started during stop, stopped"),
            Err(e) => error!(unit = %key, error = %e, "worker started during stop, stop failed"),
        }
        self.set_state(key, UnitState::Stopped);
        Err(err)
    }

    fn set_state(&self, key: ModuleRef, state: UnitState) {
        if let Some(entry) = self.lock_units().get_mut(&key) {
            entry.state = state;
        }
    }

    /// Ask the whole process to exit.
    pub fn request_process_exit(&self) {
        warn!("process exit requested by the acquisition watchdog");
        self.shutdown_token().cancel();
    }

    /// Stop every unit. Safe to call more than once.
    ///
    /// Order: cancel every unit, close or kill the processes, then join the
    /// threads. A thread not finishing in time is logged and left behind.
    pub async fn stop(&self) -> AppResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("supervisor already stopped");
            return Ok(());
        }

        let mut handles = Vec::new();
        {
            let mut units = self.lock_units();
            for (key, entry) in units.iter_mut() {
                entry.cancel.cancel();
                entry.liveness.request_exit();
                if entry.state != UnitState::Configured {
                    entry.state = UnitState::Stopping;
                }
                if let Some(handle) = entry.handle.take() {
                    handles.push((*key, handle));
                }
            }
        }
        let (processes, threads): (Vec<_>, Vec<_>) =
            handles.into_iter().partition(|(_, handle)| handle.is_process());

        let timeout = self.settings.stop_timeout;
        let mut errors = Vec::new();
        let process_results = futures::future::join_all(
            processes
                .into_iter()
                .map(|(key, handle)| async move { (key, handle.stop(key, timeout).await) }),
        )
        .await;
        let thread_results = futures::future::join_all(
            threads
                .into_iter()
                .map(|(key, handle)| async move { (key, handle.stop(key, timeout).await) }),
        )
        .await;

        for (key, result) in process_results.into_iter().chain(thread_results) {
            let state = match result {
                Ok(StopOutcome::Detached) => UnitState::Faulted,
                Ok(_) => UnitState::Stopped,
                Err(e) => {
                    error!(unit = %key, error = %e, "unit stop failed");
                    errors.push(e);
                    UnitState::Faulted
                }
            };
            self.set_state(key, state);
        }
        for entry in self.lock_units().values_mut() {
            if entry.state == UnitState::Stopping {
                entry.state = UnitState::Stopped;
            }
        }

        info!(errors = errors.len(), "acquisition units stopped");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::ShutdownFailed(errors))
        }
    }

    /// Wait until the unit is no longer starting, for at most `timeout`.
    pub async fn wait_running(&self, key: ModuleRef, timeout: Duration) -> Option<UnitState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.state(key);
            if state != Some(UnitState::Starting) || tokio::time::Instant::now() >= deadline {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let units = self.units.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in units.values() {
            entry.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;

    fn supervisor(settings: WatchdogSettings) -> Supervisor {
        Supervisor::new(settings, Arc::new(QueueBus::new(QueueSettings::default())))
    }

    #[tokio::test]
    async fn test_unknown_driver_is_excluded() {
        let supervisor = supervisor(WatchdogSettings::default());
        let mut bad = UnitConfig::mock(2, 0);
        bad.driver = "fanuc-focas".to_string();
        let started = supervisor
            .start(&[UnitConfig::mock(1, 0), bad], CancellationToken::new())
            .await;
        assert_eq!(started, 1);
        let units = supervisor.units();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].state, UnitState::Running);
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_unit_stays_configured() {
        let supervisor = supervisor(WatchdogSettings::default());
        let mut disabled = UnitConfig::mock(2, 0);
        disabled.enabled = false;
        let started = supervisor
            .start(&[UnitConfig::mock(1, 0), disabled], CancellationToken::new())
            .await;
        assert_eq!(started, 1);
        assert_eq!(supervisor.state(ModuleRef::new(2, 0)), Some(UnitState::Configured));
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(ModuleRef::new(2, 0)), Some(UnitState::Configured));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let supervisor = supervisor(WatchdogSettings::default());
        supervisor
            .start(&[UnitConfig::mock(1, 0)], CancellationToken::new())
            .await;
        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(ModuleRef::new(1, 0)), Some(UnitState::Stopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_racing_stop_leaves_no_worker_running() {
        let settings = WatchdogSettings {
            sleep_before_restart: Duration::ZERO,
            ..Default::default()
        };
        let key = ModuleRef::new(1, 0);
        for _ in 0..20 {
            let supervisor = Arc::new(supervisor(settings.clone()));
            supervisor
                .start(&[UnitConfig::mock(1, 0)], CancellationToken::new())
                .await;

            let restarting = Arc::clone(&supervisor);
            let restart = tokio::spawn(async move { restarting.restart(key).await });
            supervisor.stop().await.unwrap();
            let _ = restart.await.unwrap();

            assert_ne!(supervisor.state(key), Some(UnitState::Running));
            let liveness = supervisor.liveness(key).unwrap();
            assert!(liveness.exit_requested());
        }
    }

    #[tokio::test]
    async fn test_paused_unit_is_not_faulted_for_silence() {
        let settings = WatchdogSettings {
            not_responding_timeout: Duration::from_millis(1),
            ..Default::default()
        };
        let supervisor = supervisor(settings);
        let mut unit = UnitConfig::mock(1, 0);
        unit.period = Duration::from_secs(3600);
        supervisor.start(&[unit], CancellationToken::new()).await;

        let key = ModuleRef::new(1, 0);
        let liveness = supervisor.liveness(key).unwrap();
        // First tick of the interval is immediate
        tokio::time::sleep(Duration::from_millis(50)).await;
        liveness.pause_check();
        let later = Utc::now() + chrono::Duration::seconds(10);
        assert!(supervisor.evaluate(later).is_empty());

        liveness.resume_check();
        assert_eq!(supervisor.evaluate(later), vec![key]);
        assert_eq!(supervisor.state(key), Some(UnitState::Faulted));
        supervisor.stop().await.unwrap();
    }
}
