//! Composition root.
//!
//! [`Pipeline`] owns the queue bus, the machine notifier and the supervisor, and
//! starts for every enabled unit an import loop, and for every machine an analysis
//! loop. Everything shares one cancellation token; the watchdog cancels it when it
//! has to force a process exit.

use crate::analysis::{
    AnalysisStep, MachineAnalysis, MachineScheduler, SchedulerHandle, SchedulerStatus, StepBudget,
    StepOutcome,
};
use crate::cache::SegmentCloseRule;
use crate::config::PipelineConfig;
use crate::error::{AppResult, PipelineError};
use crate::import::QueueImporter;
use crate::model::ModuleRef;
use crate::notifier::MachineNotifier;
use crate::persistence::Store;
use crate::queue::{QueueBus, QueueInfo};
use crate::supervisor::{LivenessChecker, LivenessHandle, Supervisor, UnitStatus, Watchdog};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Creates the analysis context of a machine.
pub type AnalysisFactory =
    Arc<dyn Fn(u32, Arc<dyn Store>) -> Box<dyn MachineAnalysis> + Send + Sync>;

/// Snapshot of the whole pipeline, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Acquisition units
    pub units: Vec<UnitStatus>,
    /// Analysis loops
    pub schedulers: Vec<SchedulerStatus>,
    /// Queues and their depth
    pub queues: Vec<QueueInfo>,
}

/// Analysis context used when no analysis collaborator is plugged in.
///
/// Never producing; every step completes at once.
pub struct PassiveAnalysis {
    machine_id: u32,
}

impl PassiveAnalysis {
    /// Factory for [`Pipeline::with_analysis`].
    pub fn factory() -> AnalysisFactory {
        Arc::new(|machine_id: u32, _store: Arc<dyn Store>| {
            Box::new(PassiveAnalysis { machine_id }) as Box<dyn MachineAnalysis>
        })
    }
}

#[async_trait]
impl MachineAnalysis for PassiveAnalysis {
    fn machine_id(&self) -> u32 {
        self.machine_id
    }

    fn is_producing(&self) -> bool {
        false
    }

    async fn run_step(
        &mut self,
        step: AnalysisStep,
        _budget: &StepBudget,
        _cancel: &CancellationToken,
    ) -> AppResult<StepOutcome> {
        trace!(machine_id = self.machine_id, %step, "passive step");
        Ok(StepOutcome::Continue)
    }
}

/// Requests a process exit when an import loop stays silent too long.
pub struct ImportLoopChecker {
    loops: Vec<(ModuleRef, LivenessHandle)>,
    timeout: Duration,
}

impl ImportLoopChecker {
    /// Checker of `loops` with a silence `timeout`.
    pub fn new(loops: Vec<(ModuleRef, LivenessHandle)>, timeout: Duration) -> Self {
        Self { loops, timeout }
    }
}

impl LivenessChecker for ImportLoopChecker {
    fn name(&self) -> &str {
        "import-loops"
    }

    fn check(&self) -> AppResult<bool> {
        let now = Utc::now();
        let mut healthy = true;
        for (module, liveness) in &self.loops {
            if liveness.is_check_paused() || liveness.is_exited() {
                continue;
            }
            if let Some(silence) = liveness.silent_for(now) {
                if silence > self.timeout {
                    error!(%module, ?silence, "import loop not responding");
                    healthy = false;
                }
            }
        }
        Ok(healthy)
    }
}

/// The assembled acquisition-to-analysis pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn Store>,
    bus: Arc<QueueBus>,
    notifier: Arc<MachineNotifier>,
    supervisor: Arc<Supervisor>,
    analysis_factory: AnalysisFactory,
    close_rules: Vec<Arc<dyn SegmentCloseRule>>,
    schedulers: StdMutex<Vec<SchedulerHandle>>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl Pipeline {
    /// Assemble a pipeline from a validated configuration.
    pub fn new(config: PipelineConfig, store: Arc<dyn Store>) -> AppResult<Self> {
        config.validate().map_err(PipelineError::Configuration)?;
        let bus = Arc::new(QueueBus::new(config.queue.clone()));
        let supervisor = Arc::new(Supervisor::new(config.watchdog.clone(), Arc::clone(&bus)));
        Ok(Self {
            config,
            store,
            bus,
            notifier: Arc::new(MachineNotifier::new()),
            supervisor,
            analysis_factory: PassiveAnalysis::factory(),
            close_rules: Vec::new(),
            schedulers: StdMutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Use `factory` to create the analysis context of every machine.
    pub fn with_analysis(mut self, factory: AnalysisFactory) -> Self {
        self.analysis_factory = factory;
        self
    }

    /// Register a segment-close rule in every value cache.
    pub fn with_close_rule(mut self, rule: Arc<dyn SegmentCloseRule>) -> Self {
        self.close_rules.push(rule);
        self
    }

    /// Queue bus.
    pub fn bus(&self) -> &Arc<QueueBus> {
        &self.bus
    }

    /// Acquisition supervisor.
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Machine notifier.
    pub fn notifier(&self) -> &Arc<MachineNotifier> {
        &self.notifier
    }

    /// Token cancelled by [`Pipeline::shutdown`] or a forced exit.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current status of units, analysis loops and queues.
    pub fn status(&self) -> PipelineStatus {
        let schedulers = self
            .schedulers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(SchedulerHandle::status)
            .collect();
        PipelineStatus {
            units: self.supervisor.units(),
            schedulers,
            queues: self.bus.inspect().unwrap_or_default(),
        }
    }

    async fn spawn_task(&self, name: String, task: JoinHandle<()>) {
        self.tasks.lock().await.push((name, task));
    }

    async fn start(&self) -> AppResult<()> {
        self.supervisor.start(&self.config.units, self.cancel.clone()).await;
        let units: Vec<_> = self.config.enabled_units().into_iter().cloned().collect();

        let mut import_loops = Vec::new();
        for unit in &units {
            let module = ModuleRef::new(unit.machine_id, unit.module_id);
            let queues = self.bus.machine_set(unit.machine_id, unit.module_id)?;
            let importer = QueueImporter::new(
                queues,
                Arc::clone(&self.store),
                &self.config.import,
                &self.config.cache,
                &self.close_rules,
            )
            .with_notifier(Arc::clone(&self.notifier));
            import_loops.push((module, importer.liveness()));
            let cancel = self.cancel.child_token();
            self.spawn_task(format!("import {}", module), tokio::spawn(importer.run(cancel)))
                .await;
        }

        let watchdog = Watchdog::new(Arc::clone(&self.supervisor)).with_checker(Arc::new(
            ImportLoopChecker::new(import_loops, self.config.watchdog.not_responding_timeout),
        ));
        self.spawn_task("watchdog".to_string(), tokio::spawn(watchdog.run(self.cancel.clone())))
            .await;

        for machine_id in self.config.machine_ids() {
            let analysis = (self.analysis_factory)(machine_id, Arc::clone(&self.store));
            let scheduler =
                MachineScheduler::new(analysis, Arc::clone(&self.store), &self.config.analysis)
                    .with_wake(self.notifier.subscribe(machine_id));
            self.schedulers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(scheduler.handle());
            let cancel = self.cancel.child_token();
            let task = tokio::spawn(async move {
                if let Err(e) = scheduler.run(cancel).await {
                    error!(machine_id, error = %e, "analysis stopped for this machine");
                }
            });
            self.spawn_task(format!("analysis {}", machine_id), task).await;
        }

        info!(
            units = units.len(),
            machines = self.config.machine_ids().len(),
            "pipeline started"
        );
        Ok(())
    }

    /// Start every component and run until `cancel` fires (or a forced exit),
    /// then shut down.
    pub async fn run(&self, cancel: CancellationToken) -> AppResult<()> {
        self.start().await?;
        tokio::select! {
            _ = cancel.cancelled() => info!("shutdown requested"),
            _ = self.cancel.cancelled() => warn!("pipeline cancelled internally"),
        }
        self.shutdown().await
    }

    /// Stop everything. Safe to call more than once.
    pub async fn shutdown(&self) -> AppResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            debug!("pipeline already shut down");
            return Ok(());
        }
        self.cancel.cancel();

        let mut errors = Vec::new();
        if let Err(e) = self.supervisor.stop().await {
            errors.push(e);
        }

        let timeout = self.config.watchdog.stop_timeout;
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for (name, task) in tasks {
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(())) => debug!(task = %name, "task stopped"),
                Ok(Err(e)) => {
                    error!(task = %name, error = %e, "task panicked");
                    errors.push(PipelineError::worker(&name, e.to_string()));
                }
                Err(_) => warn!(task = %name, ?timeout, "task did not stop in time"),
            }
        }

        info!(errors = errors.len(), "pipeline stopped");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::ShutdownFailed(errors))
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
