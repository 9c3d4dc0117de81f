//! Per-machine analysis loop.

use super::graph::{AnalysisGraph, Node, NodeId, Predicate};
use super::pause::PauseGate;
use super::step::{AnalysisStep, ExtensionStep, MachineAnalysis, StepBudget, StepOutcome};
use crate::config::AnalysisSettings;
use crate::error::{AppResult, PipelineError};
use crate::persistence::{catch_up_key, in_transaction, progress_key, Store};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Operating mode of a machine loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Context not initialized yet
    Initializing,
    /// Catch-up after downtime
    CatchUp,
    /// Machine producing
    Producing,
    /// Machine not producing
    NotProducing,
    /// Paused by a modification analysis
    Paused,
    /// Loop left after cancellation
    Stopped,
    /// Loop torn down by a step failure
    Failed,
}

/// Diagnostics of a machine loop.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Machine
    pub machine_id: u32,
    /// Current mode
    pub mode: AnalysisMode,
    /// Last completed step
    pub last_step: Option<String>,
    /// Completed iterations
    pub iterations: u64,
}

/// Shared view on a running loop.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    status: Arc<Mutex<SchedulerStatus>>,
    pause: Arc<PauseGate>,
}

impl SchedulerHandle {
    /// Current diagnostics.
    pub fn status(&self) -> SchedulerStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Pause gate of the loop.
    pub fn pause(&self) -> &PauseGate {
        &self.pause
    }
}

/// Persist the catch-up marker, so the next cold start runs a catch-up.
pub fn request_catch_up(store: &dyn Store, machine_id: u32) -> AppResult<()> {
    in_transaction(store, "Analysis.RequestCatchUp", |session| {
        session.set_application_state(&catch_up_key(machine_id), serde_json::Value::Bool(true))
    })
}

/// Runs the analysis graph of one machine, forever, one iteration at a time.
pub struct MachineScheduler {
    machine_id: u32,
    analysis: Box<dyn MachineAnalysis>,
    graph: AnalysisGraph,
    extensions: Vec<Arc<dyn ExtensionStep>>,
    store: Arc<dyn Store>,
    settings: AnalysisSettings,
    wake: Option<Arc<Notify>>,
    status: Arc<Mutex<SchedulerStatus>>,
    pause: Arc<PauseGate>,
    catch_up_pending: bool,
    progress: Option<u64>,
    initialized: bool,
}

impl MachineScheduler {
    /// Loop of `analysis`, with the graph built from `settings`.
    pub fn new(
        analysis: Box<dyn MachineAnalysis>,
        store: Arc<dyn Store>,
        settings: &AnalysisSettings,
    ) -> Self {
        let machine_id = analysis.machine_id();
        Self {
            machine_id,
            analysis,
            graph: AnalysisGraph::build(settings),
            extensions: Vec::new(),
            store,
            settings: settings.clone(),
            wake: None,
            status: Arc::new(Mutex::new(SchedulerStatus {
                machine_id,
                mode: AnalysisMode::Initializing,
                last_step: None,
                iterations: 0,
            })),
            pause: Arc::new(PauseGate::new()),
            catch_up_pending: false,
            progress: None,
            initialized: false,
        }
    }

    /// Add an extension step, run by the multi-step nodes.
    pub fn with_extension(mut self, extension: Arc<dyn ExtensionStep>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Wake the idle back-off on `notify`.
    pub fn with_wake(mut self, notify: Arc<Notify>) -> Self {
        self.wake = Some(notify);
        self
    }

    /// Handle for diagnostics and pause requests.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            status: Arc::clone(&self.status),
            pause: Arc::clone(&self.pause),
        }
    }

    /// Machine of the loop.
    pub fn machine_id(&self) -> u32 {
        self.machine_id
    }

    /// Whether the next iteration runs the catch-up graph.
    pub fn is_catch_up_pending(&self) -> bool {
        self.catch_up_pending
    }

    fn lock_status(&self) -> MutexGuard<'_, SchedulerStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, mode: AnalysisMode) {
        self.lock_status().mode = mode;
    }

    /// Read the catch-up marker and the progress marker, then initialize the
    /// analysis context. A failure here is fatal for the machine.
    pub async fn initialize(&mut self) -> AppResult<()> {
        let machine_id = self.machine_id;
        let (catch_up, progress) =
            in_transaction(self.store.as_ref(), "Analysis.Initialize", |session| {
                let catch_up = session.application_state(&catch_up_key(machine_id))?;
                let progress = session.application_state(&progress_key(machine_id))?;
                Ok((catch_up, progress))
            })
            .map_err(|e| self.failure("Initialize", e))?;

        self.catch_up_pending = catch_up.is_some_and(|value| value != serde_json::Value::Bool(false));
        self.progress = progress.and_then(|value| value.as_u64());
        info!(
            machine_id,
            catch_up = self.catch_up_pending,
            progress = ?self.progress,
            "analysis context initialized"
        );

        self.analysis
            .initialize(self.progress)
            .await
            .map_err(|e| self.failure("Initialize", e))?;
        self.initialized = true;
        Ok(())
    }

    fn failure(&self, step: &str, e: PipelineError) -> PipelineError {
        match e {
            PipelineError::Cancelled | PipelineError::StepFailed { .. } => e,
            other => PipelineError::StepFailed {
                machine_id: self.machine_id,
                step: step.to_string(),
                reason: other.to_string(),
            },
        }
    }

    fn evaluate(&self, predicate: Predicate) -> bool {
        match predicate {
            Predicate::CatchUp => self.catch_up_pending,
            Predicate::Producing => self.analysis.is_producing(),
            Predicate::CleanFlaggedModificationsRequired => {
                self.analysis.is_clean_flagged_modifications_required()
            }
        }
    }

    async fn execute_step(
        &mut self,
        step: AnalysisStep,
        budget: StepBudget,
        cancel: &CancellationToken,
    ) -> AppResult<StepOutcome> {
        let span = info_span!("analysis_step", machine_id = self.machine_id, %step);
        let run = self.analysis.run_step(step, &budget, cancel).instrument(span);
        tokio::select! {
            result = tokio::time::timeout(budget.max_time, run) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(machine_id = self.machine_id, %step, max_time = ?budget.max_time, "step interrupted at its max time");
                    Ok(StepOutcome::ExceededBudget)
                }
            },
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        }
    }

    async fn run_extensions(&self, budget: StepBudget, cancel: &CancellationToken) -> StepOutcome {
        let mut outcome = StepOutcome::Continue;
        for extension in &self.extensions {
            if cancel.is_cancelled() {
                break;
            }
            let run = extension.run(self.machine_id, &budget, cancel);
            match tokio::time::timeout(budget.max_time, run).await {
                Ok(Ok(StepOutcome::Continue)) => {}
                Ok(Ok(StepOutcome::End)) => break,
                Ok(Ok(StepOutcome::ExceededBudget)) | Err(_) => {
                    debug!(machine_id = self.machine_id, extension = extension.name(), "extension exceeded its budget");
                    outcome = StepOutcome::ExceededBudget;
                }
                Ok(Err(e)) => {
                    warn!(machine_id = self.machine_id, extension = extension.name(), error = %e, "extension step failed, continue");
                }
            }
        }
        outcome
    }

    fn save_progress(&mut self) {
        let Some(id) = self.analysis.last_modification_id() else {
            return;
        };
        if self.progress == Some(id) {
            return;
        }
        let key = progress_key(self.machine_id);
        match in_transaction(self.store.as_ref(), "Analysis.Progress", |session| {
            session.set_application_state(&key, serde_json::Value::from(id))
        }) {
            Ok(()) => self.progress = Some(id),
            Err(e) => warn!(machine_id = self.machine_id, error = %e, "progress marker not saved"),
        }
    }

    fn delete_catch_up_marker(&mut self) {
        let key = catch_up_key(self.machine_id);
        match in_transaction(self.store.as_ref(), "Analysis.DeleteCatchUp", |session| {
            session.delete_application_state(&key)
        }) {
            Ok(_) => info!(machine_id = self.machine_id, "catch-up completed"),
            Err(e) => error!(machine_id = self.machine_id, error = %e, "catch-up marker not deleted"),
        }
        self.catch_up_pending = false;
    }

    /// Traverse the graph once, from its entry to an end node.
    ///
    /// Cancellation is observed at every node. Returns `StepFailed` when a step
    /// fails without a failure continuation.
    pub async fn run_iteration(&mut self, cancel: &CancellationToken) -> AppResult<()> {
        if !self.initialized {
            self.initialize().await?;
        }

        let mut id: NodeId = self.graph.entry();
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let Some(node) = self.graph.node(id).cloned() else {
                return Err(PipelineError::StepFailed {
                    machine_id: self.machine_id,
                    step: format!("node {}", id),
                    reason: "dangling node reference".to_string(),
                });
            };

            id = match node {
                Node::End => break,
                Node::Branch {
                    name,
                    predicate,
                    then,
                    otherwise,
                } => {
                    let holds = self.evaluate(predicate);
                    match (predicate, holds) {
                        (Predicate::CatchUp, true) => self.set_mode(AnalysisMode::CatchUp),
                        (Predicate::Producing, true) => self.set_mode(AnalysisMode::Producing),
                        (Predicate::Producing, false) => self.set_mode(AnalysisMode::NotProducing),
                        _ => {}
                    }
                    debug!(machine_id = self.machine_id, branch = name, holds, "branch");
                    if holds {
                        then
                    } else {
                        otherwise
                    }
                }
                Node::Frequency { .. } => match self.graph.take_frequency(id, Instant::now()) {
                    Some(next) => next,
                    None => break,
                },
                Node::Multi {
                    budget,
                    next,
                    on_exceeded,
                } => match self.run_extensions(budget, cancel).await {
                    StepOutcome::ExceededBudget => on_exceeded,
                    _ => next,
                },
                Node::DeleteMarker { next } => {
                    self.delete_catch_up_marker();
                    next
                }
                Node::Step {
                    step,
                    budget,
                    on_success,
                    on_failure,
                    on_exceeded,
                } => {
                    let outcome = self.execute_step(step, budget, cancel).await;
                    let next = match outcome {
                        Ok(StepOutcome::Continue) => Some(on_success),
                        Ok(StepOutcome::End) => None,
                        Ok(StepOutcome::ExceededBudget) => {
                            debug!(machine_id = self.machine_id, %step, "step exceeded its budget");
                            Some(on_exceeded.unwrap_or(on_success))
                        }
                        Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                        Err(e) if e.is_transient() => {
                            warn!(machine_id = self.machine_id, %step, error = %e, "transient step failure, skipped");
                            Some(on_failure.unwrap_or(on_success))
                        }
                        Err(e) => match on_failure {
                            Some(failure) => {
                                warn!(machine_id = self.machine_id, %step, error = %e, "step failed, fallback");
                                Some(failure)
                            }
                            None => return Err(self.failure(step.name(), e)),
                        },
                    };
                    self.lock_status().last_step = Some(step.name().to_string());
                    self.save_progress();
                    match next {
                        Some(next) => next,
                        None => break,
                    }
                }
            };
        }

        self.lock_status().iterations += 1;
        Ok(())
    }

    async fn idle(&self, cancel: &CancellationToken) {
        let sleep = tokio::time::sleep(self.settings.idle_sleep);
        match &self.wake {
            Some(wake) => {
                tokio::select! {
                    _ = sleep => {}
                    _ = wake.notified() => debug!(machine_id = self.machine_id, "woken by new data"),
                    _ = cancel.cancelled() => {}
                }
            }
            None => {
                tokio::select! {
                    _ = sleep => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }

    /// Run iterations until cancelled.
    ///
    /// A step failure without failure continuation tears the loop down and is
    /// returned; cancellation ends it normally.
    pub async fn run(mut self, cancel: CancellationToken) -> AppResult<()> {
        info!(machine_id = self.machine_id, nodes = self.graph.len(), "analysis loop started");

        while !cancel.is_cancelled() {
            if let Some(modification_id) = self.pause.triggering_modification_id() {
                debug!(machine_id = self.machine_id, modification_id, "analysis paused");
                self.set_mode(AnalysisMode::Paused);
                self.idle(&cancel).await;
                continue;
            }

            match self.run_iteration(&cancel).await {
                Ok(()) => {}
                Err(PipelineError::Cancelled) => break,
                Err(e) => {
                    error!(fatal = true, machine_id = self.machine_id, error = %e, "analysis loop torn down");
                    self.set_mode(AnalysisMode::Failed);
                    return Err(e);
                }
            }

            if !self.catch_up_pending && !self.analysis.has_pending_work() {
                self.idle(&cancel).await;
            }
        }

        self.set_mode(AnalysisMode::Stopped);
        info!(machine_id = self.machine_id, "analysis loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Recording {
        steps: Arc<Mutex<Vec<AnalysisStep>>>,
        fail: Option<AnalysisStep>,
        slow: Option<AnalysisStep>,
        producing: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MachineAnalysis for Recording {
        fn machine_id(&self) -> u32 {
            7
        }

        fn is_producing(&self) -> bool {
            self.producing.load(Ordering::SeqCst)
        }

        fn last_modification_id(&self) -> Option<u64> {
            Some(self.steps.lock().unwrap().len() as u64)
        }

        async fn run_step(
            &mut self,
            step: AnalysisStep,
            _budget: &StepBudget,
            _cancel: &CancellationToken,
        ) -> AppResult<StepOutcome> {
            self.steps.lock().unwrap().push(step);
            if Some(step) == self.slow {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if Some(step) == self.fail {
                return Err(PipelineError::Persistence("constraint violation".into()));
            }
            Ok(StepOutcome::Continue)
        }
    }

    fn scheduler(
        store: &MemoryStore,
        settings: &AnalysisSettings,
        fail: Option<AnalysisStep>,
        slow: Option<AnalysisStep>,
    ) -> (MachineScheduler, Arc<Mutex<Vec<AnalysisStep>>>) {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let analysis = Recording {
            steps: steps.clone(),
            fail,
            slow,
            producing: Arc::new(AtomicBool::new(false)),
        };
        let scheduler = MachineScheduler::new(Box::new(analysis), Arc::new(store.clone()), settings);
        (scheduler, steps)
    }

    #[tokio::test]
    async fn test_not_producing_activity_failure_falls_back_to_reason_slots() {
        let store = MemoryStore::new();
        let (mut scheduler, steps) = scheduler(
            &store,
            &AnalysisSettings::default(),
            Some(AnalysisStep::Activity),
            None,
        );
        scheduler.run_iteration(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            *steps.lock().unwrap(),
            vec![
                AnalysisStep::Activity,
                AnalysisStep::ProcessingReasonSlots { recent: None }
            ]
        );
        assert_eq!(scheduler.handle().status().mode, AnalysisMode::NotProducing);
    }

    #[tokio::test]
    async fn test_failure_without_continuation_is_fatal() {
        let store = MemoryStore::new();
        let (mut scheduler, _steps) = scheduler(
            &store,
            &AnalysisSettings::default(),
            Some(AnalysisStep::Detection),
            None,
        );
        let err = scheduler
            .run_iteration(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StepFailed { machine_id: 7, .. }));
    }

    #[tokio::test]
    async fn test_slow_step_exceeds_its_budget() {
        let store = MemoryStore::new();
        let mut settings = AnalysisSettings::default();
        settings.budgets.auto_sequence.max_time = Duration::from_millis(20);
        let (mut scheduler, steps) =
            scheduler(&store, &settings, None, Some(AnalysisStep::AutoSequence));
        scheduler.run_iteration(&CancellationToken::new()).await.unwrap();
        // Not producing: auto-sequence over budget ends the iteration
        assert_eq!(steps.lock().unwrap().last(), Some(&AnalysisStep::AutoSequence));
    }

    #[tokio::test]
    async fn test_progress_marker_is_saved_and_read_back() {
        let store = MemoryStore::new();
        let (mut first, _steps) = scheduler(&store, &AnalysisSettings::default(), None, None);
        first.run_iteration(&CancellationToken::new()).await.unwrap();
        let saved = store.application_state(&progress_key(7)).unwrap();
        assert!(saved.as_u64().unwrap() > 0);

        let (mut restarted, _steps) = scheduler(&store, &AnalysisSettings::default(), None, None);
        restarted.initialize().await.unwrap();
        assert_eq!(restarted.progress, saved.as_u64());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_a_running_step() {
        let store = MemoryStore::new();
        let (mut scheduler, _steps) = scheduler(
            &store,
            &AnalysisSettings::default(),
            None,
            Some(AnalysisStep::Activity),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = scheduler.run_iteration(&cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn test_paused_loop_does_not_run_steps() {
        let store = MemoryStore::new();
        let settings = AnalysisSettings {
            idle_sleep: Duration::from_millis(5),
            ..Default::default()
        };
        let (scheduler, steps) = scheduler(&store, &settings, None, None);
        let handle = scheduler.handle();
        assert!(handle.pause().request_pause(42));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(steps.lock().unwrap().is_empty());
        assert_eq!(handle.status().mode, AnalysisMode::Paused);

        handle.pause().release_pause(42);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!steps.lock().unwrap().is_empty());
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(handle.status().mode, AnalysisMode::Stopped);
    }

    #[test]
    fn test_run_future_can_be_spawned() {
        fn assert_send<T: Send + 'static>(_: &T) {}
        let store = MemoryStore::new();
        let (scheduler, _steps) = scheduler(&store, &AnalysisSettings::default(), None, None);
        let scheduler = scheduler.with_wake(Arc::new(Notify::new()));
        let run = scheduler.run(CancellationToken::new());
        assert_send(&run);
    }
}
