//! Integration tests for the per-machine analysis scheduler.

use async_trait::async_trait;
use cnc_pipeline::analysis::{
    request_catch_up, AnalysisMode, AnalysisStep, MachineAnalysis, MachineScheduler, StepBudget,
    StepOutcome,
};
use cnc_pipeline::config::AnalysisSettings;
use cnc_pipeline::notifier::MachineNotifier;
use cnc_pipeline::persistence::{catch_up_key, MemoryStore};
use cnc_pipeline::AppResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Records the steps it is asked to run.
#[derive(Clone, Default)]
struct Scripted {
    producing: Arc<AtomicBool>,
    steps: Arc<Mutex<Vec<AnalysisStep>>>,
}

impl Scripted {
    fn take_steps(&self) -> Vec<AnalysisStep> {
        std::mem::take(&mut *self.steps.lock().unwrap())
    }
}

#[async_trait]
impl MachineAnalysis for Scripted {
    fn machine_id(&self) -> u32 {
        7
    }

    fn is_producing(&self) -> bool {
        self.producing.load(Ordering::SeqCst)
    }

    async fn run_step(
        &mut self,
        step: AnalysisStep,
        _budget: &StepBudget,
        _cancel: &CancellationToken,
    ) -> AppResult<StepOutcome> {
        self.steps.lock().unwrap().push(step);
        Ok(StepOutcome::Continue)
    }
}

fn scheduler(store: &MemoryStore, analysis: &Scripted, settings: &AnalysisSettings) -> MachineScheduler {
    MachineScheduler::new(Box::new(analysis.clone()), Arc::new(store.clone()), settings)
}

#[tokio::test]
async fn test_production_change_switches_graph_on_next_iteration() {
    let store = MemoryStore::new();
    let analysis = Scripted::default();
    let mut scheduler = scheduler(&store, &analysis, &AnalysisSettings::default());
    let cancel = CancellationToken::new();

    scheduler.run_iteration(&cancel).await.unwrap();
    assert_eq!(scheduler.handle().status().mode, AnalysisMode::NotProducing);
    assert_eq!(analysis.take_steps()[0], AnalysisStep::Activity);

    analysis.producing.store(true, Ordering::SeqCst);
    scheduler.run_iteration(&cancel).await.unwrap();
    assert_eq!(scheduler.handle().status().mode, AnalysisMode::Producing);
    assert_eq!(analysis.take_steps()[0], AnalysisStep::MachineStateTemplate);
    assert_eq!(scheduler.handle().status().iterations, 2);
}

#[tokio::test]
async fn test_catch_up_runs_once() {
    let store = MemoryStore::new();
    request_catch_up(&store, 7).unwrap();
    assert!(store.application_state(&catch_up_key(7)).is_some());

    let analysis = Scripted::default();
    let cancel = CancellationToken::new();
    let mut first = scheduler(&store, &analysis, &AnalysisSettings::default());
    first.run_iteration(&cancel).await.unwrap();
    assert_eq!(first.handle().status().mode, AnalysisMode::CatchUp);
    assert!(!first.is_catch_up_pending());
    assert!(store.application_state(&catch_up_key(7)).is_none());
    let steps = analysis.take_steps();
    assert!(steps.contains(&AnalysisStep::MachineStateTemplate));
    assert!(steps.contains(&AnalysisStep::Production));

    // Next iteration of the same loop, then a cold start: both skip catch-up
    first.run_iteration(&cancel).await.unwrap();
    assert_eq!(first.handle().status().mode, AnalysisMode::NotProducing);
    let mut restarted = scheduler(&store, &analysis, &AnalysisSettings::default());
    restarted.run_iteration(&cancel).await.unwrap();
    assert_eq!(restarted.handle().status().mode, AnalysisMode::NotProducing);
}

#[tokio::test]
async fn test_new_data_wakes_an_idle_loop() {
    let store = MemoryStore::new();
    let analysis = Scripted::default();
    let notifier = MachineNotifier::new();
    let settings = AnalysisSettings {
        idle_sleep: Duration::from_secs(3600),
        ..AnalysisSettings::default()
    };
    let scheduler = scheduler(&store, &analysis, &settings).with_wake(notifier.subscribe(7));
    let handle = scheduler.handle();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(cancel.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while handle.status().iterations < 1 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.status().iterations, 1);

    notifier.notify(7);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while handle.status().iterations < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.status().iterations, 2);

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(handle.status().mode, AnalysisMode::Stopped);
}

#[tokio::test]
async fn test_pause_request_holds_the_loop() {
    let store = MemoryStore::new();
    let analysis = Scripted::default();
    let settings = AnalysisSettings {
        idle_sleep: Duration::from_millis(10),
        ..AnalysisSettings::default()
    };
    let scheduler = scheduler(&store, &analysis, &settings);
    let handle = scheduler.handle();
    assert!(handle.pause().request_pause(42));

    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.status().mode, AnalysisMode::Paused);
    assert!(analysis.take_steps().is_empty());

    assert!(handle.pause().release_pause(42));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.status().iterations > 0);

    cancel.cancel();
    task.await.unwrap().unwrap();
}
