//! Per machine-module import loop.

use super::{AlarmImporter, EventImporter, RecordImporter, ValueImportExtension, ValueImporter};
use crate::cache::{AlarmCache, SegmentCloseRule, ValueCache};
use crate::config::{CacheSettings, ImportSettings};
use crate::error::{AppResult, PipelineError};
use crate::model::ModuleRef;
use crate::notifier::MachineNotifier;
use crate::persistence::Store;
use crate::queue::{ExchangeRecord, MachineQueueSet, QueueCategory, RecordKind};
use crate::supervisor::{cancellable_sleep, LivenessHandle};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Drains the queue set of one machine module into the consolidation layer.
pub struct QueueImporter {
    module: ModuleRef,
    queues: Arc<MachineQueueSet>,
    settings: ImportSettings,
    values: ValueImporter,
    alarms: AlarmImporter,
    events: EventImporter,
    notifier: Option<Arc<MachineNotifier>>,
    liveness: LivenessHandle,
    last_break: Instant,
    last_machine_mode_visit: Instant,
    /// Sub-queue where the "not enough data" deferral started
    deferral_start: Option<usize>,
}

impl QueueImporter {
    /// Importer of `queues` with fresh caches.
    pub fn new(
        queues: Arc<MachineQueueSet>,
        store: Arc<dyn Store>,
        import: &ImportSettings,
        cache: &CacheSettings,
        close_rules: &[Arc<dyn SegmentCloseRule>],
    ) -> Self {
        let module = ModuleRef::new(queues.machine_id(), queues.module_id());
        let liveness = LivenessHandle::new();

        let value_cache = close_rules
            .iter()
            .fold(ValueCache::new(module, cache.max_gap), |cache, rule| {
                cache.with_rule(rule.clone())
            });
        let values =
            ValueImporter::new(store.clone(), value_cache, import).with_liveness(liveness.clone());
        let alarms = AlarmImporter::new(store.clone(), AlarmCache::new(module), cache.max_alarm_gap);
        let events = EventImporter::new(module, store);

        Self {
            module,
            queues,
            settings: import.clone(),
            values,
            alarms,
            events,
            notifier: None,
            liveness,
            last_break: Instant::now(),
            last_machine_mode_visit: Instant::now(),
            deferral_start: None,
        }
    }

    /// Publish "data imported" on `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<MachineNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Register a value-import extension.
    pub fn with_value_extension(mut self, extension: Arc<dyn ValueImportExtension>) -> Self {
        self.values = self.values.with_extension(extension);
        self
    }

    /// Module drained by this importer.
    pub fn module(&self) -> ModuleRef {
        self.module
    }

    /// Liveness of the loop, for the watchdog.
    pub fn liveness(&self) -> LivenessHandle {
        self.liveness.clone()
    }

    fn importer_for(&mut self, kind: RecordKind) -> &mut dyn RecordImporter {
        match kind {
            RecordKind::CncValue | RecordKind::StopCncValue => &mut self.values,
            RecordKind::CncAlarm => &mut self.alarms,
            _ => &mut self.events,
        }
    }

    fn is_compatible(&mut self, batch: &[ExchangeRecord], next: &ExchangeRecord) -> bool {
        let Some(last) = batch.last() else {
            return true;
        };
        if (last.machine_id, last.module_id) != (next.machine_id, next.module_id) {
            return false;
        }
        if last.kind != next.kind {
            return false;
        }
        self.importer_for(next.kind).is_mergeable(next, last)
    }

    /// Import everything currently available; returns the number of records imported.
    pub async fn import_available(&mut self, cancel: &CancellationToken) -> AppResult<usize> {
        let mut imported = 0;
        self.last_break = Instant::now();
        self.deferral_start = None;
        self.queues.reset();

        while !cancel.is_cancelled() {
            self.liveness.set_active();
            self.take_break(cancel).await;

            let peeked = match self.queues.peek_n(self.settings.fetch_data_number) {
                Ok(records) => records,
                Err(PipelineError::EmptyQueue { .. }) => break,
                Err(e) => return Err(e),
            };
            let Some(oldest) = peeked.first().map(|r| r.timestamp) else {
                break;
            };

            let now = Utc::now();
            let age = (now - oldest).to_std().unwrap_or_default();
            if peeked.len() < self.settings.min_batch && oldest <= now && age < self.settings.process_after {
                debug!(
                    module = %self.module,
                    count = peeked.len(),
                    min_batch = self.settings.min_batch,
                    ?age,
                    "not enough data yet"
                );
                let current = self.queues.current_queue_index();
                match self.deferral_start {
                    None => self.deferral_start = current,
                    Some(start) if Some(start) == current => {
                        // Every sub-queue was visited
                        self.deferral_start = None;
                        break;
                    }
                    Some(_) => {}
                }
                self.queues.move_next_queue();
                continue;
            }
            self.deferral_start = None;

            let mut batch: Vec<ExchangeRecord> = Vec::with_capacity(peeked.len());
            for record in peeked {
                if !self.is_compatible(&batch, &record) {
                    break;
                }
                batch.push(record);
            }

            self.try_import(&batch, cancel).await?;
            if QueueCategory::for_record(&batch[0]) == QueueCategory::MachineMode {
                self.last_machine_mode_visit = Instant::now();
            }
            self.dequeue(&batch)?;
            imported += batch.len();

            if self.last_machine_mode_visit.elapsed() > self.settings.visit_machine_modes_every {
                debug!(module = %self.module, "machine modes not visited recently, priority restored");
                self.last_machine_mode_visit = Instant::now();
                self.queues.reset();
            }
        }

        if imported > 0 {
            if let Some(notifier) = &self.notifier {
                notifier.notify(self.module.machine_id);
            }
        }
        Ok(imported)
    }

    async fn try_import(&mut self, batch: &[ExchangeRecord], cancel: &CancellationToken) -> AppResult<()> {
        let mut attempt = 0;
        loop {
            let kind = batch[0].kind;
            match self.importer_for(kind).import(batch) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt > self.settings.max_attempts {
                        warn!(module = %self.module, %kind, attempt, error = %e, "max attempts reached, give up");
                        return Err(e);
                    }
                    info!(module = %self.module, %kind, attempt, error = %e, "transient failure, retry");
                    if cancellable_sleep(self.settings.retry_sleep, cancel).await {
                        return Err(PipelineError::Cancelled);
                    }
                }
                Err(e) => {
                    error!(module = %self.module, %kind, error = %e, "import failed");
                    return Err(e);
                }
            }
        }
    }

    /// Remove an imported batch from its sub-queue.
    fn dequeue(&self, batch: &[ExchangeRecord]) -> AppResult<()> {
        match self.queues.unsafe_dequeue(batch.len()) {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(module = %self.module, count = batch.len(), error = %e, "bulk dequeue failed, dequeue one by one");
                for expected in batch {
                    let dequeued = self.queues.dequeue()?;
                    if dequeued != *expected {
                        error!(
                            fatal = true,
                            module = %self.module,
                            %dequeued,
                            %expected,
                            "dequeued record differs from the imported one, dequeue stopped"
                        );
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    async fn take_break(&mut self, cancel: &CancellationToken) {
        if self.last_break.elapsed() >= self.settings.break_frequency {
            cancellable_sleep(self.settings.break_time, cancel).await;
            self.last_break = Instant::now();
            self.liveness.set_active();
        }
    }

    /// Import until cancelled, sleeping between drains and vacuuming when idle.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(module = %self.module, queues = ?self.queues.queue_names(), "queue import started");
        self.liveness.set_active();

        while !cancel.is_cancelled() {
            match self.import_available(&cancel).await {
                Ok(0) => {}
                Ok(count) => debug!(module = %self.module, count, "records imported"),
                Err(PipelineError::Cancelled) => break,
                Err(e) if e.is_transient() => warn!(module = %self.module, error = %e, "import interrupted, retry later"),
                Err(e) => error!(module = %self.module, error = %e, "import failed, retry later"),
            }

            self.liveness.set_active();
            match self.queues.vacuum_if_needed() {
                Ok(true) => info!(module = %self.module, "queues vacuumed"),
                Ok(false) => {}
                Err(e) => error!(module = %self.module, error = %e, "vacuum failed, continue"),
            }

            if cancellable_sleep(self.settings.sleep, &cancel).await {
                break;
            }
        }

        self.liveness.set_exited();
        info!(module = %self.module, "queue import stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::model::{Aggregation, Field, FieldType};
    use crate::persistence::MemoryStore;
    use crate::queue::{Payload, QueueBus};
    use chrono::Duration as ChronoDuration;

    fn setup() -> (MemoryStore, Arc<MachineQueueSet>, QueueImporter) {
        let store = MemoryStore::new();
        store.insert_field(Field::new(2, "SpindleSpeed", Aggregation::NewValue, FieldType::Int));
        let bus = QueueBus::new(QueueSettings::default());
        let queues = bus.machine_set(7, 0).unwrap();
        let importer = QueueImporter::new(
            queues.clone(),
            Arc::new(store.clone()),
            &ImportSettings::default(),
            &CacheSettings::default(),
            &[],
        );
        (store, queues, importer)
    }

    #[tokio::test]
    async fn test_drains_every_category() {
        let (store, queues, mut importer) = setup();
        let t0 = Utc::now() - ChronoDuration::minutes(5);
        queues.enqueue(&ExchangeRecord::machine_mode(7, 0, t0, 1)).unwrap();
        for s in 0..3 {
            queues
                .enqueue(&ExchangeRecord::value(
                    7,
                    0,
                    t0 + ChronoDuration::seconds(s),
                    "SpindleSpeed",
                    Payload::Int(1000),
                ))
                .unwrap();
        }

        let imported = importer.import_available(&CancellationToken::new()).await.unwrap();
        assert_eq!(imported, 4);
        assert_eq!(queues.count().unwrap(), 0);
        assert_eq!(store.events().len(), 1);
        assert_eq!(store.segments(ModuleRef::new(7, 0), 2).len(), 1);
    }

    #[tokio::test]
    async fn test_recent_small_batch_is_deferred() {
        let store = MemoryStore::new();
        let bus = QueueBus::new(QueueSettings::default());
        let queues = bus.machine_set(7, 0).unwrap();
        let settings = ImportSettings {
            min_batch: 10,
            ..ImportSettings::default()
        };
        let mut importer = QueueImporter::new(
            queues.clone(),
            Arc::new(store),
            &settings,
            &CacheSettings::default(),
            &[],
        );
        queues.enqueue(&ExchangeRecord::machine_mode(7, 0, Utc::now(), 1)).unwrap();

        let imported = importer.import_available(&CancellationToken::new()).await.unwrap();
        assert_eq!(imported, 0);
        assert_eq!(queues.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_notifies_after_import() {
        let (_store, queues, importer) = setup();
        let notifier = Arc::new(MachineNotifier::new());
        let listener = notifier.subscribe(7);
        let mut importer = importer.with_notifier(notifier);
        queues.enqueue(&ExchangeRecord::machine_mode(7, 0, Utc::now(), 1)).unwrap();
        importer.import_available(&CancellationToken::new()).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(100), listener.notified())
            .await
            .unwrap();
    }
}
