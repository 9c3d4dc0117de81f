//! In-memory [`Store`], used by the binary's demo mode and by the tests.
//!
//! A transaction works on a private copy of the tables and journals its writes;
//! commit replays the journal on the shared tables, so concurrent sessions of
//! different machines do not overwrite each other. A `(module, field, begin)`
//! uniqueness constraint is enforced on segments, like the relational schema does.

use super::{Session, Store};
use crate::error::{AppResult, PipelineError};
use crate::model::{AcquisitionStateKey, Alarm, Field, ModuleRef, Segment};
use crate::queue::ExchangeRecord;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

/// Operation where a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// `open_session`
    OpenSession,
    /// `commit`
    Commit,
    /// `save_segment`
    SaveSegment,
    /// `save_alarm`
    SaveAlarm,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    fields: BTreeMap<String, Field>,
    segments: BTreeMap<u64, Segment>,
    alarms: BTreeMap<u64, Alarm>,
    acquisition: BTreeMap<(ModuleRef, AcquisitionStateKey), DateTime<Utc>>,
    application: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
enum Write {
    SaveSegment(Segment),
    DeleteSegment(u64),
    SaveAlarm(Alarm),
    SetAcquisition(ModuleRef, AcquisitionStateKey, DateTime<Utc>),
    SetApplication(String, serde_json::Value),
    DeleteApplication(String),
    Event(ExchangeRecord),
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    events: Mutex<Vec<ExchangeRecord>>,
    failures: Mutex<HashMap<FailPoint, Vec<bool>>>,
    next_id: AtomicU64,
}

/// Store keeping everything in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a field in the catalogue.
    pub fn insert_field(&self, field: Field) {
        if let Ok(mut tables) = self.shared.tables.lock() {
            tables.fields.insert(field.code.clone(), field);
        }
    }

    /// Make the next call at `point` fail (transient or permanent).
    pub fn fail_next(&self, point: FailPoint, transient: bool) {
        if let Ok(mut failures) = self.shared.failures.lock() {
            failures.entry(point).or_default().push(transient);
        }
    }

    /// Committed segments of a field, ordered by begin.
    pub fn segments(&self, module: ModuleRef, field_id: u32) -> Vec<Segment> {
        let Ok(tables) = self.shared.tables.lock() else {
            return Vec::new();
        };
        let mut segments: Vec<Segment> = tables
            .segments
            .values()
            .filter(|s| s.module == module && s.field_id == field_id)
            .cloned()
            .collect();
        segments.sort_by_key(|s| s.begin);
        segments
    }

    /// Committed alarms of a module, ordered by begin.
    pub fn alarms(&self, module: ModuleRef) -> Vec<Alarm> {
        let Ok(tables) = self.shared.tables.lock() else {
            return Vec::new();
        };
        let mut alarms: Vec<Alarm> = tables
            .alarms
            .values()
            .filter(|a| a.module == module)
            .cloned()
            .collect();
        alarms.sort_by(|a, b| a.begin.cmp(&b.begin).then_with(|| a.key.cmp(&b.key)));
        alarms
    }

    /// Committed events.
    pub fn events(&self) -> Vec<ExchangeRecord> {
        self.shared
            .events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Committed acquisition state.
    pub fn acquisition_state(
        &self,
        module: ModuleRef,
        key: AcquisitionStateKey,
    ) -> Option<DateTime<Utc>> {
        self.shared
            .tables
            .lock()
            .ok()
            .and_then(|t| t.acquisition.get(&(module, key)).copied())
    }

    /// Committed application state.
    pub fn application_state(&self, key: &str) -> Option<serde_json::Value> {
        self.shared
            .tables
            .lock()
            .ok()
            .and_then(|t| t.application.get(key).cloned())
    }

    /// Set an application state value outside any transaction (administration).
    pub fn set_application_state(&self, key: &str, value: serde_json::Value) {
        if let Ok(mut tables) = self.shared.tables.lock() {
            tables.application.insert(key.to_string(), value);
        }
    }

    fn take_failure(&self, point: FailPoint) -> AppResult<()> {
        let mut failures = self
            .shared
            .failures
            .lock()
            .map_err(|_| PipelineError::Persistence("failure registry poisoned".into()))?;
        match failures.get_mut(&point) {
            Some(queue) if !queue.is_empty() => {
                let transient = queue.remove(0);
                let message = format!("injected failure at {:?}", point);
                Err(if transient {
                    PipelineError::TransientPersistence(message)
                } else {
                    PipelineError::Persistence(message)
                })
            }
            _ => Ok(()),
        }
    }
}

impl Store for MemoryStore {
    fn open_session(&self) -> AppResult<Box<dyn Session>> {
        self.take_failure(FailPoint::OpenSession)?;
        Ok(Box::new(MemorySession {
            store: self.clone(),
            transaction: None,
        }))
    }
}

struct Transaction {
    name: String,
    tables: Tables,
    journal: Vec<Write>,
}

/// Session of a [`MemoryStore`].
pub struct MemorySession {
    store: MemoryStore,
    transaction: Option<Transaction>,
}

impl MemorySession {
    fn shared_tables(&self) -> AppResult<MutexGuard<'_, Tables>> {
        self.store
            .shared
            .tables
            .lock()
            .map_err(|_| PipelineError::Persistence("tables poisoned".into()))
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> AppResult<T> {
        match &self.transaction {
            Some(tx) => Ok(f(&tx.tables)),
            None => Ok(f(&*self.shared_tables()?)),
        }
    }

    fn write<T>(&mut self, operation: &str, f: impl FnOnce(&mut Transaction) -> AppResult<T>) -> AppResult<T> {
        match self.transaction.as_mut() {
            Some(tx) => f(tx),
            None => Err(PipelineError::Persistence(format!(
                "{} outside of a transaction",
                operation
            ))),
        }
    }

    fn next_id(&self) -> u64 {
        self.store.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Session for MemorySession {
    fn begin_transaction(&mut self, name: &str) -> AppResult<()> {
        if let Some(tx) = &self.transaction {
            return Err(PipelineError::Persistence(format!(
                "transaction {} already open, cannot begin {}",
                tx.name, name
            )));
        }
        let tables = self.shared_tables()?.clone();
        trace!(transaction = name, "begin");
        self.transaction = Some(Transaction {
            name: name.to_string(),
            tables,
            journal: Vec::new(),
        });
        Ok(())
    }

    fn commit(&mut self) -> AppResult<()> {
        let tx = self
            .transaction
            .take()
            .ok_or_else(|| PipelineError::Persistence("commit without transaction".into()))?;
        self.store.take_failure(FailPoint::Commit)?;

        let mut tables = self.shared_tables()?;
        let mut events = Vec::new();
        for write in tx.journal {
            match write {
                Write::SaveSegment(s) => {
                    if let Some(id) = s.id {
                        tables.segments.insert(id, s);
                    }
                }
                Write::DeleteSegment(id) => {
                    tables.segments.remove(&id);
                }
                Write::SaveAlarm(a) => {
                    if let Some(id) = a.id {
                        tables.alarms.insert(id, a);
                    }
                }
                Write::SetAcquisition(m, k, at) => {
                    tables.acquisition.insert((m, k), at);
                }
                Write::SetApplication(k, v) => {
                    tables.application.insert(k, v);
                }
                Write::DeleteApplication(k) => {
                    tables.application.remove(&k);
                }
                Write::Event(r) => events.push(r),
            }
        }
        drop(tables);
        if !events.is_empty() {
            self.store
                .shared
                .events
                .lock()
                .map_err(|_| PipelineError::Persistence("events poisoned".into()))?
                .extend(events);
        }
        trace!(transaction = %tx.name, "commit");
        Ok(())
    }

    fn rollback(&mut self) {
        if let Some(tx) = self.transaction.take() {
            trace!(transaction = %tx.name, "rollback");
        }
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn find_field_by_code(&mut self, code: &str) -> AppResult<Option<Field>> {
        self.read(|t| t.fields.get(code).cloned())
    }

    fn find_last_segment(&mut self, module: ModuleRef, field_id: u32) -> AppResult<Option<Segment>> {
        self.read(|t| {
            t.segments
                .values()
                .filter(|s| s.module == module && s.field_id == field_id)
                .max_by_key(|s| (s.begin, s.id))
                .cloned()
        })
    }

    fn find_segment(&mut self, id: u64) -> AppResult<Option<Segment>> {
        self.read(|t| t.segments.get(&id).cloned())
    }

    fn save_segment(&mut self, segment: &mut Segment) -> AppResult<()> {
        self.store.take_failure(FailPoint::SaveSegment)?;
        let new_id = if segment.id.is_none() {
            Some(self.next_id())
        } else {
            None
        };
        self.write("save_segment", |tx| {
            if let Some(id) = new_id {
                let duplicate = tx.tables.segments.values().any(|s| {
                    s.module == segment.module
                        && s.field_id == segment.field_id
                        && s.begin == segment.begin
                });
                if duplicate {
                    return Err(PipelineError::Persistence(format!(
                        "unique constraint (module, field, begin) violated by {}",
                        segment
                    )));
                }
                segment.id = Some(id);
            }
            let stored = segment.clone();
            if let Some(id) = stored.id {
                tx.tables.segments.insert(id, stored.clone());
            }
            tx.journal.push(Write::SaveSegment(stored));
            Ok(())
        })
    }

    fn delete_zero_length_segments(
        &mut self,
        module: ModuleRef,
        field_id: u32,
        begin: DateTime<Utc>,
    ) -> AppResult<usize> {
        self.write("delete_zero_length_segments", |tx| {
            let ids: Vec<u64> = tx
                .tables
                .segments
                .iter()
                .filter(|(_, s)| {
                    s.module == module && s.field_id == field_id && s.begin == begin && s.end == begin
                })
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                tx.tables.segments.remove(id);
                tx.journal.push(Write::DeleteSegment(*id));
            }
            Ok(ids.len())
        })
    }

    fn find_alarm(&mut self, id: u64) -> AppResult<Option<Alarm>> {
        self.read(|t| t.alarms.get(&id).cloned())
    }

    fn save_alarm(&mut self, alarm: &mut Alarm) -> AppResult<()> {
        self.store.take_failure(FailPoint::SaveAlarm)?;
        let new_id = if alarm.id.is_none() {
            Some(self.next_id())
        } else {
            None
        };
        self.write("save_alarm", |tx| {
            if let Some(id) = new_id {
                alarm.id = Some(id);
            }
            let stored = alarm.clone();
            if let Some(id) = stored.id {
                tx.tables.alarms.insert(id, stored.clone());
            }
            tx.journal.push(Write::SaveAlarm(stored));
            Ok(())
        })
    }

    fn acquisition_state(
        &mut self,
        module: ModuleRef,
        key: AcquisitionStateKey,
    ) -> AppResult<Option<DateTime<Utc>>> {
        self.read(|t| t.acquisition.get(&(module, key)).copied())
    }

    fn set_acquisition_state(
        &mut self,
        module: ModuleRef,
        key: AcquisitionStateKey,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.write("set_acquisition_state", |tx| {
            tx.tables.acquisition.insert((module, key), at);
            tx.journal.push(Write::SetAcquisition(module, key, at));
            Ok(())
        })
    }

    fn application_state(&mut self, key: &str) -> AppResult<Option<serde_json::Value>> {
        self.read(|t| t.application.get(key).cloned())
    }

    fn set_application_state(&mut self, key: &str, value: serde_json::Value) -> AppResult<()> {
        self.write("set_application_state", |tx| {
            tx.tables.application.insert(key.to_string(), value.clone());
            tx.journal.push(Write::SetApplication(key.to_string(), value));
            Ok(())
        })
    }

    fn delete_application_state(&mut self, key: &str) -> AppResult<bool> {
        self.write("delete_application_state", |tx| {
            let existed = tx.tables.application.remove(key).is_some();
            tx.journal.push(Write::DeleteApplication(key.to_string()));
            Ok(existed)
        })
    }

    fn save_event(&mut self, record: &ExchangeRecord) -> AppResult<()> {
        self.write("save_event", |tx| {
            tx.journal.push(Write::Event(record.clone()));
            Ok(())
        })
    }
}
