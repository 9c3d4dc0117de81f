//! Contract of the persistence collaborator.
//!
//! The pipeline never manages connections itself: each unit of work opens a
//! [`Session`] from the [`Store`], begins a named transaction, and commits or rolls
//! back around it. Writes outside a transaction are refused.
//!
//! Errors follow the crate taxonomy: [`PipelineError::TransientPersistence`] for
//! failures worth retrying (deadlock, serialization failure, lost connection) and
//! [`PipelineError::Persistence`] for everything else.
//!
//! [`PipelineError::TransientPersistence`]: crate::error::PipelineError::TransientPersistence
//! [`PipelineError::Persistence`]: crate::error::PipelineError::Persistence

pub mod memory;

pub use memory::{FailPoint, MemoryStore};

use crate::error::AppResult;
use crate::model::{AcquisitionStateKey, Alarm, Field, ModuleRef, Segment};
use crate::queue::ExchangeRecord;
use chrono::{DateTime, Utc};

/// Factory of persistence sessions.
pub trait Store: Send + Sync {
    /// Open a session for one unit of work.
    fn open_session(&self) -> AppResult<Box<dyn Session>>;
}

/// One unit of work against the backing store.
pub trait Session: Send {
    /// Begin a named transaction.
    fn begin_transaction(&mut self, name: &str) -> AppResult<()>;

    /// Commit the current transaction.
    fn commit(&mut self) -> AppResult<()>;

    /// Roll back the current transaction, if any.
    fn rollback(&mut self);

    /// Whether a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Field of a value key.
    fn find_field_by_code(&mut self, code: &str) -> AppResult<Option<Field>>;

    /// Most recent segment (by begin) of a field of a module.
    fn find_last_segment(&mut self, module: ModuleRef, field_id: u32) -> AppResult<Option<Segment>>;

    /// Segment by id.
    fn find_segment(&mut self, id: u64) -> AppResult<Option<Segment>>;

    /// Insert (assigning its id) or update a segment.
    fn save_segment(&mut self, segment: &mut Segment) -> AppResult<()>;

    /// Delete the zero-length segments of a field starting exactly at `begin`.
    fn delete_zero_length_segments(
        &mut self,
        module: ModuleRef,
        field_id: u32,
        begin: DateTime<Utc>,
    ) -> AppResult<usize>;

    /// Alarm by id.
    fn find_alarm(&mut self, id: u64) -> AppResult<Option<Alarm>>;

    /// Insert (assigning its id) or update an alarm.
    fn save_alarm(&mut self, alarm: &mut Alarm) -> AppResult<()>;

    /// Acquisition progress timestamp of a module.
    fn acquisition_state(
        &mut self,
        module: ModuleRef,
        key: AcquisitionStateKey,
    ) -> AppResult<Option<DateTime<Utc>>>;

    /// Set the acquisition progress timestamp of a module.
    fn set_acquisition_state(
        &mut self,
        module: ModuleRef,
        key: AcquisitionStateKey,
        at: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Application state value.
    fn application_state(&mut self, key: &str) -> AppResult<Option<serde_json::Value>>;

    /// Set an application state value.
    fn set_application_state(&mut self, key: &str, value: serde_json::Value) -> AppResult<()>;

    /// Delete an application state value; returns whether it existed.
    fn delete_application_state(&mut self, key: &str) -> AppResult<bool>;

    /// Store a record that has no consolidation of its own (stamps, actions, ...).
    fn save_event(&mut self, record: &ExchangeRecord) -> AppResult<()>;
}

/// Run `work` inside a named transaction of a fresh session.
///
/// Commits on success; rolls back and returns the error otherwise.
pub fn in_transaction<T>(
    store: &dyn Store,
    name: &str,
    work: impl FnOnce(&mut dyn Session) -> AppResult<T>,
) -> AppResult<T> {
    let mut session = store.open_session()?;
    session.begin_transaction(name)?;
    match work(session.as_mut()) {
        Ok(value) => {
            session.commit()?;
            Ok(value)
        }
        Err(e) => {
            session.rollback();
            Err(e)
        }
    }
}

/// Application-state key of the catch-up marker of a machine.
pub fn catch_up_key(machine_id: u32) -> String {
    format!("Analysis.CatchUp.{}", machine_id)
}

/// Application-state key of the analysis progress of a machine.
pub fn progress_key(machine_id: u32) -> String {
    format!("Analysis.Progress.{}", machine_id)
}
