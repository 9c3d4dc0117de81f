//! Queue bus: durable, ordered, per-machine sub-queues.
//!
//! Acquisition workers and the import loop never talk to each other directly: the
//! workers append [`ExchangeRecord`]s to the sub-queue of their category and the
//! consumer drains each sub-queue independently, so a slow consumer of one telemetry
//! category never blocks another.
//!
//! # Structure
//!
//! - [`record`]: the exchange record and its kinds/payloads
//! - [`category`]: the fixed 11-queue set and the value-class table
//! - [`memory`] / [`file`]: volatile and persistent [`DurableQueue`] backends
//! - [`bus`]: the [`QueueBus`] registry (`create_or_open`, inspection)
//! - [`machine_set`]: the routed per-machine-module [`MachineQueueSet`]
//!
//! # Naming
//!
//! A queue is named `{prefix}{suffix}-{machineId}` with `-{moduleId}` appended when the
//! module id is not 0, e.g. `SingleValue2-7` or `SingleAlarm-7-2`.
//!
//! # Errors
//!
//! Reads on an empty queue fail with [`PipelineError::EmptyQueue`]; a transport that
//! cannot be reached fails with [`PipelineError::QueueUnavailable`]. Callers must tell
//! the two apart: the first is the normal idle state.

pub mod bus;
pub mod category;
pub mod file;
pub mod machine_set;
pub mod memory;
pub mod record;

pub use bus::{QueueBus, QueueInfo};
pub use category::QueueCategory;
pub use machine_set::MachineQueueSet;
pub use record::{AlarmDescriptor, ExchangeRecord, Payload, RecordKind};

use crate::error::{AppResult, PipelineError};
use std::sync::Arc;
use tracing::error;

/// FIFO queue of exchange records.
///
/// Implementations are internally synchronised: one producer and one consumer may
/// share a queue through an `Arc`.
pub trait DurableQueue: Send + Sync {
    /// Queue name.
    fn name(&self) -> &str;

    /// Number of records waiting.
    fn count(&self) -> AppResult<usize>;

    /// Append a record.
    fn enqueue(&self, record: &ExchangeRecord) -> AppResult<()>;

    /// Oldest record, without removing it.
    fn peek(&self) -> AppResult<ExchangeRecord> {
        let mut records = self.peek_n(1)?;
        records.pop().ok_or_else(|| PipelineError::EmptyQueue {
            queue: self.name().to_string(),
        })
    }

    /// Up to `n` oldest records, without removing them.
    fn peek_n(&self, n: usize) -> AppResult<Vec<ExchangeRecord>>;

    /// Remove and return the oldest record.
    fn dequeue(&self) -> AppResult<ExchangeRecord>;

    /// Remove up to `n` records without returning them; returns the number removed.
    fn unsafe_dequeue(&self, n: usize) -> AppResult<usize>;

    /// Remove every record.
    fn clear(&self) -> AppResult<()>;

    /// Remove the queue and its storage.
    fn delete(&self) -> AppResult<()>;

    /// Compact the backing storage if enough records were consumed.
    fn vacuum_if_needed(&self) -> AppResult<bool> {
        Ok(false)
    }
}

/// Options of one logical queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Name prefix
    pub prefix: String,
    /// Name suffix (category)
    pub suffix: String,
    /// Keep content across restarts
    pub persistent: bool,
    /// Refuse enqueue on this handle
    pub receive_only: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "Single".to_string(),
            suffix: String::new(),
            persistent: false,
            receive_only: false,
        }
    }
}

impl QueueConfig {
    /// Config with the given suffix.
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Queue name for a machine module.
    pub fn queue_name(&self, machine_id: u32, module_id: u32) -> String {
        queue_name(&self.prefix, &self.suffix, machine_id, module_id)
    }
}

/// `{prefix}{suffix}-{machineId}[-{moduleId}]`
pub fn queue_name(prefix: &str, suffix: &str, machine_id: u32, module_id: u32) -> String {
    if module_id == 0 {
        format!("{}{}-{}", prefix, suffix, machine_id)
    } else {
        format!("{}{}-{}-{}", prefix, suffix, machine_id, module_id)
    }
}

pub(crate) fn empty(queue: &str) -> PipelineError {
    PipelineError::EmptyQueue {
        queue: queue.to_string(),
    }
}

pub(crate) fn unavailable(queue: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::QueueUnavailable {
        queue: queue.to_string(),
        reason: reason.into(),
    }
}

pub(crate) fn report_short_dequeue(queue: &str, requested: usize, removed: usize) {
    if removed < requested {
        error!(
            queue,
            requested, removed, "unsafe dequeue removed fewer records than requested"
        );
    }
}

/// Handle that refuses writes on top of a shared queue.
pub struct ReceiveOnlyQueue {
    inner: Arc<dyn DurableQueue>,
}

impl ReceiveOnlyQueue {
    /// Wrap a queue.
    pub fn new(inner: Arc<dyn DurableQueue>) -> Self {
        Self { inner }
    }
}

impl DurableQueue for ReceiveOnlyQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn count(&self) -> AppResult<usize> {
        self.inner.count()
    }

    fn enqueue(&self, _record: &ExchangeRecord) -> AppResult<()> {
        Err(PipelineError::ReadOnlyQueue {
            queue: self.name().to_string(),
        })
    }

    fn peek_n(&self, n: usize) -> AppResult<Vec<ExchangeRecord>> {
        self.inner.peek_n(n)
    }

    fn dequeue(&self) -> AppResult<ExchangeRecord> {
        self.inner.dequeue()
    }

    fn unsafe_dequeue(&self, n: usize) -> AppResult<usize> {
        self.inner.unsafe_dequeue(n)
    }

    fn clear(&self) -> AppResult<()> {
        self.inner.clear()
    }

    fn delete(&self) -> AppResult<()> {
        self.inner.delete()
    }

    fn vacuum_if_needed(&self) -> AppResult<bool> {
        self.inner.vacuum_if_needed()
    }
}
