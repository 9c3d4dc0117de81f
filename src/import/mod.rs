//! Drains the queue bus into the consolidation layer.
//!
//! One [`QueueImporter`] per machine module peeks a batch from its
//! [`MachineQueueSet`](crate::queue::MachineQueueSet), groups the leading compatible
//! records, hands the group to the importer of its kind, and only then removes the
//! group from the queue. A record is therefore never dequeued before its effect is
//! committed; a crash in between re-imports it, which the consolidation rules
//! tolerate.
//!
//! | Record kind                 | Importer           |
//! |-----------------------------|--------------------|
//! | `CncValue`, `StopCncValue`  | [`ValueImporter`]  |
//! | `CncAlarm`                  | [`AlarmImporter`]  |
//! | everything else             | [`EventImporter`]  |

pub mod aggregate;
pub mod alarms;
pub mod consumer;
pub mod events;
pub mod values;

pub use alarms::AlarmImporter;
pub use consumer::QueueImporter;
pub use events::EventImporter;
pub use values::{ValueImportExtension, ValueImporter};

use crate::error::AppResult;
use crate::queue::ExchangeRecord;

/// Consolidation of one family of record kinds.
pub trait RecordImporter: Send {
    /// Whether `next` can be imported in the same batch as `previous`, which
    /// precedes it in the queue. Both have the same module and kind.
    fn is_mergeable(&mut self, next: &ExchangeRecord, previous: &ExchangeRecord) -> bool;

    /// Import a batch of mergeable records.
    ///
    /// On error nothing of the batch is committed and the records stay queued.
    fn import(&mut self, records: &[ExchangeRecord]) -> AppResult<()>;
}
