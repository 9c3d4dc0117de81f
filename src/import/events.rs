//! Records without a consolidation of their own.

use super::RecordImporter;
use crate::error::AppResult;
use crate::model::ModuleRef;
use crate::persistence::{in_transaction, Store};
use crate::queue::ExchangeRecord;
use std::sync::Arc;
use tracing::debug;

/// Stores machine modes, stamps, actions, detections and milestones as they come.
pub struct EventImporter {
    module: ModuleRef,
    store: Arc<dyn Store>,
}

impl EventImporter {
    /// New importer for `module`.
    pub fn new(module: ModuleRef, store: Arc<dyn Store>) -> Self {
        Self { module, store }
    }
}

impl RecordImporter for EventImporter {
    fn is_mergeable(&mut self, next: &ExchangeRecord, previous: &ExchangeRecord) -> bool {
        next.timestamp >= previous.timestamp
    }

    fn import(&mut self, records: &[ExchangeRecord]) -> AppResult<()> {
        in_transaction(self.store.as_ref(), "CncData.ImportEvents", |session| {
            for record in records {
                session.save_event(record)?;
            }
            Ok(())
        })?;
        debug!(module = %self.module, count = records.len(), "events imported");
        Ok(())
    }
}
