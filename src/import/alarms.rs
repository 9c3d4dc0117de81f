//! Consolidation of alarm scans into alarm periods.
//!
//! A `CncAlarm` record is one scan of the controller: every alarm active at its
//! timestamp (a `Null` payload is a scan without alarm). Consecutive identical
//! scans are merged into one batch, so a batch spans `[start, end]` with one alarm
//! set.

use super::RecordImporter;
use crate::cache::AlarmCache;
use crate::error::AppResult;
use crate::model::{AcquisitionStateKey, Alarm, AlarmKey};
use crate::persistence::{in_transaction, Session, Store};
use crate::queue::{AlarmDescriptor, ExchangeRecord};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Imports `CncAlarm` records of one machine module.
pub struct AlarmImporter {
    store: Arc<dyn Store>,
    cache: AlarmCache,
    max_alarm_gap: Duration,
}

impl AlarmImporter {
    /// New importer owning `cache`.
    pub fn new(store: Arc<dyn Store>, cache: AlarmCache, max_alarm_gap: Duration) -> Self {
        Self {
            store,
            cache,
            max_alarm_gap,
        }
    }

    /// Cache of the module.
    pub fn cache(&self) -> &AlarmCache {
        &self.cache
    }

    fn import_alarms(
        &mut self,
        alarms: Vec<&AlarmDescriptor>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<()> {
        let module = self.cache.module();
        let mut scan: Vec<(AlarmKey, AlarmDescriptor)> = Vec::new();
        let mut keep: Vec<AlarmKey> = Vec::new();
        for descriptor in alarms {
            let key = AlarmKey::from(descriptor);
            if !keep.contains(&key) {
                keep.push(key.clone());
            }
            if let Some(cached) = self.cache.get(&key) {
                if cached.end > start {
                    error!(
                        fatal = true,
                        %module,
                        alarm = %key,
                        cached_end = %cached.end,
                        %start,
                        "scan starts before the cached alarm end, alarm skipped"
                    );
                    continue;
                }
                let gap = (start - cached.end).to_std().unwrap_or_default();
                if gap > self.max_alarm_gap {
                    debug!(%module, alarm = %key, ?gap, "gap too long, alarm discontinued");
                    self.cache.reset(&key);
                }
            }
            match scan.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = descriptor.clone(),
                None => scan.push((key, descriptor.clone())),
            }
        }

        // Skipped alarms stay active: still reported by the controller.
        self.cache.clear(&keep);

        let cache = &mut self.cache;
        let result = in_transaction(self.store.as_ref(), "CncData.ImportCncAlarm", |session| {
            for (key, descriptor) in &scan {
                process_alarm(cache, session, key, descriptor, start, end)?;
            }
            Ok(())
        });

        if let Err(e) = &result {
            error!(%module, error = %e, "alarm import failed, cache reloaded");
            match self.store.open_session() {
                Ok(mut session) => self.cache.reload_all(session.as_mut()),
                Err(_) => self.cache.clear(&[]),
            }
        }
        result
    }
}

fn process_alarm(
    cache: &mut AlarmCache,
    session: &mut dyn Session,
    key: &AlarmKey,
    descriptor: &AlarmDescriptor,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> AppResult<()> {
    let mut alarm = match cache.get(key).cloned() {
        Some(alarm) if alarm.key != *key => {
            error!(
                module = %cache.module(),
                alarm = %key,
                cached = %alarm.key,
                "cached alarm has another key, evicted"
            );
            cache.reset(key);
            Alarm::from_descriptor(cache.module(), descriptor, start, end)
        }
        Some(mut alarm) => {
            debug_assert!(alarm.end <= start);
            alarm.end = end;
            alarm
        }
        None => Alarm::from_descriptor(cache.module(), descriptor, start, end),
    };

    if alarm.key.kind.is_empty() {
        error!(module = %cache.module(), alarm = %key, "alarm without type, not persisted");
        return Ok(());
    }
    session.save_alarm(&mut alarm)?;
    cache.set(alarm);
    Ok(())
}

impl RecordImporter for AlarmImporter {
    fn is_mergeable(&mut self, next: &ExchangeRecord, previous: &ExchangeRecord) -> bool {
        match (next.payload.alarms(), previous.payload.alarms()) {
            (Some(a), Some(b)) if a == b => {
                let gap = (next.timestamp - previous.timestamp).to_std().unwrap_or_default();
                gap <= self.max_alarm_gap
            }
            (None, None) => true,
            _ => false,
        }
    }

    fn import(&mut self, records: &[ExchangeRecord]) -> AppResult<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let start = records.iter().map(|r| r.timestamp).min().unwrap_or(first.timestamp);
        let end = records.iter().map(|r| r.timestamp).max().unwrap_or(first.timestamp);

        match first.payload.alarms() {
            Some(alarms) if !alarms.is_empty() => self.import_alarms(alarms, start, end)?,
            Some(_) => self.cache.clear(&[]),
            None => {
                warn!(module = %self.cache.module(), record = %first, "not an alarm payload, treated as no alarm");
                self.cache.clear(&[]);
            }
        }

        let module = self.cache.module();
        in_transaction(self.store.as_ref(), "CncData.UpdateAlarmAcquisitionState", |session| {
            session.set_acquisition_state(module, AcquisitionStateKey::Alarms, end)
        })
    }
}
