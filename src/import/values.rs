//! Consolidation of value samples into segments.

use super::aggregate::{combine_average, combine_deviation, combine_max, combine_max_deviation};
use super::RecordImporter;
use crate::cache::ValueCache;
use crate::config::ImportSettings;
use crate::error::{AppResult, PipelineError};
use crate::model::{Aggregation, Field, FieldType, ModuleRef, Segment, SegmentValue};
use crate::persistence::{Session, Store};
use crate::queue::{ExchangeRecord, Payload, RecordKind};
use crate::supervisor::LivenessHandle;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Hooks called around value consolidation.
pub trait ValueImportExtension: Send + Sync {
    /// A new segment was committed.
    fn after_new_segment(&self, _field: &Field, _segment: &Segment) {}

    /// The import transaction of a field was rolled back.
    fn after_rollback(&self, _module: ModuleRef, _field_id: u32) {}
}

/// Imports `CncValue` and `StopCncValue` records of one machine module.
pub struct ValueImporter {
    module: ModuleRef,
    store: Arc<dyn Store>,
    cache: ValueCache,
    skip_old_secondary_after: Option<Duration>,
    extensions: Vec<Arc<dyn ValueImportExtension>>,
    liveness: Option<LivenessHandle>,
}

impl ValueImporter {
    /// New importer owning `cache`.
    pub fn new(store: Arc<dyn Store>, cache: ValueCache, settings: &ImportSettings) -> Self {
        let skip = settings.skip_old_secondary_after;
        Self {
            module: cache.module(),
            store,
            cache,
            skip_old_secondary_after: (skip >= Duration::from_secs(1)).then_some(skip),
            extensions: Vec::new(),
            liveness: None,
        }
    }

    /// Register an extension.
    pub fn with_extension(mut self, extension: Arc<dyn ValueImportExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Report liveness through `handle` while importing.
    pub fn with_liveness(mut self, handle: LivenessHandle) -> Self {
        self.liveness = Some(handle);
        self
    }

    /// Cache of the module.
    pub fn cache(&self) -> &ValueCache {
        &self.cache
    }

    fn touch(&self) {
        if let Some(handle) = &self.liveness {
            handle.set_active();
        }
    }

    fn import_field(
        &mut self,
        key: &str,
        records: &[ExchangeRecord],
        field_id: &mut Option<u32>,
    ) -> AppResult<()> {
        let mut session = self.store.open_session()?;
        let Some(field) = session.find_field_by_code(key)? else {
            error!(module = %self.module, key, "unknown field code, records skipped");
            return Ok(());
        };
        *field_id = Some(field.id);

        if !field.active {
            info!(module = %self.module, key, "inactive field, records skipped");
            return Ok(());
        }

        if let (Some(limit), Some(last)) = (self.skip_old_secondary_after, records.last()) {
            let age = (Utc::now() - last.timestamp).to_std().unwrap_or_default();
            if !field.is_performance && age > limit {
                info!(module = %self.module, key, at = %last.timestamp, ?limit, "old secondary value, skipped");
                return Ok(());
            }
        }

        if field.aggregation == Aggregation::None {
            warn!(module = %self.module, key, "aggregation is none, records skipped");
            return Ok(());
        }

        session.begin_transaction("CncData.ImportCncValue")?;
        match self.process(session.as_mut(), &field, records) {
            Ok(created) => {
                session.commit()?;
                for segment in &created {
                    for extension in &self.extensions {
                        extension.after_new_segment(&field, segment);
                    }
                }
                Ok(())
            }
            Err(e) => {
                session.rollback();
                Err(e)
            }
        }
    }

    /// Apply the records inside the open transaction; returns the created segments.
    fn process(
        &mut self,
        session: &mut dyn Session,
        field: &Field,
        records: &[ExchangeRecord],
    ) -> AppResult<Vec<Segment>> {
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Ok(Vec::new());
        };

        if let Some(stored) = self.cache.get_or_open_segment(session, field, first.timestamp)? {
            if first.timestamp < stored.end {
                error!(
                    fatal = true,
                    module = %self.module,
                    record = %first,
                    segment = %stored,
                    "first record precedes the stored segment end, batch skipped"
                );
                return Ok(Vec::new());
            }
        }

        if first.kind == RecordKind::StopCncValue {
            self.stop(session, field, last.timestamp)?;
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        match field.aggregation {
            Aggregation::None => {}
            Aggregation::NewValue => self.process_new_values(session, field, records, &mut created)?,
            Aggregation::Sum => created.extend(self.process_sum(session, field, records)?),
            Aggregation::Average => {
                for record in records {
                    self.touch();
                    let Some(v) = numeric(field, record) else { continue };
                    created.extend(self.process_average(session, field, v, record.timestamp)?);
                }
            }
            Aggregation::Max => {
                for record in records {
                    self.touch();
                    let Some(v) = numeric(field, record) else { continue };
                    created.extend(self.process_max(session, field, v, record.timestamp)?);
                }
            }
        }
        Ok(created)
    }

    fn stop(&mut self, session: &mut dyn Session, field: &Field, at: DateTime<Utc>) -> AppResult<()> {
        if let Some(mut segment) = self.cache.get_or_open_segment(session, field, at)? {
            segment.stopped = true;
            debug!(module = %self.module, %segment, "segment stopped");
            self.cache.save_or_update(session, &mut segment)?;
        }
        self.cache.set_previous(field.id, None);
        self.cache.set_current(field.id, None);
        Ok(())
    }

    fn process_new_values(
        &mut self,
        session: &mut dyn Session,
        field: &Field,
        records: &[ExchangeRecord],
        created: &mut Vec<Segment>,
    ) -> AppResult<()> {
        // (value, begin, end) of the run being accumulated
        let mut run: Option<(SegmentValue, DateTime<Utc>, DateTime<Utc>)> = None;
        for record in records {
            self.touch();
            let Some(value) = convert(field, record) else { continue };
            run = match run.take() {
                Some((v, begin, _)) if v.as_text() == value.as_text() => Some((v, begin, record.timestamp)),
                Some((v, begin, end)) => {
                    created.extend(self.process_new_value(session, field, v, begin, end)?);
                    Some((value, record.timestamp, record.timestamp))
                }
                None => Some((value, record.timestamp, record.timestamp)),
            };
        }
        if let Some((v, begin, end)) = run {
            created.extend(self.process_new_value(session, field, v, begin, end)?);
        }
        Ok(())
    }

    fn process_new_value(
        &mut self,
        session: &mut dyn Session,
        field: &Field,
        value: SegmentValue,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Option<Segment>> {
        if let Some(mut stored) = self.cache.get_or_open_segment(session, field, begin)? {
            stored.stopped = false;
            if stored.value.as_text() == value.as_text() {
                stored.end = end;
                self.cache.save_or_update(session, &mut stored)?;
                return Ok(None);
            }
            // A new-value segment may have a zero length.
            stored.end = begin;
            self.cache.save_or_update(session, &mut stored)?;
        }

        let mut segment = Segment::new(self.module, field.id, begin, value);
        segment.end = end;
        self.cache.save_or_update(session, &mut segment)?;
        Ok(Some(segment))
    }

    fn process_sum(
        &mut self,
        session: &mut dyn Session,
        field: &Field,
        records: &[ExchangeRecord],
    ) -> AppResult<Option<Segment>> {
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Ok(None);
        };
        if field.value_type == FieldType::Bool {
            error!(module = %self.module, field = %field.code, "sum of booleans is not supported, records skipped");
            return Ok(None);
        }

        let stored = self.cache.get_or_open_segment(session, field, first.timestamp)?;
        let is_new = stored.is_none();
        let mut segment = stored
            .unwrap_or_else(|| Segment::new(self.module, field.id, first.timestamp, SegmentValue::Null));
        segment.end = last.timestamp;
        segment.stopped = false;
        for record in records {
            match add_to_sum(&segment.value, &record.payload, field.value_type) {
                Some(sum) => segment.value = sum,
                None => error!(module = %self.module, record = %record, "value cannot be summed, skipped"),
            }
        }
        self.cache.save_or_update(session, &mut segment)?;
        Ok(is_new.then_some(segment))
    }

    fn process_average(
        &mut self,
        session: &mut dyn Session,
        field: &Field,
        v: f64,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Segment>> {
        let stored = self.cache.get_or_open_segment(session, field, at)?;

        // stored: the persisted segment; previous: its closed windows; current: the
        // window still below min_time
        let previous = match self.cache.previous(field.id).cloned() {
            Some(previous) => previous,
            None => {
                let previous = match &stored {
                    Some(s) => aggregate_of(s),
                    None => {
                        let mut p = Segment::new(self.module, field.id, at, SegmentValue::Double(0.0));
                        p.deviation = Some(0.0);
                        p
                    }
                };
                self.cache.set_previous(field.id, Some(previous.clone()));
                previous
            }
        };

        let current = match self.cache.current(field.id).cloned() {
            None => {
                let begin = match &stored {
                    Some(s) if !s.stopped => s.end,
                    _ => at,
                };
                let mut c = Segment::new(self.module, field.id, begin, SegmentValue::Double(v));
                c.end = at;
                c.deviation = Some(0.0);
                c
            }
            Some(mut c) => {
                let average = c.value.as_f64().unwrap_or(v);
                let added = at - c.end;
                let new_average = combine_average(average, c.length(), v, added);
                let new_deviation = combine_deviation(
                    average,
                    c.deviation.unwrap_or(0.0),
                    c.length(),
                    v,
                    0.0,
                    added,
                    new_average,
                );
                c.value = SegmentValue::Double(new_average);
                c.deviation = Some(new_deviation);
                c.end = at;
                c.stopped = false;
                c
            }
        };
        self.cache.set_current(field.id, Some(current.clone()));

        let min_time = min_time_of(field);
        if current.length() <= min_time {
            return match stored {
                None => {
                    let mut segment = current.clone();
                    segment.id = None;
                    self.cache.save_or_update(session, &mut segment)?;
                    Ok(Some(segment))
                }
                Some(mut segment) => {
                    combine_windows(&mut segment, &previous, &current);
                    segment.stopped = false;
                    self.cache.save_or_update(session, &mut segment)?;
                    Ok(None)
                }
            };
        }

        let Some(mut segment) = stored else {
            error!(
                fatal = true,
                module = %self.module,
                field = %field.code,
                "average window reached min_time without a stored segment"
            );
            return Err(PipelineError::InvalidValue(format!(
                "average of field {} lost its segment",
                field.code
            )));
        };

        let mut created = None;
        let previous_average = previous.value.as_f64().unwrap_or(0.0);
        let current_average = current.value.as_f64().unwrap_or(0.0);
        if previous.length() == chrono::Duration::zero() {
            info!(module = %self.module, field = %field.code, "first complete average window");
            segment.stopped = false;
            segment.end = current.end;
            segment.value = current.value.clone();
            segment.deviation = current.deviation;
            self.cache.save_or_update(session, &mut segment)?;
        } else if field.limit_deviation.is_some_and(|limit| {
            previous_average + limit < current_average || current_average < previous_average - limit
        }) {
            info!(
                module = %self.module,
                field = %field.code,
                previous_average,
                current_average,
                "average out of the deviation limit, new segment"
            );
            segment.stopped = previous.stopped;
            segment.end = previous.end;
            segment.value = previous.value.clone();
            segment.deviation = previous.deviation;
            self.cache.save_or_update(session, &mut segment)?;

            segment = current.clone();
            segment.id = None;
            self.cache.save_or_update(session, &mut segment)?;
            created = Some(segment.clone());
        } else {
            combine_windows(&mut segment, &previous, &current);
            self.cache.save_or_update(session, &mut segment)?;
        }

        self.cache.set_previous(field.id, Some(aggregate_of(&segment)));
        self.cache.set_current(field.id, None);
        Ok(created)
    }

    fn process_max(
        &mut self,
        session: &mut dyn Session,
        field: &Field,
        v: f64,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Segment>> {
        let min_time = min_time_of(field);
        let extendable = self
            .cache
            .get_or_open_segment(session, field, at)?
            .filter(|s| {
                let max = s.value.as_f64().unwrap_or(v);
                at - s.begin < min_time || field.limit_deviation.is_some_and(|limit| max - limit <= v)
            });

        let (mut segment, is_new) = match extendable {
            Some(mut s) => {
                let max = s.value.as_f64().unwrap_or(v);
                s.end = at;
                s.deviation = Some(combine_max_deviation(max, s.deviation.unwrap_or(0.0), v, 0.0));
                s.value = typed_numeric(field, combine_max(max, v));
                (s, false)
            }
            None => {
                let mut s = Segment::new(self.module, field.id, at, typed_numeric(field, v));
                s.deviation = Some(0.0);
                (s, true)
            }
        };
        segment.stopped = false;
        self.cache.save_or_update(session, &mut segment)?;
        Ok(is_new.then_some(segment))
    }
}

impl RecordImporter for ValueImporter {
    fn is_mergeable(&mut self, next: &ExchangeRecord, previous: &ExchangeRecord) -> bool {
        if next.key != previous.key {
            return false;
        }
        if next.timestamp < previous.timestamp {
            error!(
                fatal = true,
                module = %self.module,
                next = %next,
                previous = %previous,
                "record older than its predecessor"
            );
            return false;
        }
        !self
            .cache
            .is_segment_close_required(&next.key, previous.timestamp, next.timestamp, false)
    }

    fn import(&mut self, records: &[ExchangeRecord]) -> AppResult<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let key = first.key.clone();
        let mut field_id = None;
        let result = self.import_field(&key, records, &mut field_id);
        if let Err(e) = &result {
            error!(module = %self.module, key, error = %e, "value import failed, cache reloaded");
            if let Some(field_id) = field_id {
                match self.store.open_session() {
                    Ok(mut session) => self.cache.reload(session.as_mut(), field_id),
                    Err(_) => self.cache.evict(field_id),
                }
                for extension in &self.extensions {
                    self.touch();
                    extension.after_rollback(self.module, field_id);
                }
            }
        }
        result
    }
}

fn min_time_of(field: &Field) -> chrono::Duration {
    chrono::Duration::from_std(field.min_time).unwrap_or_else(|_| chrono::Duration::days(36500))
}

/// Aggregate snapshot of a segment, used as the "previous" window.
fn aggregate_of(segment: &Segment) -> Segment {
    let mut aggregate = Segment::new(segment.module, segment.field_id, segment.begin, segment.value.clone());
    aggregate.end = segment.end;
    aggregate.stopped = segment.stopped;
    aggregate.deviation = segment.deviation;
    aggregate
}

/// Merge two consecutive average windows into `target`, which begins like `first`.
fn combine_windows(target: &mut Segment, first: &Segment, second: &Segment) {
    let a1 = first.value.as_f64().unwrap_or(0.0);
    let a2 = second.value.as_f64().unwrap_or(0.0);
    let average = combine_average(a1, first.length(), a2, second.length());
    let deviation = combine_deviation(
        a1,
        first.deviation.unwrap_or(0.0),
        first.length(),
        a2,
        second.deviation.unwrap_or(0.0),
        second.length(),
        average,
    );
    target.value = SegmentValue::Double(average);
    target.deviation = Some(deviation);
    target.end = second.end;
}

fn convert(field: &Field, record: &ExchangeRecord) -> Option<SegmentValue> {
    let value = SegmentValue::from_payload(&record.payload, field.value_type);
    if value.is_none() {
        error!(field = %field.code, record = %record, "value does not match the field type, skipped");
    }
    value
}

fn numeric(field: &Field, record: &ExchangeRecord) -> Option<f64> {
    let value = record.payload.as_f64();
    if value.is_none() {
        error!(field = %field.code, record = %record, "value is not numeric, skipped");
    }
    value
}

/// Numeric value stored with the value type of `field`.
fn typed_numeric(field: &Field, v: f64) -> SegmentValue {
    match field.value_type {
        FieldType::Int if v.fract() == 0.0 => SegmentValue::Int(v as i64),
        _ => SegmentValue::Double(v),
    }
}

fn add_to_sum(current: &SegmentValue, payload: &Payload, value_type: FieldType) -> Option<SegmentValue> {
    match value_type {
        FieldType::Text => Some(SegmentValue::Text(current.as_text() + &payload.as_text())),
        FieldType::Int => {
            let base = match current {
                SegmentValue::Int(v) => *v,
                _ => 0,
            };
            match SegmentValue::from_payload(payload, FieldType::Int)? {
                SegmentValue::Int(v) => Some(SegmentValue::Int(base + v)),
                _ => None,
            }
        }
        FieldType::Double => {
            let base = current.as_f64().unwrap_or(0.0);
            payload.as_f64().map(|v| SegmentValue::Double(base + v))
        }
        FieldType::Bool => None,
    }
}
