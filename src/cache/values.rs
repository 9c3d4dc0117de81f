//! Open value segments and running aggregates of one machine module.

use crate::error::AppResult;
use crate::model::{Field, ModuleRef, Segment};
use crate::persistence::Session;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Extension deciding whether a segment must be closed before a new sample.
///
/// `None` lets the next rule (and finally the default gap/stop rule) decide.
pub trait SegmentCloseRule: Send + Sync {
    /// Decision for `field_code` of `module`.
    fn is_close_required(
        &self,
        module: ModuleRef,
        field_code: &str,
        previous_end: DateTime<Utc>,
        new_time: DateTime<Utc>,
        previous_stopped: bool,
    ) -> Option<bool>;
}

#[derive(Debug, Default)]
struct CachedField {
    /// The stored segment was looked up in storage
    loaded: bool,
    stored: Option<Segment>,
    previous: Option<Segment>,
    current: Option<Segment>,
}

/// Value segment cache of a machine module.
pub struct ValueCache {
    module: ModuleRef,
    max_gap: Duration,
    rules: Vec<Arc<dyn SegmentCloseRule>>,
    entries: HashMap<u32, CachedField>,
}

impl ValueCache {
    /// Empty cache.
    pub fn new(module: ModuleRef, max_gap: Duration) -> Self {
        Self {
            module,
            max_gap,
            rules: Vec::new(),
            entries: HashMap::new(),
        }
    }

    /// Register a close rule; rules are consulted in registration order.
    pub fn with_rule(mut self, rule: Arc<dyn SegmentCloseRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Owning module.
    pub fn module(&self) -> ModuleRef {
        self.module
    }

    /// Number of fields with a cache entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no field is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a segment ending at `previous_end` must be closed before a sample at
    /// `new_time`.
    ///
    /// The first rule returning `Some` wins. Otherwise a stopped segment is closed, and
    /// so is one followed by a gap larger than the configured maximum. A sample older
    /// than the segment end is logged and tolerated.
    pub fn is_segment_close_required(
        &self,
        field_code: &str,
        previous_end: DateTime<Utc>,
        new_time: DateTime<Utc>,
        previous_stopped: bool,
    ) -> bool {
        for rule in &self.rules {
            if let Some(decision) =
                rule.is_close_required(self.module, field_code, previous_end, new_time, previous_stopped)
            {
                debug!(module = %self.module, field_code, decision, "close decided by rule");
                return decision;
            }
        }

        if previous_stopped {
            return true;
        }

        if new_time < previous_end {
            // Hardening candidate: out-of-order samples extend the segment backwards.
            error!(
                fatal = true,
                module = %self.module,
                field_code,
                %previous_end,
                %new_time,
                "sample older than the segment end, tolerated"
            );
            return false;
        }

        let gap = (new_time - previous_end).to_std().unwrap_or_default();
        gap > self.max_gap
    }

    /// Open segment of `field` for a sample at `at`.
    ///
    /// Loads the last stored segment on first use. Returns `None` when there is none,
    /// or when it had to be closed first (it is then evicted).
    pub fn get_or_open_segment(
        &mut self,
        session: &mut dyn Session,
        field: &Field,
        at: DateTime<Utc>,
    ) -> AppResult<Option<Segment>> {
        self.ensure_loaded(session, field.id)?;
        let Some(stored) = self.entry(field.id).stored.clone() else {
            return Ok(None);
        };

        if self.is_segment_close_required(&field.code, stored.end, at, stored.stopped) {
            debug!(module = %self.module, field_id = field.id, segment = %stored, "segment closed");
            let entry = self.entry(field.id);
            entry.stored = None;
            entry.previous = None;
            entry.current = None;
            return Ok(None);
        }
        Ok(Some(stored))
    }

    /// Persist a segment and make it the open segment of its field when it is the
    /// most recent one.
    ///
    /// A new segment first replaces any zero-length segment already persisted at the
    /// same begin.
    pub fn save_or_update(&mut self, session: &mut dyn Session, segment: &mut Segment) -> AppResult<()> {
        if segment.is_new() {
            let deleted =
                session.delete_zero_length_segments(self.module, segment.field_id, segment.begin)?;
            if deleted > 0 {
                warn!(
                    module = %self.module,
                    field_id = segment.field_id,
                    begin = %segment.begin,
                    deleted,
                    "zero-length segment replaced at the same begin"
                );
            }
        }
        session.save_segment(segment)?;

        let entry = self.entry(segment.field_id);
        entry.loaded = true;
        let replace = match &entry.stored {
            None => true,
            Some(stored) => stored.id == segment.id || stored.begin <= segment.begin,
        };
        if replace {
            entry.stored = Some(segment.clone());
        }
        Ok(())
    }

    /// Re-read the stored segment of a field.
    ///
    /// Never fails: a missing segment or a storage error evicts the entry instead.
    /// The running aggregates are always discarded.
    pub fn reload(&mut self, session: &mut dyn Session, field_id: u32) {
        let stored_id = self
            .entries
            .get(&field_id)
            .and_then(|e| e.stored.as_ref())
            .and_then(|s| s.id);
        let Some(id) = stored_id else {
            self.entries.remove(&field_id);
            return;
        };

        match session.find_segment(id) {
            Ok(Some(segment)) => {
                let entry = self.entry(field_id);
                entry.stored = Some(segment);
                entry.previous = None;
                entry.current = None;
            }
            Ok(None) => {
                debug!(module = %self.module, field_id, "segment vanished, evicted");
                self.entries.remove(&field_id);
            }
            Err(e) => {
                warn!(module = %self.module, field_id, error = %e, "reload failed, evicted");
                self.entries.remove(&field_id);
            }
        }
    }

    /// Forget everything about a field.
    pub fn evict(&mut self, field_id: u32) {
        self.entries.remove(&field_id);
    }

    /// Evict every field not in `keep` (all of them when `keep` is empty).
    pub fn clear(&mut self, keep: &[u32]) {
        if keep.is_empty() {
            self.entries.clear();
        } else {
            self.entries.retain(|id, _| keep.contains(id));
        }
    }

    /// Aggregate of the closed part of the average window.
    pub fn previous(&self, field_id: u32) -> Option<&Segment> {
        self.entries.get(&field_id).and_then(|e| e.previous.as_ref())
    }

    /// Set the aggregate of the closed part of the average window.
    pub fn set_previous(&mut self, field_id: u32, segment: Option<Segment>) {
        self.entry(field_id).previous = segment;
    }

    /// Aggregate of the running part of the average window.
    pub fn current(&self, field_id: u32) -> Option<&Segment> {
        self.entries.get(&field_id).and_then(|e| e.current.as_ref())
    }

    /// Set the aggregate of the running part of the average window.
    pub fn set_current(&mut self, field_id: u32, segment: Option<Segment>) {
        self.entry(field_id).current = segment;
    }

    fn ensure_loaded(&mut self, session: &mut dyn Session, field_id: u32) -> AppResult<()> {
        if self.entries.get(&field_id).is_some_and(|e| e.loaded) {
            return Ok(());
        }
        let stored = session.find_last_segment(self.module, field_id)?;
        let entry = self.entry(field_id);
        entry.loaded = true;
        entry.stored = stored;
        Ok(())
    }

    fn entry(&mut self, field_id: u32) -> &mut CachedField {
        self.entries.entry(field_id).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Aggregation, FieldType, SegmentValue};
    use crate::persistence::{in_transaction, MemoryStore, Store};
    use chrono::Duration as ChronoDuration;
    use tracing_test::traced_test;

    const MODULE: ModuleRef = ModuleRef::new(7, 0);

    fn field() -> Field {
        Field::new(2, "SpindleSpeed", Aggregation::NewValue, FieldType::Int)
    }

    fn cache() -> ValueCache {
        ValueCache::new(MODULE, Duration::from_secs(60))
    }

    struct NeverClose;

    impl SegmentCloseRule for NeverClose {
        fn is_close_required(
            &self,
            _module: ModuleRef,
            field_code: &str,
            _previous_end: DateTime<Utc>,
            _new_time: DateTime<Utc>,
            _previous_stopped: bool,
        ) -> Option<bool> {
            (field_code == "ToolNumber").then_some(false)
        }
    }

    #[test]
    fn test_default_close_rule() {
        let cache = cache();
        let t0 = Utc::now();
        assert!(!cache.is_segment_close_required("SpindleSpeed", t0, t0 + ChronoDuration::seconds(60), false));
        assert!(cache.is_segment_close_required("SpindleSpeed", t0, t0 + ChronoDuration::seconds(61), false));
        assert!(cache.is_segment_close_required("SpindleSpeed", t0, t0, true));
    }

    #[test]
    fn test_rule_wins_over_default() {
        let cache = cache().with_rule(Arc::new(NeverClose));
        let t0 = Utc::now();
        assert!(!cache.is_segment_close_required("ToolNumber", t0, t0 + ChronoDuration::hours(1), true));
        assert!(cache.is_segment_close_required("SpindleSpeed", t0, t0 + ChronoDuration::hours(1), false));
    }

    #[test]
    #[traced_test]
    fn test_out_of_order_sample_is_tolerated() {
        let cache = cache();
        let t0 = Utc::now();
        assert!(!cache.is_segment_close_required("SpindleSpeed", t0, t0 - ChronoDuration::seconds(5), false));
        assert!(logs_contain("sample older than the segment end"));
    }

    #[test]
    fn test_gap_evicts_open_segment() {
        let store = MemoryStore::new();
        let mut cache = cache();
        let t0 = Utc::now();
        in_transaction(&store, "test", |s| {
            let mut segment = Segment::new(MODULE, 2, t0, SegmentValue::Int(1000));
            cache.save_or_update(s, &mut segment)?;
            assert!(cache.get_or_open_segment(s, &field(), t0 + ChronoDuration::seconds(30))?.is_some());
            assert!(cache.get_or_open_segment(s, &field(), t0 + ChronoDuration::seconds(200))?.is_none());
            Ok(())
        })
        .unwrap();
        // The closed segment stays persisted.
        assert_eq!(store.segments(MODULE, 2).len(), 1);
    }

    #[test]
    fn test_zero_length_segment_is_replaced() {
        let store = MemoryStore::new();
        let mut cache = cache();
        let t0 = Utc::now();
        in_transaction(&store, "test", |s| {
            cache.save_or_update(s, &mut Segment::new(MODULE, 2, t0, SegmentValue::Int(1)))?;
            cache.save_or_update(s, &mut Segment::new(MODULE, 2, t0, SegmentValue::Int(2)))
        })
        .unwrap();
        let segments = store.segments(MODULE, 2);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].value, SegmentValue::Int(2));
    }

    #[test]
    fn test_reload_evicts_on_failure_and_drops_aggregates() {
        let store = MemoryStore::new();
        let mut cache = cache();
        let t0 = Utc::now();
        in_transaction(&store, "test", |s| {
            cache.save_or_update(s, &mut Segment::new(MODULE, 2, t0, SegmentValue::Int(1)))
        })
        .unwrap();
        cache.set_current(2, Some(Segment::new(MODULE, 2, t0, SegmentValue::Double(1.0))));

        let mut session = store.open_session().unwrap();
        cache.reload(session.as_mut(), 2);
        assert!(cache.current(2).is_none());
        assert_eq!(cache.len(), 1);

        // A segment id unknown to storage evicts the entry.
        let orphan_store = MemoryStore::new();
        let mut orphan_session = orphan_store.open_session().unwrap();
        cache.reload(orphan_session.as_mut(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_keeps_listed_fields() {
        let store = MemoryStore::new();
        let mut cache = cache();
        let t0 = Utc::now();
        in_transaction(&store, "test", |s| {
            cache.save_or_update(s, &mut Segment::new(MODULE, 1, t0, SegmentValue::Int(1)))?;
            cache.save_or_update(s, &mut Segment::new(MODULE, 2, t0, SegmentValue::Int(1)))
        })
        .unwrap();
        cache.clear(&[2]);
        assert_eq!(cache.len(), 1);
        cache.clear(&[]);
        assert!(cache.is_empty());
    }
}
