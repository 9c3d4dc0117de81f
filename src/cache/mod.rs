//! Consolidation cache: per machine-module state between the queue and storage.
//!
//! A [`ValueCache`] keeps, per field, the last persisted segment (possibly still open)
//! and the running aggregates of average fields. An [`AlarmCache`] keeps the alarms
//! active at the last scan. Both are owned by the import loop of their module and are
//! never shared, so they carry no locking.
//!
//! Every failure path degrades to "evict and re-read from storage": a cache miss is
//! always correct, a stale entry never is.

pub mod alarms;
pub mod values;

pub use alarms::AlarmCache;
pub use values::{SegmentCloseRule, ValueCache};
