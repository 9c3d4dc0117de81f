//! Alarms active at the last scan of one machine module.

use crate::model::{Alarm, AlarmKey, ModuleRef};
use crate::persistence::Session;
use std::collections::HashMap;
use tracing::{debug, error, warn};

/// Active alarm cache of a machine module.
#[derive(Debug)]
pub struct AlarmCache {
    module: ModuleRef,
    entries: HashMap<AlarmKey, Alarm>,
}

impl AlarmCache {
    /// Empty cache.
    pub fn new(module: ModuleRef) -> Self {
        Self {
            module,
            entries: HashMap::new(),
        }
    }

    /// Owning module.
    pub fn module(&self) -> ModuleRef {
        self.module
    }

    /// Active alarm with this key.
    pub fn get(&self, key: &AlarmKey) -> Option<&Alarm> {
        self.entries.get(key)
    }

    /// Keys of the active alarms.
    pub fn keys(&self) -> impl Iterator<Item = &AlarmKey> {
        self.entries.keys()
    }

    /// Number of active alarms.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no alarm is active.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record an alarm as active.
    pub fn set(&mut self, alarm: Alarm) {
        debug_assert_eq!(alarm.module, self.module);
        debug_assert!(!alarm.key.kind.is_empty(), "alarm without type cached");
        self.entries.insert(alarm.key.clone(), alarm);
    }

    /// Discontinue one alarm: the next occurrence opens a new period.
    pub fn reset(&mut self, key: &AlarmKey) {
        if self.entries.remove(key).is_some() {
            debug!(module = %self.module, alarm = %key, "alarm discontinued");
        }
    }

    /// Discontinue every alarm not in `keep` (all of them when `keep` is empty).
    pub fn clear(&mut self, keep: &[AlarmKey]) {
        if keep.is_empty() {
            self.entries.clear();
        } else {
            self.entries.retain(|key, _| keep.contains(key));
        }
    }

    /// Re-read the cached alarm of a key; evict it if that fails.
    pub fn reload(&mut self, session: &mut dyn Session, key: &AlarmKey) {
        let Some(id) = self.entries.get(key).and_then(|a| a.id) else {
            self.entries.remove(key);
            return;
        };
        match session.find_alarm(id) {
            Ok(Some(alarm)) if alarm.key == *key => {
                self.entries.insert(key.clone(), alarm);
            }
            Ok(Some(alarm)) => {
                error!(
                    module = %self.module,
                    alarm = %key,
                    stored = %alarm.key,
                    "stored alarm has another key, evicted"
                );
                self.entries.remove(key);
            }
            Ok(None) => {
                self.entries.remove(key);
            }
            Err(e) => {
                warn!(module = %self.module, alarm = %key, error = %e, "alarm reload failed, evicted");
                self.entries.remove(key);
            }
        }
    }

    /// Re-read every cached alarm.
    pub fn reload_all(&mut self, session: &mut dyn Session) {
        let keys: Vec<AlarmKey> = self.entries.keys().cloned().collect();
        for key in &keys {
            self.reload(session, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStore, Store};
    use crate::queue::AlarmDescriptor;
    use chrono::Utc;

    const MODULE: ModuleRef = ModuleRef::new(3, 0);

    fn alarm(number: &str) -> Alarm {
        let now = Utc::now();
        Alarm::from_descriptor(MODULE, &AlarmDescriptor::new("Fanuc", "SV", number), now, now)
    }

    #[test]
    fn test_clear_with_keep_list() {
        let mut cache = AlarmCache::new(MODULE);
        cache.set(alarm("1"));
        cache.set(alarm("2"));
        let keep = vec![alarm("2").key];
        cache.clear(&keep);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&keep[0]).is_some());

        cache.clear(&[]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reload_evicts_alarm_stored_under_another_key() {
        let store = MemoryStore::new();
        let mut session = store.open_session().unwrap();
        session.begin_transaction("test").unwrap();
        let mut stored = alarm("1");
        session.save_alarm(&mut stored).unwrap();
        session.commit().unwrap();

        let mut cache = AlarmCache::new(MODULE);
        let mut mismatched = alarm("2");
        mismatched.id = stored.id;
        cache.set(mismatched.clone());
        cache.reload(session.as_mut(), &mismatched.key);
        assert!(cache.is_empty());

        cache.set(stored.clone());
        cache.reload(session.as_mut(), &stored.key);
        assert_eq!(cache.get(&stored.key).and_then(|a| a.id), stored.id);
    }

    #[test]
    fn test_reset_single_key() {
        let mut cache = AlarmCache::new(MODULE);
        cache.set(alarm("1"));
        cache.set(alarm("2"));
        cache.reset(&alarm("1").key);
        assert_eq!(cache.keys().count(), 1);
    }
}
