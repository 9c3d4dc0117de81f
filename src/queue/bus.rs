//! Registry of the queues of the process.

use super::{
    file::FileQueue, machine_set::MachineQueueSet, memory::MemoryQueue, DurableQueue, QueueCategory,
    QueueConfig, ReceiveOnlyQueue,
};
use crate::config::QueueSettings;
use crate::error::{AppResult, PipelineError};
use crate::platform::{CurrentIdentity, RunAs};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Name and depth of one queue, for operational inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    /// Queue name
    pub name: String,
    /// Records waiting (`None` when the queue is unavailable)
    pub count: Option<usize>,
}

/// Creates queues lazily and hands out the same logical queue for the same name.
pub struct QueueBus {
    settings: QueueSettings,
    run_as: Arc<dyn RunAs>,
    queues: Mutex<BTreeMap<String, Arc<dyn DurableQueue>>>,
    sets: Mutex<HashMap<(u32, u32), Arc<MachineQueueSet>>>,
}

impl QueueBus {
    /// Bus using the current OS identity for file access.
    pub fn new(settings: QueueSettings) -> Self {
        Self::with_run_as(settings, Arc::new(CurrentIdentity))
    }

    /// Bus using a platform-provided identity capability.
    pub fn with_run_as(settings: QueueSettings, run_as: Arc<dyn RunAs>) -> Self {
        Self {
            settings,
            run_as,
            queues: Mutex::new(BTreeMap::new()),
            sets: Mutex::new(HashMap::new()),
        }
    }

    /// Settings the bus was built with.
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Queue configuration for a suffix, from the bus settings.
    pub fn config_for(&self, suffix: &str) -> QueueConfig {
        QueueConfig {
            prefix: self.settings.prefix.clone(),
            suffix: suffix.to_string(),
            persistent: self.settings.persistent,
            receive_only: false,
        }
    }

    /// Open the queue of (machine, module, suffix), creating it on first use.
    ///
    /// Idempotent: the same tuple always yields the same logical queue. A queue
    /// deleted through [`DurableQueue::delete`] is recreated.
    pub fn create_or_open(
        &self,
        machine_id: u32,
        module_id: u32,
        suffix: &str,
        config: &QueueConfig,
    ) -> AppResult<Arc<dyn DurableQueue>> {
        let name = super::queue_name(&config.prefix, suffix, machine_id, module_id);
        let mut queues = self.lock_queues()?;

        let existing = queues
            .get(&name)
            .filter(|queue| queue.count().is_ok())
            .cloned();
        let queue = match existing {
            Some(queue) => queue,
            None => {
                let queue: Arc<dyn DurableQueue> = if config.persistent {
                    Arc::new(FileQueue::open(
                        &self.settings.directory,
                        &name,
                        self.settings.vacuum_threshold,
                        Arc::clone(&self.run_as),
                        self.settings.run_as.clone(),
                    )?)
                } else {
                    Arc::new(MemoryQueue::new(name.clone()))
                };
                info!(queue = %name, persistent = config.persistent, "queue created");
                queues.insert(name.clone(), Arc::clone(&queue));
                queue
            }
        };

        if config.receive_only {
            debug!(queue = %name, "receive-only handle");
            Ok(Arc::new(ReceiveOnlyQueue::new(queue)))
        } else {
            Ok(queue)
        }
    }

    /// The fixed queue set of a machine module (created on first use).
    ///
    /// A cached set holding a deleted queue is rebuilt, which recreates that queue.
    pub fn machine_set(&self, machine_id: u32, module_id: u32) -> AppResult<Arc<MachineQueueSet>> {
        let mut sets = self
            .sets
            .lock()
            .map_err(|_| PipelineError::Configuration("queue set registry poisoned".into()))?;
        if let Some(set) = sets.get(&(machine_id, module_id)) {
            if set.inspect().iter().all(|info| info.count.is_some()) {
                return Ok(Arc::clone(set));
            }
            debug!(machine_id, module_id, "queue set holds a deleted queue, rebuilt");
        }

        let mut queues = Vec::with_capacity(QueueCategory::ALL.len());
        for category in QueueCategory::ALL {
            let suffix = category.suffix();
            let config = self.config_for(&suffix);
            queues.push((category, self.create_or_open(machine_id, module_id, &suffix, &config)?));
        }
        let set = Arc::new(MachineQueueSet::new(machine_id, module_id, queues));
        sets.insert((machine_id, module_id), Arc::clone(&set));
        Ok(set)
    }

    /// Every queue known to the bus with its depth.
    pub fn inspect(&self) -> AppResult<Vec<QueueInfo>> {
        let queues = self.lock_queues()?;
        Ok(queues
            .iter()
            .map(|(name, queue)| QueueInfo {
                name: name.clone(),
                count: queue.count().ok(),
            })
            .collect())
    }

    /// Compact every persistent queue that needs it; returns how many were compacted.
    pub fn vacuum_all(&self) -> AppResult<usize> {
        let queues: Vec<Arc<dyn DurableQueue>> = self.lock_queues()?.values().cloned().collect();
        let mut vacuumed = 0;
        for queue in queues {
            if queue.vacuum_if_needed()? {
                vacuumed += 1;
            }
        }
        Ok(vacuumed)
    }

    fn lock_queues(
        &self,
    ) -> AppResult<std::sync::MutexGuard<'_, BTreeMap<String, Arc<dyn DurableQueue>>>> {
        self.queues
            .lock()
            .map_err(|_| PipelineError::Configuration("queue registry poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::record::{ExchangeRecord, Payload};
    use chrono::Utc;
    use tempfile::tempdir;

    #[test]
    fn test_create_or_open_is_idempotent() {
        let bus = QueueBus::new(QueueSettings::default());
        let config = bus.config_for("Alarm");
        let a = bus.create_or_open(3, 0, "Alarm", &config).unwrap();
        let b = bus.create_or_open(3, 0, "Alarm", &config).unwrap();
        a.enqueue(&ExchangeRecord::machine_mode(3, 0, Utc::now(), 1)).unwrap();
        assert_eq!(b.count().unwrap(), 1);
        assert_eq!(a.name(), "SingleAlarm-3");
    }

    #[test]
    fn test_deleted_queue_is_recreated() {
        let bus = QueueBus::new(QueueSettings::default());
        let config = bus.config_for("Other");
        let queue = bus.create_or_open(3, 1, "Other", &config).unwrap();
        queue.delete().unwrap();
        let queue = bus.create_or_open(3, 1, "Other", &config).unwrap();
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[test]
    fn test_machine_set_is_rebuilt_after_a_queue_is_deleted() {
        let bus = QueueBus::new(QueueSettings::default());
        let set = bus.machine_set(4, 0).unwrap();
        let suffix = QueueCategory::ALL[0].suffix();
        let config = bus.config_for(&suffix);
        bus.create_or_open(4, 0, &suffix, &config).unwrap().delete().unwrap();

        let rebuilt = bus.machine_set(4, 0).unwrap();
        assert!(!Arc::ptr_eq(&set, &rebuilt));
        assert!(rebuilt.inspect().iter().all(|info| info.count == Some(0)));
        rebuilt
            .enqueue(&ExchangeRecord::machine_mode(4, 0, Utc::now(), 1))
            .unwrap();
        assert_eq!(rebuilt.count().unwrap(), 1);
    }

    #[test]
    fn test_machine_set_has_fixed_eleven_queues() {
        let bus = QueueBus::new(QueueSettings::default());
        let set = bus.machine_set(7, 0).unwrap();
        assert_eq!(set.queue_names().len(), 11);
        let again = bus.machine_set(7, 0).unwrap();
        assert!(Arc::ptr_eq(&set, &again));
        assert_eq!(bus.inspect().unwrap().len(), 11);
    }

    #[test]
    fn test_persistent_bus_uses_files() {
        let dir = tempdir().unwrap();
        let settings = QueueSettings {
            directory: dir.path().to_path_buf(),
            persistent: true,
            ..Default::default()
        };
        let bus = QueueBus::new(settings);
        let set = bus.machine_set(2, 0).unwrap();
        set.enqueue(&ExchangeRecord::value(
            2,
            0,
            Utc::now(),
            "Feedrate",
            Payload::Double(120.0),
        ))
        .unwrap();
        assert!(dir.path().join("SingleValue0-2.jsonl").exists());
    }
}
