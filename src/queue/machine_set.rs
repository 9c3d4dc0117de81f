//! Routed queue set of one machine module.
//!
//! Writes are routed by [`QueueCategory::for_record`]. Reads prefer the prioritized
//! machine-mode queue, then round-robin over the other queues; every read returns
//! records of a single sub-queue, and the following dequeue applies to that same
//! sub-queue.
//!
//! ```text
//! peek_n ──> MachineMode (if not empty and not skipped)
//!        └─> Alarm → ModuleActivity → Value0 … Value6 → Other → Alarm … (round-robin)
//! ```

use super::{bus::QueueInfo, report_short_dequeue, DurableQueue, ExchangeRecord, QueueCategory};
use crate::error::{AppResult, PipelineError};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{trace, warn};

/// The 11 sub-queues of a machine module.
pub struct MachineQueueSet {
    machine_id: u32,
    module_id: u32,
    queues: Vec<(QueueCategory, Arc<dyn DurableQueue>)>,
    prioritized: Vec<usize>,
    rotation: Vec<usize>,
    cursor: Mutex<Cursor>,
}

#[derive(Debug, Default)]
struct Cursor {
    /// Position in `rotation`
    next: usize,
    /// Index in `queues` of the last peeked sub-queue
    current: Option<usize>,
    /// Ignore the prioritized queues until the next reset
    skip_prioritized: bool,
}

impl MachineQueueSet {
    /// Build the set from opened sub-queues.
    pub fn new(
        machine_id: u32,
        module_id: u32,
        queues: Vec<(QueueCategory, Arc<dyn DurableQueue>)>,
    ) -> Self {
        let prioritized = (0..queues.len())
            .filter(|i| queues[*i].0.is_prioritized())
            .collect();
        let rotation = (0..queues.len())
            .filter(|i| !queues[*i].0.is_prioritized())
            .collect();
        Self {
            machine_id,
            module_id,
            queues,
            prioritized,
            rotation,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Machine identifier.
    pub fn machine_id(&self) -> u32 {
        self.machine_id
    }

    /// Module identifier.
    pub fn module_id(&self) -> u32 {
        self.module_id
    }

    /// Sub-queue of a category.
    pub fn queue(&self, category: QueueCategory) -> Option<&Arc<dyn DurableQueue>> {
        self.queues
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, q)| q)
    }

    /// Append a record to the sub-queue of its category.
    pub fn enqueue(&self, record: &ExchangeRecord) -> AppResult<()> {
        let category = QueueCategory::for_record(record);
        match self.queue(category) {
            Some(queue) => queue.enqueue(record),
            None => {
                warn!(
                    machine_id = self.machine_id,
                    module_id = self.module_id,
                    %category,
                    "no queue matches the record, dropped"
                );
                Ok(())
            }
        }
    }

    /// Total number of waiting records.
    pub fn count(&self) -> AppResult<usize> {
        let mut total = 0;
        for (_, queue) in &self.queues {
            total += queue.count()?;
        }
        Ok(total)
    }

    /// Up to `n` records of the next sub-queue to read.
    pub fn peek_n(&self, n: usize) -> AppResult<Vec<ExchangeRecord>> {
        let mut cursor = self.lock_cursor()?;
        let mut first_error = None;

        if !cursor.skip_prioritized {
            for &index in &self.prioritized {
                match self.queues[index].1.peek_n(n) {
                    Ok(records) => {
                        cursor.current = Some(index);
                        return Ok(records);
                    }
                    Err(PipelineError::EmptyQueue { .. }) => {}
                    Err(e) => self.remember(&mut first_error, index, e),
                }
            }
        }

        for step in 0..self.rotation.len() {
            let position = (cursor.next + step) % self.rotation.len();
            let index = self.rotation[position];
            match self.queues[index].1.peek_n(n) {
                Ok(records) => {
                    cursor.next = position;
                    cursor.current = Some(index);
                    return Ok(records);
                }
                Err(PipelineError::EmptyQueue { .. }) => {}
                Err(e) => self.remember(&mut first_error, index, e),
            }
        }

        cursor.current = None;
        Err(first_error.unwrap_or_else(|| PipelineError::EmptyQueue {
            queue: self.label(),
        }))
    }

    /// Remove up to `n` records from the last peeked sub-queue.
    ///
    /// Moves the rotation forward when that sub-queue is not prioritized, so the next
    /// read gives the other categories their turn.
    pub fn unsafe_dequeue(&self, n: usize) -> AppResult<usize> {
        let mut cursor = self.lock_cursor()?;
        let Some(index) = cursor.current else {
            report_short_dequeue(&self.label(), n, 0);
            return Ok(0);
        };
        let removed = self.queues[index].1.unsafe_dequeue(n)?;
        if !self.queues[index].0.is_prioritized() && !self.rotation.is_empty() {
            cursor.next = (cursor.next + 1) % self.rotation.len();
        }
        Ok(removed)
    }

    /// Remove and return one record of the last peeked sub-queue.
    pub fn dequeue(&self) -> AppResult<ExchangeRecord> {
        let cursor = self.lock_cursor()?;
        match cursor.current {
            Some(index) => self.queues[index].1.dequeue(),
            None => Err(PipelineError::EmptyQueue { queue: self.label() }),
        }
    }

    /// Index of the last peeked sub-queue.
    pub fn current_queue_index(&self) -> Option<usize> {
        self.lock_cursor().ok().and_then(|c| c.current)
    }

    /// Category of the last peeked sub-queue.
    pub fn current_category(&self) -> Option<QueueCategory> {
        self.current_queue_index().map(|i| self.queues[i].0)
    }

    /// Skip to the next non-prioritized sub-queue.
    pub fn move_next_queue(&self) {
        if let Ok(mut cursor) = self.lock_cursor() {
            cursor.skip_prioritized = true;
            if !self.rotation.is_empty() {
                cursor.next = (cursor.next + 1) % self.rotation.len();
            }
            trace!(machine_id = self.machine_id, next = cursor.next, "move to next queue");
        }
    }

    /// Give back the priority to the prioritized sub-queues and restart the rotation.
    pub fn reset(&self) {
        if let Ok(mut cursor) = self.lock_cursor() {
            *cursor = Cursor::default();
        }
    }

    /// Names of the sub-queues, in creation order.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|(_, q)| q.name().to_string()).collect()
    }

    /// Name and depth of each sub-queue.
    pub fn inspect(&self) -> Vec<QueueInfo> {
        self.queues
            .iter()
            .map(|(_, q)| QueueInfo {
                name: q.name().to_string(),
                count: q.count().ok(),
            })
            .collect()
    }

    /// Compact the sub-queues that need it.
    pub fn vacuum_if_needed(&self) -> AppResult<bool> {
        let mut any = false;
        for (_, queue) in &self.queues {
            any |= queue.vacuum_if_needed()?;
        }
        Ok(any)
    }

    fn label(&self) -> String {
        super::queue_name("", "set", self.machine_id, self.module_id)
    }

    fn remember(&self, first: &mut Option<PipelineError>, index: usize, error: PipelineError) {
        warn!(queue = self.queues[index].1.name(), error = %error, "sub-queue not readable, skipped");
        if first.is_none() {
            *first = Some(error);
        }
    }

    fn lock_cursor(&self) -> AppResult<MutexGuard<'_, Cursor>> {
        self.cursor.lock().map_err(|_| PipelineError::QueueUnavailable {
            queue: self.label(),
            reason: "cursor lock poisoned".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::queue::{record::Payload, AlarmDescriptor, QueueBus};
    use chrono::{Duration, Utc};

    fn bus() -> QueueBus {
        QueueBus::new(QueueSettings::default())
    }

    #[test]
    fn test_machine_mode_is_read_first() {
        let bus = bus();
        let set = bus.machine_set(1, 0).unwrap();
        let now = Utc::now();
        set.enqueue(&ExchangeRecord::value(1, 0, now, "Feedrate", Payload::Int(10)))
            .unwrap();
        set.enqueue(&ExchangeRecord::machine_mode(1, 0, now, 3)).unwrap();

        let first = set.peek_n(10).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, crate::queue::RecordKind::MachineMode);
        assert_eq!(set.current_category(), Some(QueueCategory::MachineMode));
        assert_eq!(set.unsafe_dequeue(1).unwrap(), 1);

        let next = set.peek_n(10).unwrap();
        assert_eq!(next[0].key, "Feedrate");
        assert_eq!(set.count().unwrap(), 1);
    }

    #[test]
    fn test_round_robin_between_categories() {
        let bus = bus();
        let set = bus.machine_set(1, 0).unwrap();
        let now = Utc::now();
        for i in 0..3 {
            set.enqueue(&ExchangeRecord::value(
                1,
                0,
                now + Duration::seconds(i),
                "Feedrate",
                Payload::Int(i),
            ))
            .unwrap();
        }
        set.enqueue(&ExchangeRecord::alarm(
            1,
            0,
            now,
            AlarmDescriptor::new("Fanuc", "SV", "401"),
        ))
        .unwrap();

        // Alarm comes first in the rotation, then the value class 0 queue.
        assert_eq!(set.peek_n(1).unwrap()[0].kind, crate::queue::RecordKind::CncAlarm);
        set.unsafe_dequeue(1).unwrap();
        assert_eq!(set.peek_n(1).unwrap()[0].payload, Payload::Int(0));
        set.unsafe_dequeue(1).unwrap();
        assert_eq!(set.peek_n(1).unwrap()[0].payload, Payload::Int(1));
    }

    #[test]
    fn test_move_next_skips_prioritized_until_reset() {
        let bus = bus();
        let set = bus.machine_set(1, 0).unwrap();
        let now = Utc::now();
        set.enqueue(&ExchangeRecord::machine_mode(1, 0, now, 3)).unwrap();
        set.enqueue(&ExchangeRecord::value(1, 0, now, "SpindleSpeed", Payload::Int(800)))
            .unwrap();

        set.peek_n(1).unwrap();
        set.move_next_queue();
        assert_eq!(set.peek_n(1).unwrap()[0].key, "SpindleSpeed");
        set.reset();
        assert_eq!(
            set.peek_n(1).unwrap()[0].kind,
            crate::queue::RecordKind::MachineMode
        );
    }

    #[test]
    fn test_empty_set() {
        let bus = bus();
        let set = bus.machine_set(9, 2).unwrap();
        assert!(matches!(set.peek_n(5), Err(PipelineError::EmptyQueue { .. })));
        assert_eq!(set.unsafe_dequeue(3).unwrap(), 0);
        assert!(set.queue_names().iter().all(|n| n.ends_with("-9-2")));
    }
}
