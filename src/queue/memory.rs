//! Volatile in-memory queue backend.

use super::{empty, report_short_dequeue, unavailable, DurableQueue, ExchangeRecord};
use crate::error::AppResult;
use std::collections::VecDeque;
use std::sync::Mutex;

/// In-memory FIFO; content is lost on restart.
pub struct MemoryQueue {
    name: String,
    state: Mutex<MemoryState>,
}

struct MemoryState {
    records: VecDeque<ExchangeRecord>,
    deleted: bool,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState {
                records: VecDeque::new(),
                deleted: false,
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> AppResult<T>) -> AppResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| unavailable(&self.name, "queue lock poisoned"))?;
        if state.deleted {
            return Err(unavailable(&self.name, "queue was deleted"));
        }
        f(&mut state)
    }
}

impl DurableQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self) -> AppResult<usize> {
        self.with_state(|s| Ok(s.records.len()))
    }

    fn enqueue(&self, record: &ExchangeRecord) -> AppResult<()> {
        self.with_state(|s| {
            s.records.push_back(record.clone());
            Ok(())
        })
    }

    fn peek_n(&self, n: usize) -> AppResult<Vec<ExchangeRecord>> {
        self.with_state(|s| {
            if s.records.is_empty() {
                return Err(empty(&self.name));
            }
            Ok(s.records.iter().take(n).cloned().collect())
        })
    }

    fn dequeue(&self) -> AppResult<ExchangeRecord> {
        self.with_state(|s| s.records.pop_front().ok_or_else(|| empty(&self.name)))
    }

    fn unsafe_dequeue(&self, n: usize) -> AppResult<usize> {
        self.with_state(|s| {
            let removed = n.min(s.records.len());
            s.records.drain(..removed);
            report_short_dequeue(&self.name, n, removed);
            Ok(removed)
        })
    }

    fn clear(&self) -> AppResult<()> {
        self.with_state(|s| {
            s.records.clear();
            Ok(())
        })
    }

    fn delete(&self) -> AppResult<()> {
        self.with_state(|s| {
            s.records.clear();
            s.deleted = true;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::queue::record::Payload;
    use chrono::{Duration, Utc};

    fn sample(i: i64) -> ExchangeRecord {
        ExchangeRecord::value(
            1,
            0,
            Utc::now() + Duration::seconds(i),
            "Feedrate",
            Payload::Int(i),
        )
    }

    #[test]
    fn test_fifo_with_interleaved_peeks() {
        let queue = MemoryQueue::new("SingleValue0-1");
        for i in 0..5 {
            queue.enqueue(&sample(i)).unwrap();
        }
        assert_eq!(queue.peek().unwrap().payload, Payload::Int(0));
        assert_eq!(queue.dequeue().unwrap().payload, Payload::Int(0));
        assert_eq!(queue.peek_n(2).unwrap().len(), 2);
        for i in 1..5 {
            assert_eq!(queue.dequeue().unwrap().payload, Payload::Int(i));
        }
        assert!(matches!(queue.dequeue(), Err(PipelineError::EmptyQueue { .. })));
        assert!(matches!(queue.peek(), Err(PipelineError::EmptyQueue { .. })));
    }

    #[test]
    fn test_unsafe_dequeue_reports_actual_count() {
        let queue = MemoryQueue::new("SingleValue0-1");
        queue.enqueue(&sample(0)).unwrap();
        queue.enqueue(&sample(1)).unwrap();
        assert_eq!(queue.unsafe_dequeue(5).unwrap(), 2);
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[test]
    fn test_deleted_queue_is_unavailable() {
        let queue = MemoryQueue::new("SingleValue0-1");
        queue.delete().unwrap();
        assert!(matches!(
            queue.enqueue(&sample(0)),
            Err(PipelineError::QueueUnavailable { .. })
        ));
    }
}
