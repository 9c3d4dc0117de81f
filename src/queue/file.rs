//! Persistent queue backend: one JSON-lines file per queue.
//!
//! # File layout
//! ```text
//! {directory}/{name}.jsonl   one serialized ExchangeRecord per line, append-only
//! {directory}/{name}.offset  number of lines already consumed
//! ```
//!
//! Dequeues only advance the offset. Once at least `vacuum_threshold` lines were
//! consumed, [`DurableQueue::vacuum_if_needed`] rewrites the file with the remaining
//! records. A line that cannot be decoded is logged and skipped at load time.

use super::{empty, report_short_dequeue, unavailable, DurableQueue, ExchangeRecord};
use crate::error::{AppResult, PipelineError};
use crate::platform::RunAs;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

/// JSON-lines queue surviving restarts.
pub struct FileQueue {
    name: String,
    data_path: PathBuf,
    offset_path: PathBuf,
    vacuum_threshold: usize,
    run_as: Arc<dyn RunAs>,
    identity: Option<String>,
    state: Mutex<FileState>,
}

struct FileState {
    /// (line number, record) of every unconsumed record
    records: VecDeque<(usize, ExchangeRecord)>,
    /// Lines consumed from the start of the file
    consumed: usize,
    /// Line number of the next appended record
    next_line: usize,
    deleted: bool,
}

impl FileQueue {
    /// Open (or create) the queue `name` under `directory`.
    pub fn open(
        directory: &Path,
        name: &str,
        vacuum_threshold: usize,
        run_as: Arc<dyn RunAs>,
        identity: Option<String>,
    ) -> AppResult<Self> {
        let data_path = directory.join(format!("{}.jsonl", name));
        let offset_path = directory.join(format!("{}.offset", name));

        let mut state = None;
        run_as.run_as(identity.as_deref(), &mut || {
            fs::create_dir_all(directory)?;
            state = Some(load(name, &data_path, &offset_path)?);
            Ok(())
        })?;
        let state = state.ok_or_else(|| unavailable(name, "queue could not be loaded"))?;

        debug!(
            queue = name,
            pending = state.records.len(),
            consumed = state.consumed,
            "persistent queue opened"
        );
        Ok(Self {
            name: name.to_string(),
            data_path,
            offset_path,
            vacuum_threshold: vacuum_threshold.max(1),
            run_as,
            identity,
            state: Mutex::new(state),
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FileState) -> AppResult<T>) -> AppResult<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| unavailable(&self.name, "queue lock poisoned"))?;
        if state.deleted {
            return Err(unavailable(&self.name, "queue was deleted"));
        }
        f(&mut state)
    }

    fn io<T>(&self, mut f: impl FnMut() -> std::io::Result<T>) -> AppResult<T> {
        let mut out = None;
        self.run_as
            .run_as(self.identity.as_deref(), &mut || {
                out = Some(f()?);
                Ok(())
            })
            .map_err(|e| unavailable(&self.name, e.to_string()))?;
        out.ok_or_else(|| unavailable(&self.name, "file operation did not run"))
    }

    fn write_offset(&self, consumed: usize) -> AppResult<()> {
        self.io(|| fs::write(&self.offset_path, consumed.to_string()))
    }

    fn consume(&self, state: &mut FileState, n: usize) -> AppResult<usize> {
        let removed = n.min(state.records.len());
        let mut consumed = state.consumed;
        for _ in 0..removed {
            if let Some((line, _)) = state.records.pop_front() {
                consumed = line + 1;
            }
        }
        if removed > 0 {
            self.write_offset(consumed)?;
            state.consumed = consumed;
        }
        Ok(removed)
    }
}

fn load(name: &str, data_path: &Path, offset_path: &Path) -> AppResult<FileState> {
    let consumed = match fs::read_to_string(offset_path) {
        Ok(text) => text.trim().parse::<usize>().unwrap_or_else(|_| {
            error!(queue = name, "unreadable offset file, replaying the whole queue");
            0
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    let mut records = VecDeque::new();
    let mut next_line = 0;
    match File::open(data_path) {
        Ok(file) => {
            for (line_no, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                next_line = line_no + 1;
                if line_no < consumed || line.trim().is_empty() {
                    continue;
                }
                match ExchangeRecord::from_json_line(&line) {
                    Ok(record) => records.push_back((line_no, record)),
                    Err(e) => error!(queue = name, line = line_no, error = %e, "corrupted record skipped"),
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    Ok(FileState {
        records,
        consumed: consumed.min(next_line),
        next_line,
        deleted: false,
    })
}

impl DurableQueue for FileQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self) -> AppResult<usize> {
        self.with_state(|s| Ok(s.records.len()))
    }

    fn enqueue(&self, record: &ExchangeRecord) -> AppResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.with_state(|s| {
            self.io(|| {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.data_path)?;
                file.write_all(line.as_bytes())?;
                file.flush()
            })?;
            s.records.push_back((s.next_line, record.clone()));
            s.next_line += 1;
            Ok(())
        })
    }

    fn peek_n(&self, n: usize) -> AppResult<Vec<ExchangeRecord>> {
        self.with_state(|s| {
            if s.records.is_empty() {
                return Err(empty(&self.name));
            }
            Ok(s.records.iter().take(n).map(|(_, r)| r.clone()).collect())
        })
    }

    fn dequeue(&self) -> AppResult<ExchangeRecord> {
        self.with_state(|s| {
            let record = s
                .records
                .front()
                .map(|(_, r)| r.clone())
                .ok_or_else(|| empty(&self.name))?;
            self.consume(s, 1)?;
            Ok(record)
        })
    }

    fn unsafe_dequeue(&self, n: usize) -> AppResult<usize> {
        self.with_state(|s| {
            let removed = self.consume(s, n)?;
            report_short_dequeue(&self.name, n, removed);
            Ok(removed)
        })
    }

    fn clear(&self) -> AppResult<()> {
        self.with_state(|s| {
            self.io(|| File::create(&self.data_path).map(|_| ()))?;
            self.write_offset(0)?;
            s.records.clear();
            s.consumed = 0;
            s.next_line = 0;
            Ok(())
        })
    }

    fn delete(&self) -> AppResult<()> {
        self.with_state(|s| {
            for path in [&self.data_path, &self.offset_path] {
                match self.io(|| fs::remove_file(path)) {
                    Ok(()) => {}
                    Err(PipelineError::QueueUnavailable { .. }) if !path.exists() => {}
                    Err(e) => return Err(e),
                }
            }
            s.records.clear();
            s.deleted = true;
            info!(queue = %self.name, "persistent queue deleted");
            Ok(())
        })
    }

    fn vacuum_if_needed(&self) -> AppResult<bool> {
        self.with_state(|s| {
            if s.consumed < self.vacuum_threshold {
                return Ok(false);
            }
            let mut content = String::new();
            for (_, record) in &s.records {
                content.push_str(&serde_json::to_string(record)?);
                content.push('\n');
            }
            let tmp_path = self.data_path.with_extension("jsonl.tmp");
            self.io(|| {
                fs::write(&tmp_path, content.as_bytes())?;
                fs::rename(&tmp_path, &self.data_path)
            })?;
            self.write_offset(0)?;

            for (line, (line_no, _)) in s.records.iter_mut().enumerate() {
                *line_no = line;
            }
            let vacuumed = s.consumed;
            s.consumed = 0;
            s.next_line = s.records.len();
            info!(queue = %self.name, vacuumed, "persistent queue compacted");
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::CurrentIdentity;
    use crate::queue::record::Payload;
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn open(dir: &Path, threshold: usize) -> FileQueue {
        FileQueue::open(dir, "SingleValue2-7", threshold, Arc::new(CurrentIdentity), None).unwrap()
    }

    fn sample(i: i64) -> ExchangeRecord {
        ExchangeRecord::value(
            7,
            0,
            Utc::now() + Duration::seconds(i),
            "SpindleSpeed",
            Payload::Int(1000 + i),
        )
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let queue = open(dir.path(), 100);
            for i in 0..4 {
                queue.enqueue(&sample(i)).unwrap();
            }
            assert_eq!(queue.dequeue().unwrap().payload, Payload::Int(1000));
        }
        let queue = open(dir.path(), 100);
        assert_eq!(queue.count().unwrap(), 3);
        assert_eq!(queue.dequeue().unwrap().payload, Payload::Int(1001));
    }

    #[test]
    fn test_vacuum_keeps_pending_records() {
        let dir = tempdir().unwrap();
        let queue = open(dir.path(), 2);
        for i in 0..5 {
            queue.enqueue(&sample(i)).unwrap();
        }
        assert!(!queue.vacuum_if_needed().unwrap());
        assert_eq!(queue.unsafe_dequeue(3).unwrap(), 3);
        assert!(queue.vacuum_if_needed().unwrap());
        queue.enqueue(&sample(5)).unwrap();
        drop(queue);

        let queue = open(dir.path(), 2);
        let pending: Vec<Payload> = queue
            .peek_n(10)
            .unwrap()
            .into_iter()
            .map(|r| r.payload)
            .collect();
        assert_eq!(
            pending,
            vec![Payload::Int(1003), Payload::Int(1004), Payload::Int(1005)]
        );
    }

    #[test]
    fn test_corrupted_line_is_skipped() {
        let dir = tempdir().unwrap();
        {
            let queue = open(dir.path(), 100);
            queue.enqueue(&sample(0)).unwrap();
        }
        let data = dir.path().join("SingleValue2-7.jsonl");
        let mut file = OpenOptions::new().append(true).open(&data).unwrap();
        writeln!(file, "{{not json").unwrap();
        drop(file);
        {
            let queue = open(dir.path(), 100);
            queue.enqueue(&sample(1)).unwrap();
            assert_eq!(queue.count().unwrap(), 2);
            queue.unsafe_dequeue(2).unwrap();
        }
        let queue = open(dir.path(), 100);
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[test]
    fn test_delete_removes_files() {
        let dir = tempdir().unwrap();
        let queue = open(dir.path(), 100);
        queue.enqueue(&sample(0)).unwrap();
        queue.dequeue().unwrap();
        queue.delete().unwrap();
        assert!(!dir.path().join("SingleValue2-7.jsonl").exists());
        assert!(matches!(
            queue.count(),
            Err(PipelineError::QueueUnavailable { .. })
        ));
    }
}
