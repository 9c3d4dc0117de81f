//! Running acquisition units: a dedicated OS thread or a child OS process.

use crate::config::UnitConfig;
use crate::error::{AppResult, PipelineError};
use crate::model::ModuleRef;
use crate::queue::{ExchangeRecord, MachineQueueSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::worker::{AcquisitionWorker, WorkerContext};
use super::LivenessHandle;

/// How a stop attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The worker left on its own
    Stopped,
    /// A child process had to be killed
    Killed,
    /// A thread did not finish in time and was left behind
    Detached,
}

/// Handle of a running worker.
pub enum UnitHandle {
    /// Worker running on its own OS thread
    Thread {
        /// Join handle of the thread
        thread: std::thread::JoinHandle<()>,
        /// Fires when the worker returned
        done: oneshot::Receiver<()>,
    },
    /// Worker running as a child process
    Process {
        /// Child process
        child: Child,
        /// Write side of the child's stdin; dropping it asks the child to close
        stdin: Option<ChildStdin>,
        /// Task reading the child's stdout
        reader: JoinHandle<()>,
    },
}

impl UnitHandle {
    /// Run `worker` on a named thread with its own single-threaded runtime.
    pub fn spawn_thread(mut worker: Box<dyn AcquisitionWorker>, ctx: WorkerContext) -> AppResult<Self> {
        let key = ctx.key;
        let (done_tx, done) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name(format!("acquisition-{}-{}", key.machine_id, key.module_id))
            .spawn(move || {
                let liveness = ctx.liveness.clone();
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(unit = %key, error = %e, "runtime creation failed");
                        liveness.set_error();
                        liveness.set_exited();
                        let _ = done_tx.send(());
                        return;
                    }
                };

                let driver = worker.driver().to_string();
                info!(unit = %key, %driver, "acquisition thread started");
                match runtime.block_on(worker.run(ctx)) {
                    Ok(()) => info!(unit = %key, %driver, "acquisition thread completed"),
                    Err(e) => {
                        error!(unit = %key, %driver, error = %e, "acquisition thread failed");
                        liveness.set_error();
                    }
                }
                liveness.set_exited();
                let _ = done_tx.send(());
            })?;

        Ok(UnitHandle::Thread { thread, done })
    }

    /// Launch the child process of a process unit.
    ///
    /// Every stdout line counts as a liveness report; lines holding a JSON exchange
    /// record are enqueued.
    pub fn spawn_process(config: &UnitConfig, ctx: WorkerContext) -> AppResult<Self> {
        let key = ctx.key;
        let program = config
            .command
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PipelineError::worker(key, "no command configured"))?;

        let mut child = Command::new(program)
            .args(&config.args)
            .env("CNC_PIPELINE_MACHINE_ID", key.machine_id.to_string())
            .env("CNC_PIPELINE_MODULE_ID", key.module_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::worker(key, format!("cannot launch '{}': {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::worker(key, "child stdout not captured"))?;
        let stdin = child.stdin.take();
        info!(unit = %key, program, pid = ?child.id(), "acquisition process started");

        let reader = tokio::spawn(read_output(
            key,
            stdout,
            ctx.queues,
            ctx.liveness,
            ctx.cancel,
        ));
        Ok(UnitHandle::Process { child, stdin, reader })
    }

    /// Whether the handle is a child process.
    pub fn is_process(&self) -> bool {
        matches!(self, UnitHandle::Process { .. })
    }

    /// Wait for the worker to leave after its cancellation was signalled.
    ///
    /// A child process is first asked to close (stdin closed), then killed after
    /// `timeout`. A thread that does not finish within `timeout` is detached.
    pub async fn stop(self, key: ModuleRef, timeout: Duration) -> AppResult<StopOutcome> {
        match self {
            UnitHandle::Thread { thread, done } => match tokio::time::timeout(timeout, done).await {
                Ok(_) => {
                    let joined = tokio::task::spawn_blocking(move || thread.join()).await;
                    match joined {
                        Ok(Ok(())) => debug!(unit = %key, "acquisition thread joined"),
                        Ok(Err(_)) => error!(unit = %key, "acquisition thread panicked"),
                        Err(e) => error!(unit = %key, error = %e, "join task failed"),
                    }
                    Ok(StopOutcome::Stopped)
                }
                Err(_) => {
                    warn!(unit = %key, ?timeout, "acquisition thread did not stop in time, detached");
                    Ok(StopOutcome::Detached)
                }
            },
            UnitHandle::Process {
                mut child,
                stdin,
                reader,
            } => {
                drop(stdin);
                let outcome = match tokio::time::timeout(timeout, child.wait()).await {
                    Ok(Ok(status)) => {
                        info!(unit = %key, %status, "acquisition process exited");
                        StopOutcome::Stopped
                    }
                    Ok(Err(e)) => {
                        reader.abort();
                        return Err(PipelineError::worker(key, format!("wait failed: {}", e)));
                    }
                    Err(_) => {
                        warn!(unit = %key, ?timeout, "acquisition process did not close in time, kill");
                        if let Err(e) = child.kill().await {
                            reader.abort();
                            return Err(PipelineError::worker(key, format!("kill failed: {}", e)));
                        }
                        StopOutcome::Killed
                    }
                };
                reader.abort();
                Ok(outcome)
            }
        }
    }
}

async fn read_output(
    key: ModuleRef,
    stdout: ChildStdout,
    queues: Arc<MachineQueueSet>,
    liveness: LivenessHandle,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = cancel.cancelled() => break,
        };
        match line {
            Ok(Some(line)) => {
                liveness.set_active();
                enqueue_line(key, &line, &queues);
            }
            Ok(None) => {
                info!(unit = %key, "acquisition process closed its output");
                break;
            }
            Err(e) => {
                warn!(unit = %key, error = %e, "cannot read child output");
                break;
            }
        }
    }
    liveness.set_exited();
}

/// Enqueue one output line of an acquisition process if it is a record of `key`.
fn enqueue_line(key: ModuleRef, line: &str, queues: &MachineQueueSet) -> bool {
    let line = line.trim();
    if !line.starts_with('{') {
        trace!(unit = %key, line, "child output");
        return false;
    }
    let record = match ExchangeRecord::from_json_line(line) {
        Ok(record) => record,
        Err(e) => {
            warn!(unit = %key, line, error = %e, "invalid record from child");
            return false;
        }
    };
    if record.machine_id != key.machine_id || record.module_id != key.module_id {
        error!(unit = %key, %record, "record of another machine module, dropped");
        return false;
    }
    match queues.enqueue(&record) {
        Ok(()) => true,
        Err(e) => {
            warn!(unit = %key, %record, error = %e, "enqueue failed, record dropped");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::queue::{Payload, QueueBus};
    use chrono::Utc;

    #[test]
    fn test_records_of_another_module_are_dropped() {
        let bus = QueueBus::new(QueueSettings::default());
        let queues = bus.machine_set(6, 0).unwrap();
        let key = ModuleRef::new(6, 0);
        let line = |machine_id| {
            serde_json::to_string(&ExchangeRecord::value(
                machine_id,
                0,
                Utc::now(),
                "Feedrate",
                Payload::Double(80.0),
            ))
            .unwrap()
        };

        assert!(enqueue_line(key, &line(6), &queues));
        assert!(!enqueue_line(key, &line(9), &queues));
        assert!(!enqueue_line(key, "driver ready", &queues));
        assert_eq!(queues.count().unwrap(), 1);
    }
}
