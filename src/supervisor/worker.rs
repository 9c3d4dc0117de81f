//! In-process acquisition workers.
//!
//! A worker is created by a [`WorkerFactory`] looked up by the unit's `driver` name,
//! then driven by [`AcquisitionWorker::run`] on the unit's dedicated thread until
//! its cancellation token fires.
//!
//! ## Configuration
//!
//! ```toml
//! [[units]]
//! machine_id = 7
//! mode = "thread"
//! driver = "mock"
//! period = "1s"
//! ```

use crate::config::UnitConfig;
use crate::error::{AppResult, PipelineError};
use crate::model::ModuleRef;
use crate::queue::{ExchangeRecord, MachineQueueSet, Payload};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{cancellable_sleep, LivenessHandle};

/// Everything a worker needs while it runs.
#[derive(Clone)]
pub struct WorkerContext {
    /// Unit identity
    pub key: ModuleRef,
    /// Liveness reporting
    pub liveness: LivenessHandle,
    /// Queues the worker feeds
    pub queues: Arc<MachineQueueSet>,
    /// Cancellation of this unit
    pub cancel: CancellationToken,
}

impl WorkerContext {
    /// Sleep unless cancelled; returns true when cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        cancellable_sleep(duration, &self.cancel).await
    }

    /// Push a record on the queue bus.
    ///
    /// A failing queue is logged and the record dropped: acquisition goes on.
    pub fn enqueue(&self, record: &ExchangeRecord) -> bool {
        match self.queues.enqueue(record) {
            Ok(()) => true,
            Err(e) => {
                warn!(unit = %self.key, %record, error = %e, "enqueue failed, record dropped");
                false
            }
        }
    }

    /// Whether the unit should stop.
    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.liveness.exit_requested()
    }
}

/// Acquisition loop of one machine module.
#[async_trait]
pub trait AcquisitionWorker: Send {
    /// Driver name, for logs.
    fn driver(&self) -> &str;

    /// Acquire until `ctx.cancel` fires.
    ///
    /// The worker must call `ctx.liveness.set_active()` at least once per
    /// watchdog timeout.
    async fn run(&mut self, ctx: WorkerContext) -> AppResult<()>;
}

/// Creates a worker from its unit configuration.
pub type WorkerFactory = fn(&UnitConfig) -> AppResult<Box<dyn AcquisitionWorker>>;

/// Simulated controller producing spindle speed and feed values.
///
/// Readings are a base value with ±5% noise.
pub struct MockAcquisition {
    period: Duration,
    spindle_speed: f64,
    feed: f64,
}

impl MockAcquisition {
    /// Factory registered under the `mock` driver name.
    pub fn from_config(config: &UnitConfig) -> AppResult<Box<dyn AcquisitionWorker>> {
        if config.period.is_zero() {
            return Err(PipelineError::Configuration(format!(
                "mock unit {}/{} needs a non-zero period",
                config.machine_id, config.module_id
            )));
        }
        Ok(Box::new(Self {
            period: config.period,
            spindle_speed: 1000.0,
            feed: 250.0,
        }))
    }

    fn acquire(&self, ctx: &WorkerContext) {
        let now = Utc::now();
        let mut rng = rand::thread_rng();
        let speed = self.spindle_speed * (1.0 + rng.gen_range(-0.05..0.05));
        let feed = self.feed * (1.0 + rng.gen_range(-0.05..0.05));

        let key = ctx.key;
        ctx.enqueue(&ExchangeRecord::value(
            key.machine_id,
            key.module_id,
            now,
            "SpindleSpeed",
            Payload::Int(speed.round() as i64),
        ));
        ctx.enqueue(&ExchangeRecord::value(
            key.machine_id,
            key.module_id,
            now,
            "Feedrate",
            Payload::Double(feed),
        ));
    }
}

#[async_trait]
impl AcquisitionWorker for MockAcquisition {
    fn driver(&self) -> &str {
        "mock"
    }

    async fn run(&mut self, ctx: WorkerContext) -> AppResult<()> {
        let key = ctx.key;
        ctx.enqueue(&ExchangeRecord::machine_mode(
            key.machine_id,
            key.module_id,
            Utc::now(),
            1,
        ));

        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if ctx.liveness.exit_requested() {
                        break;
                    }
                    ctx.liveness.set_active();
                    self.acquire(&ctx);
                }
                _ = ctx.cancel.cancelled() => {
                    debug!(unit = %key, "mock acquisition cancelled");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::queue::QueueBus;

    #[tokio::test]
    async fn test_mock_acquisition_feeds_queues_until_cancelled() {
        let bus = QueueBus::new(QueueSettings::default());
        let queues = bus.machine_set(7, 0).unwrap();
        let config = UnitConfig {
            period: Duration::from_millis(10),
            ..UnitConfig::mock(7, 0)
        };
        let mut worker = MockAcquisition::from_config(&config).unwrap();
        let ctx = WorkerContext {
            key: ModuleRef::new(7, 0),
            liveness: LivenessHandle::new(),
            queues: queues.clone(),
            cancel: CancellationToken::new(),
        };
        let cancel = ctx.cancel.clone();
        let liveness = ctx.liveness.clone();

        let task = tokio::spawn(async move { worker.run(ctx).await });
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(liveness.last_active().is_some());
        // Machine mode plus at least one pair of values
        assert!(queues.count().unwrap() >= 3);
    }

    #[test]
    fn test_mock_requires_period() {
        let config = UnitConfig {
            period: Duration::ZERO,
            ..UnitConfig::mock(1, 0)
        };
        assert!(MockAcquisition::from_config(&config).is_err());
    }
}
