//! End-to-end tests from the queue bus to the persisted segments.

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use cnc_pipeline::config::{CacheSettings, ImportSettings, QueueSettings};
use cnc_pipeline::import::QueueImporter;
use cnc_pipeline::model::{Aggregation, Field, FieldType, ModuleRef, SegmentValue};
use cnc_pipeline::persistence::{FailPoint, MemoryStore};
use cnc_pipeline::queue::{AlarmDescriptor, ExchangeRecord, MachineQueueSet, Payload, QueueBus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MODULE: ModuleRef = ModuleRef::new(7, 0);
const SPINDLE_SPEED: u32 = 2;

struct Fixture {
    store: MemoryStore,
    queues: Arc<MachineQueueSet>,
    importer: QueueImporter,
}

fn fixture(aggregation: Aggregation) -> Fixture {
    let store = MemoryStore::new();
    let mut field = Field::new(SPINDLE_SPEED, "SpindleSpeed", aggregation, FieldType::Int);
    field.min_time = Duration::from_secs(600);
    store.insert_field(field);

    let bus = QueueBus::new(QueueSettings::default());
    let queues = bus.machine_set(7, 0).unwrap();
    let cache = CacheSettings {
        max_gap: Duration::from_secs(60),
        ..CacheSettings::default()
    };
    let importer = QueueImporter::new(
        queues.clone(),
        Arc::new(store.clone()),
        &ImportSettings::default(),
        &cache,
        &[],
    );
    Fixture {
        store,
        queues,
        importer,
    }
}

fn speed(at: DateTime<Utc>, value: i64) -> ExchangeRecord {
    ExchangeRecord::value(7, 0, at, "SpindleSpeed", Payload::Int(value))
}

#[tokio::test]
async fn test_gap_closes_the_open_segment() {
    let mut f = fixture(Aggregation::Max);
    let cancel = CancellationToken::new();
    let t0 = (Utc::now() - ChronoDuration::minutes(10)).trunc_subsecs(0);

    f.queues.enqueue(&speed(t0, 1000)).unwrap();
    f.queues
        .enqueue(&speed(t0 + ChronoDuration::seconds(30), 1200))
        .unwrap();
    assert_eq!(f.importer.import_available(&cancel).await.unwrap(), 2);

    let segments = f.store.segments(MODULE, SPINDLE_SPEED);
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].begin, t0);
    assert_eq!(segments[0].end, t0 + ChronoDuration::seconds(30));
    assert!(!segments[0].stopped);
    assert_eq!(segments[0].value, SegmentValue::Int(1200));

    f.queues
        .enqueue(&speed(t0 + ChronoDuration::seconds(200), 1200))
        .unwrap();
    assert_eq!(f.importer.import_available(&cancel).await.unwrap(), 1);

    let segments = f.store.segments(MODULE, SPINDLE_SPEED);
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].end, t0 + ChronoDuration::seconds(30));
    assert_eq!(segments[1].begin, t0 + ChronoDuration::seconds(200));
    assert_eq!(f.queues.count().unwrap(), 0);
}

#[tokio::test]
async fn test_new_values_split_on_change() {
    let mut f = fixture(Aggregation::NewValue);
    let t0 = Utc::now() - ChronoDuration::minutes(10);
    for (s, v) in [(0, 1000), (10, 1000), (20, 1200), (30, 1200)] {
        f.queues
            .enqueue(&speed(t0 + ChronoDuration::seconds(s), v))
            .unwrap();
    }
    f.importer
        .import_available(&CancellationToken::new())
        .await
        .unwrap();

    let values: Vec<_> = f
        .store
        .segments(MODULE, SPINDLE_SPEED)
        .into_iter()
        .map(|s| s.value)
        .collect();
    assert_eq!(values, vec![SegmentValue::Int(1000), SegmentValue::Int(1200)]);
}

#[tokio::test]
async fn test_transient_failure_keeps_records_queued() {
    let mut f = fixture(Aggregation::NewValue);
    let t0 = Utc::now() - ChronoDuration::minutes(10);
    f.queues.enqueue(&speed(t0, 1000)).unwrap();

    // More transient failures than attempts: the batch stays in its queue
    let settings = ImportSettings {
        max_attempts: 0,
        retry_sleep: Duration::from_millis(1),
        ..ImportSettings::default()
    };
    let mut importer = QueueImporter::new(
        f.queues.clone(),
        Arc::new(f.store.clone()),
        &settings,
        &CacheSettings::default(),
        &[],
    );
    f.store.fail_next(FailPoint::Commit, true);
    assert!(importer
        .import_available(&CancellationToken::new())
        .await
        .is_err_and(|e| e.is_transient()));
    assert_eq!(f.queues.count().unwrap(), 1);

    f.importer
        .import_available(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(f.queues.count().unwrap(), 0);
    assert_eq!(f.store.segments(MODULE, SPINDLE_SPEED).len(), 1);
}

#[tokio::test]
async fn test_alarm_scans_are_consolidated() {
    let f = fixture(Aggregation::NewValue);
    let mut importer = f.importer;
    let t0 = (Utc::now() - ChronoDuration::minutes(10)).trunc_subsecs(0);
    let overheat = AlarmDescriptor::new("FANUC", "OT", "0501");
    for s in [0, 10, 20] {
        f.queues
            .enqueue(&ExchangeRecord::alarm_scan(
                7,
                0,
                t0 + ChronoDuration::seconds(s),
                vec![overheat.clone()],
            ))
            .unwrap();
    }
    importer
        .import_available(&CancellationToken::new())
        .await
        .unwrap();

    let alarms = f.store.alarms(MODULE);
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].begin, t0);
    assert_eq!(alarms[0].end, t0 + ChronoDuration::seconds(20));
}
