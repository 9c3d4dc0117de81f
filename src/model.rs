//! Persisted domain records produced by the consolidation layer.
//!
//! Value segments and alarms are plain value types; the persistence collaborator
//! assigns their ids. Kinds are closed sum types rather than entity hierarchies.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::queue::{AlarmDescriptor, Payload};

/// A (machine, module) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleRef {
    /// Machine identifier
    pub machine_id: u32,
    /// Module identifier (0 = main module)
    pub module_id: u32,
}

impl ModuleRef {
    /// New module reference.
    pub const fn new(machine_id: u32, module_id: u32) -> Self {
        Self {
            machine_id,
            module_id,
        }
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.machine_id, self.module_id)
    }
}

/// How successive samples of a field are consolidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// Samples are not imported
    None,
    /// A new segment starts whenever the value changes
    NewValue,
    /// Samples are summed into the open segment
    Sum,
    /// Time-weighted average with deviation
    Average,
    /// Maximum with max-minus-min deviation
    Max,
}

/// Value type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Integer
    Int,
    /// Floating point
    Double,
    /// Text
    Text,
    /// Boolean
    Bool,
}

/// Catalogue entry of a value key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Field identifier
    pub id: u32,
    /// Code used as record key (e.g. `SpindleSpeed`)
    pub code: String,
    /// Consolidation rule
    pub aggregation: Aggregation,
    /// Value type
    pub value_type: FieldType,
    /// Minimum duration of an average/max window
    #[serde(with = "humantime_serde")]
    pub min_time: std::time::Duration,
    /// Tolerance before an average/max window starts a new segment
    pub limit_deviation: Option<f64>,
    /// Inactive fields are skipped
    pub active: bool,
    /// Whether this is the machine's performance field (never skipped as old)
    pub is_performance: bool,
}

impl Field {
    /// Active field with default thresholds.
    pub fn new(id: u32, code: &str, aggregation: Aggregation, value_type: FieldType) -> Self {
        Self {
            id,
            code: code.to_string(),
            aggregation,
            value_type,
            min_time: std::time::Duration::from_secs(10),
            limit_deviation: None,
            active: true,
            is_performance: false,
        }
    }
}

/// Consolidated value of a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SegmentValue {
    /// Not set yet
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Double(f64),
    /// Text
    Text(String),
}

impl SegmentValue {
    /// Convert a record payload to the value type of a field.
    pub fn from_payload(payload: &Payload, value_type: FieldType) -> Option<Self> {
        match (value_type, payload) {
            (_, Payload::Null) => Some(SegmentValue::Null),
            (FieldType::Int, Payload::Int(v)) => Some(SegmentValue::Int(*v)),
            (FieldType::Int, Payload::Double(v)) if v.fract() == 0.0 => {
                Some(SegmentValue::Int(*v as i64))
            }
            (FieldType::Int, Payload::Text(s)) => s.trim().parse().ok().map(SegmentValue::Int),
            (FieldType::Double, p) => p.as_f64().map(SegmentValue::Double),
            (FieldType::Bool, Payload::Bool(v)) => Some(SegmentValue::Bool(*v)),
            (FieldType::Bool, Payload::Int(v)) => Some(SegmentValue::Bool(*v != 0)),
            (FieldType::Text, p) => Some(SegmentValue::Text(p.as_text())),
            _ => None,
        }
    }

    /// Numeric view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SegmentValue::Int(v) => Some(*v as f64),
            SegmentValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Textual identity used to compare successive values.
    pub fn as_text(&self) -> String {
        match self {
            SegmentValue::Null => String::new(),
            SegmentValue::Bool(v) => v.to_string(),
            SegmentValue::Int(v) => v.to_string(),
            SegmentValue::Double(v) => v.to_string(),
            SegmentValue::Text(s) => s.clone(),
        }
    }
}

/// A persisted time segment of one field of one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Persistence id (`None` until first saved)
    pub id: Option<u64>,
    /// Owning module
    pub module: ModuleRef,
    /// Field identifier
    pub field_id: u32,
    /// First sample time
    pub begin: DateTime<Utc>,
    /// Last sample time
    pub end: DateTime<Utc>,
    /// Acquisition stopped after `end`; the segment must not be extended
    pub stopped: bool,
    /// Consolidated value
    pub value: SegmentValue,
    /// Deviation of average/max segments
    pub deviation: Option<f64>,
}

impl Segment {
    /// New zero-length segment.
    pub fn new(module: ModuleRef, field_id: u32, at: DateTime<Utc>, value: SegmentValue) -> Self {
        Self {
            id: None,
            module,
            field_id,
            begin: at,
            end: at,
            stopped: false,
            value,
            deviation: None,
        }
    }

    /// `end - begin`.
    pub fn length(&self) -> Duration {
        self.end - self.begin
    }

    /// Whether the segment has no id yet.
    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment {:?} field={} [{}, {}]{} value={}",
            self.id,
            self.field_id,
            self.begin.format("%H:%M:%S"),
            self.end.format("%H:%M:%S"),
            if self.stopped { " stopped" } else { "" },
            self.value.as_text()
        )
    }
}

/// Compound identity of an alarm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlarmKey {
    /// Controller information
    pub cnc_info: String,
    /// Controller sub-information
    pub cnc_sub_info: String,
    /// Alarm type
    pub kind: String,
    /// Alarm number
    pub number: String,
}

impl From<&AlarmDescriptor> for AlarmKey {
    fn from(alarm: &AlarmDescriptor) -> Self {
        Self {
            cnc_info: alarm.cnc_info.clone(),
            cnc_sub_info: alarm.cnc_sub_info.clone(),
            kind: alarm.kind.clone(),
            number: alarm.number.clone(),
        }
    }
}

impl fmt::Display for AlarmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cnc_info, self.cnc_sub_info, self.kind, self.number
        )
    }
}

/// A persisted alarm period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    /// Persistence id (`None` until first saved)
    pub id: Option<u64>,
    /// Owning module
    pub module: ModuleRef,
    /// Identity
    pub key: AlarmKey,
    /// First scan where the alarm was active
    pub begin: DateTime<Utc>,
    /// Last scan where the alarm was active
    pub end: DateTime<Utc>,
    /// Operator message
    pub message: String,
    /// Controller-specific properties
    pub properties: BTreeMap<String, String>,
}

impl Alarm {
    /// New alarm from a controller descriptor.
    pub fn from_descriptor(
        module: ModuleRef,
        descriptor: &AlarmDescriptor,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            module,
            key: AlarmKey::from(descriptor),
            begin,
            end,
            message: descriptor.message.clone(),
            properties: descriptor.properties.clone(),
        }
    }
}

/// Per-module acquisition progress keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AcquisitionStateKey {
    /// Alarms acquired up to
    Alarms,
}
