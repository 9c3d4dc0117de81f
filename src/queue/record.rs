//! Exchange records moved through the queue bus.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of an exchange record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Machine mode (running, idle, ...)
    MachineMode,
    /// Numeric or textual value sample
    CncValue,
    /// A value stopped being acquired
    StopCncValue,
    /// Stamp read from the program
    Stamp,
    /// Cycle/quantity action
    Action,
    /// Alarm active at the record time
    CncAlarm,
    /// Detection timestamp
    DetectionTimestamp,
    /// Machine-module activity
    MachineModuleActivity,
    /// CNC variable set
    CncVariableSet,
    /// Sequence milestone
    SequenceMilestone,
}

impl RecordKind {
    /// All kinds, in declaration order.
    pub const ALL: [RecordKind; 10] = [
        RecordKind::MachineMode,
        RecordKind::CncValue,
        RecordKind::StopCncValue,
        RecordKind::Stamp,
        RecordKind::Action,
        RecordKind::CncAlarm,
        RecordKind::DetectionTimestamp,
        RecordKind::MachineModuleActivity,
        RecordKind::CncVariableSet,
        RecordKind::SequenceMilestone,
    ];

    /// Whether the record carries a value keyed by field code.
    pub fn is_value(self) -> bool {
        matches!(self, RecordKind::CncValue | RecordKind::StopCncValue)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::MachineMode => "MachineMode",
            RecordKind::CncValue => "CncValue",
            RecordKind::StopCncValue => "StopCncValue",
            RecordKind::Stamp => "Stamp",
            RecordKind::Action => "Action",
            RecordKind::CncAlarm => "CncAlarm",
            RecordKind::DetectionTimestamp => "DetectionTimestamp",
            RecordKind::MachineModuleActivity => "MachineModuleActivity",
            RecordKind::CncVariableSet => "CncVariableSet",
            RecordKind::SequenceMilestone => "SequenceMilestone",
        };
        f.write_str(name)
    }
}

/// Alarm as reported by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmDescriptor {
    /// Controller information (e.g. the controller family)
    pub cnc_info: String,
    /// Controller sub-information
    #[serde(default)]
    pub cnc_sub_info: String,
    /// Alarm type (must not be empty)
    #[serde(rename = "type")]
    pub kind: String,
    /// Alarm number
    pub number: String,
    /// Operator message
    #[serde(default)]
    pub message: String,
    /// Additional controller-specific properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl AlarmDescriptor {
    /// Minimal alarm descriptor.
    pub fn new(cnc_info: &str, kind: &str, number: &str) -> Self {
        Self {
            cnc_info: cnc_info.to_string(),
            cnc_sub_info: String::new(),
            kind: kind.to_string(),
            number: number.to_string(),
            message: String::new(),
            properties: BTreeMap::new(),
        }
    }
}

/// Record payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// No payload
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Double(f64),
    /// Text value
    Text(String),
    /// Alarm descriptor
    Alarm(AlarmDescriptor),
    /// Every alarm active at one scan
    Alarms(Vec<AlarmDescriptor>),
    /// Anything else, kept as JSON
    Json(serde_json::Value),
}

impl Payload {
    /// Numeric view of the payload, if any.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Payload::Int(v) => Some(*v as f64),
            Payload::Double(v) => Some(*v),
            Payload::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Payload::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Alarms of an alarm scan: `Null` is a scan without alarm, `None` means the
    /// payload is not an alarm payload.
    pub fn alarms(&self) -> Option<Vec<&AlarmDescriptor>> {
        match self {
            Payload::Null => Some(Vec::new()),
            Payload::Alarm(a) => Some(vec![a]),
            Payload::Alarms(list) => Some(list.iter().collect()),
            _ => None,
        }
    }

    /// Textual identity used to compare successive values.
    pub fn as_text(&self) -> String {
        match self {
            Payload::Null => String::new(),
            Payload::Bool(v) => v.to_string(),
            Payload::Int(v) => v.to_string(),
            Payload::Double(v) => v.to_string(),
            Payload::Text(s) => s.clone(),
            Payload::Alarm(a) => format!("{}/{}/{}", a.cnc_info, a.kind, a.number),
            Payload::Alarms(list) => list
                .iter()
                .map(|a| format!("{}/{}/{}", a.cnc_info, a.kind, a.number))
                .collect::<Vec<_>>()
                .join(","),
            Payload::Json(v) => v.to_string(),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// Unit of data moved through the queue bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    /// Record kind
    pub kind: RecordKind,
    /// Machine identifier
    pub machine_id: u32,
    /// Machine module identifier
    pub module_id: u32,
    /// UTC time, whole seconds
    pub timestamp: DateTime<Utc>,
    /// Field code for values, action name for actions, empty otherwise
    #[serde(default)]
    pub key: String,
    /// Payload
    pub payload: Payload,
}

impl ExchangeRecord {
    /// Build a record; the timestamp is truncated to whole seconds.
    pub fn new(
        kind: RecordKind,
        machine_id: u32,
        module_id: u32,
        timestamp: DateTime<Utc>,
        key: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            kind,
            machine_id,
            module_id,
            timestamp: timestamp.trunc_subsecs(0),
            key: key.into(),
            payload,
        }
    }

    /// Value sample.
    pub fn value(
        machine_id: u32,
        module_id: u32,
        timestamp: DateTime<Utc>,
        key: &str,
        payload: Payload,
    ) -> Self {
        Self::new(RecordKind::CncValue, machine_id, module_id, timestamp, key, payload)
    }

    /// End of acquisition of a value.
    pub fn stop_value(machine_id: u32, module_id: u32, timestamp: DateTime<Utc>, key: &str) -> Self {
        Self::new(
            RecordKind::StopCncValue,
            machine_id,
            module_id,
            timestamp,
            key,
            Payload::Null,
        )
    }

    /// Active alarm.
    pub fn alarm(
        machine_id: u32,
        module_id: u32,
        timestamp: DateTime<Utc>,
        alarm: AlarmDescriptor,
    ) -> Self {
        Self::new(
            RecordKind::CncAlarm,
            machine_id,
            module_id,
            timestamp,
            "",
            Payload::Alarm(alarm),
        )
    }

    /// Alarm scan: every alarm active at `timestamp` (none when `alarms` is empty).
    pub fn alarm_scan(
        machine_id: u32,
        module_id: u32,
        timestamp: DateTime<Utc>,
        alarms: Vec<AlarmDescriptor>,
    ) -> Self {
        let payload = if alarms.is_empty() {
            Payload::Null
        } else {
            Payload::Alarms(alarms)
        };
        Self::new(RecordKind::CncAlarm, machine_id, module_id, timestamp, "", payload)
    }

    /// Machine mode.
    pub fn machine_mode(machine_id: u32, module_id: u32, timestamp: DateTime<Utc>, mode: i64) -> Self {
        Self::new(
            RecordKind::MachineMode,
            machine_id,
            module_id,
            timestamp,
            "",
            Payload::Int(mode),
        )
    }

    /// Parse one JSON line, as written by child acquisition processes.
    pub fn from_json_line(line: &str) -> serde_json::Result<Self> {
        let record: ExchangeRecord = serde_json::from_str(line)?;
        Ok(Self {
            timestamp: record.timestamp.trunc_subsecs(0),
            ..record
        })
    }
}

impl fmt::Display for ExchangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}/{}] {} {}={}",
            self.kind,
            self.machine_id,
            self.module_id,
            self.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            self.key,
            self.payload
        )
    }
}
