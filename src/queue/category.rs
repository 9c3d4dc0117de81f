//! Queue categories and the fixed value-key → value-class table.
//!
//! Every machine module owns exactly [`QueueCategory::ALL`] queues. The position of a
//! category in that list and the class of every key in [`VALUE_CLASS_TABLE`] are part of
//! the on-site contract: deployed consumers read queues by identity, so a key must
//! never move to another class and categories must never be reordered. New keys may
//! only be appended.

use super::record::{ExchangeRecord, RecordKind};
use std::fmt;

/// Number of numeric value classes.
pub const VALUE_CLASS_COUNT: u8 = 7;

/// Fixed key → class assignment. Append only.
pub const VALUE_CLASS_TABLE: &[(&str, u8)] = &[
    ("Feedrate", 0),
    ("FeedrateOverride", 0),
    ("RapidTraverseOverride", 0),
    ("SpindleLoad", 1),
    ("SpindleLoadPeak", 1),
    ("SpindleSpeed", 2),
    ("SpindleSpeedOverride", 2),
    ("ToolNumber", 3),
    ("ToolLife", 3),
    ("AxisLoad", 4),
    ("AxisSpeed", 4),
    ("Position", 5),
    ("ProgramName", 6),
    ("BlockNumber", 6),
    ("ProgramComment", 6),
];

/// Sub-queue of a machine module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueCategory {
    /// Machine mode, stamps, actions and other event-like records
    MachineMode,
    /// Active alarms
    Alarm,
    /// Machine-module activity
    ModuleActivity,
    /// One of the fixed numeric value classes (0..7)
    Value(u8),
    /// Values whose key is not in the class table
    Other,
}

impl QueueCategory {
    /// The fixed queue set of a machine module, in creation order.
    pub const ALL: [QueueCategory; 11] = [
        QueueCategory::MachineMode,
        QueueCategory::Alarm,
        QueueCategory::ModuleActivity,
        QueueCategory::Value(0),
        QueueCategory::Value(1),
        QueueCategory::Value(2),
        QueueCategory::Value(3),
        QueueCategory::Value(4),
        QueueCategory::Value(5),
        QueueCategory::Value(6),
        QueueCategory::Other,
    ];

    /// Suffix appended to the queue prefix.
    pub fn suffix(self) -> String {
        match self {
            QueueCategory::MachineMode => "MachineMode".to_string(),
            QueueCategory::Alarm => "Alarm".to_string(),
            QueueCategory::ModuleActivity => "ModuleActivity".to_string(),
            QueueCategory::Value(class) => format!("Value{}", class),
            QueueCategory::Other => "Other".to_string(),
        }
    }

    /// Queue read first by the consumer.
    pub fn is_prioritized(self) -> bool {
        matches!(self, QueueCategory::MachineMode)
    }

    /// Category of a value key.
    pub fn for_value_key(key: &str) -> QueueCategory {
        VALUE_CLASS_TABLE
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, class)| QueueCategory::Value(*class))
            .unwrap_or(QueueCategory::Other)
    }

    /// Category a record is routed to.
    pub fn for_record(record: &ExchangeRecord) -> QueueCategory {
        match record.kind {
            RecordKind::CncValue | RecordKind::StopCncValue => Self::for_value_key(&record.key),
            RecordKind::CncAlarm => QueueCategory::Alarm,
            RecordKind::MachineModuleActivity => QueueCategory::ModuleActivity,
            RecordKind::MachineMode
            | RecordKind::Stamp
            | RecordKind::Action
            | RecordKind::DetectionTimestamp
            | RecordKind::CncVariableSet
            | RecordKind::SequenceMilestone => QueueCategory::MachineMode,
        }
    }

    /// Index in [`QueueCategory::ALL`].
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|c| *c == self).unwrap_or(Self::ALL.len() - 1)
    }
}

impl fmt::Display for QueueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::record::Payload;
    use chrono::Utc;
    use std::collections::HashMap;

    #[test]
    fn test_class_table_is_consistent() {
        let mut seen: HashMap<&str, u8> = HashMap::new();
        for (key, class) in VALUE_CLASS_TABLE {
            assert!(*class < VALUE_CLASS_COUNT, "{key} has class {class}");
            assert!(seen.insert(key, *class).is_none(), "{key} listed twice");
        }
    }

    #[test]
    fn test_fixed_set_has_eleven_distinct_queues() {
        let suffixes: std::collections::HashSet<String> =
            QueueCategory::ALL.iter().map(|c| c.suffix()).collect();
        assert_eq!(suffixes.len(), 11);
        assert_eq!(QueueCategory::Value(2).index(), 5);
        assert_eq!(QueueCategory::Other.index(), 10);
    }

    #[test]
    fn test_routing() {
        let now = Utc::now();
        let speed = ExchangeRecord::value(7, 0, now, "SpindleSpeed", Payload::Int(1000));
        assert_eq!(QueueCategory::for_record(&speed), QueueCategory::Value(2));

        let stop = ExchangeRecord::stop_value(7, 0, now, "SpindleSpeed");
        assert_eq!(QueueCategory::for_record(&stop), QueueCategory::Value(2));

        let custom = ExchangeRecord::value(7, 0, now, "CoolantLevel", Payload::Double(0.4));
        assert_eq!(QueueCategory::for_record(&custom), QueueCategory::Other);

        let stamp = ExchangeRecord::new(RecordKind::Stamp, 7, 0, now, "", Payload::Int(12));
        assert_eq!(QueueCategory::for_record(&stamp), QueueCategory::MachineMode);
    }
}
