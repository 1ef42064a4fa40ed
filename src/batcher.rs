//! Batching of log records into bounded payloads.
//!
//! Records are grouped greedily, in order, so that no batch holds more than
//! `max_events` records or more than `max_size` bytes of serialized records.
//! A record that is larger than `max_size` on its own can never be delivered
//! and is dropped.

use serde::Serialize;
use tracing::error;

use crate::record::LogRecord;

/// An ordered group of records delivered in one envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Batch {
    events: Vec<LogRecord>,

    #[serde(skip)]
    size: usize,
}

impl Batch {
    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Sum of the serialized sizes of the records, in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn events(&self) -> &[LogRecord] {
        &self.events
    }

    pub fn into_events(self) -> Vec<LogRecord> {
        self.events
    }

    fn push(&mut self, record: LogRecord, size: usize) {
        self.events.push(record);
        self.size += size;
    }
}

impl FromIterator<LogRecord> for Batch {
    fn from_iter<I: IntoIterator<Item = LogRecord>>(iter: I) -> Self {
        let mut batch = Batch::default();
        for record in iter {
            let size = record.serialized_size();
            batch.push(record, size);
        }
        batch
    }
}

/// The batches produced from one read, plus how many records were dropped.
#[derive(Debug, Default)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
    pub dropped: usize,
}

impl BatchPlan {
    /// Total number of records across all batches.
    pub fn event_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }
}

/// Partition `records` into batches bounded by `max_events` and `max_size`.
///
/// Empty input yields a single empty batch. Records larger than `max_size`
/// are logged and skipped without closing the batch being filled.
pub fn batch(records: Vec<LogRecord>, max_events: usize, max_size: usize) -> BatchPlan {
    let mut batches = Vec::new();
    let mut current = Batch::default();
    let mut dropped = 0;

    for record in records {
        let size = record.serialized_size();

        if size > max_size {
            error!(
                size = size,
                limit = max_size,
                "event size {} exceeds max size {}, dropping event",
                size,
                max_size
            );
            dropped += 1;
            continue;
        }

        if !current.is_empty() && (current.len() >= max_events || current.size + size > max_size) {
            batches.push(std::mem::take(&mut current));
        }

        current.push(record, size);
    }

    if !current.is_empty() || batches.is_empty() {
        batches.push(current);
    }

    BatchPlan { batches, dropped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    fn record(value: serde_json::Value) -> LogRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_respects_max_events() {
        let records = vec![record(json!({"foo": 1})), record(json!({"bar": 2}))];
        let plan = batch(records, 1, 65535);

        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.dropped, 0);
    }

    #[test]
    fn test_respects_max_size() {
        // Each record serializes to exactly 10 bytes
        let records = vec![record(json!({"foo": 10})), record(json!({"bar": 20}))];
        let plan = batch(records, 32, 10);

        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.batches[0].size(), 10);
    }

    #[test]
    fn test_oversized_record_dropped() {
        // {"foo":1000} is 12 bytes
        let records = vec![record(json!({"foo": 1000})), record(json!({"bar": 2}))];
        let plan = batch(records, 32, 10);

        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.dropped, 1);
        assert_eq!(plan.batches[0].events()[0], record(json!({"bar": 2})));
    }

    #[traced_test]
    #[test]
    fn test_oversized_record_logs_size_and_limit() {
        let line = format!(r#"{{"msg":"{}"}}"#, "x".repeat(244));
        assert_eq!(line.len(), 254);

        let records = vec![
            LogRecord::from_slice(line.as_bytes()).unwrap(),
            record(json!({"ok": true})),
        ];
        let plan = batch(records, 32, 253);

        assert!(logs_contain("event size 254 exceeds max size 253"));
        assert_eq!(plan.dropped, 1);
        assert_eq!(plan.event_count(), 1);
    }

    #[test]
    fn test_oversized_record_does_not_split_batch() {
        let records = vec![
            record(json!({"a": 1})),
            record(json!({"big": "xxxxxxxxxxxxxxxxxxxxxxxx"})),
            record(json!({"b": 2})),
        ];
        let plan = batch(records, 32, 20);

        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].len(), 2);
        assert_eq!(plan.dropped, 1);
    }

    #[test]
    fn test_empty_input_yields_one_empty_batch() {
        let plan = batch(Vec::new(), 32, 65535);

        assert_eq!(plan.batches.len(), 1);
        assert!(plan.batches[0].is_empty());
    }

    #[test]
    fn test_all_dropped_yields_one_empty_batch() {
        let plan = batch(vec![record(json!({"foo": 1000}))], 32, 5);

        assert_eq!(plan.batches.len(), 1);
        assert!(plan.batches[0].is_empty());
        assert_eq!(plan.dropped, 1);
    }

    #[test]
    fn test_conservation_and_order() {
        let records: Vec<LogRecord> = (0..50)
            .map(|i| record(json!({"id": i, "pad": "x".repeat(i % 7)})))
            .collect();

        for max_events in [1, 2, 3, 7, 64] {
            for max_size in [1, 12, 25, 40, 1000] {
                let expected: Vec<LogRecord> = records
                    .iter()
                    .filter(|r| r.serialized_size() <= max_size)
                    .cloned()
                    .collect();

                let plan = batch(records.clone(), max_events, max_size);
                for b in &plan.batches {
                    assert!(b.len() <= max_events);
                    assert!(b.size() <= max_size);
                }

                let flattened: Vec<LogRecord> = plan
                    .batches
                    .into_iter()
                    .flat_map(Batch::into_events)
                    .collect();
                assert_eq!(flattened, expected);
                assert_eq!(plan.dropped, records.len() - expected.len());
            }
        }
    }

    #[test]
    fn test_batch_serializes_as_array() {
        let b: Batch = vec![record(json!({"a": 1}))].into_iter().collect();
        assert_eq!(serde_json::to_string(&b).unwrap(), r#"[{"a":1}]"#);
        assert_eq!(b.size(), 7);
    }
}
