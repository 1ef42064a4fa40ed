//! A single structured event read from the log file.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One JSON object decoded from a line of the log file.
///
/// No schema is imposed; the record is forwarded exactly as it was parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogRecord(Map<String, Value>);

impl LogRecord {
    /// Decode a record from one framed line.
    pub fn from_slice(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line)
    }

    /// Byte length of the compact JSON encoding.
    pub fn serialized_size(&self) -> usize {
        // Serializing a map of JSON values cannot fail
        serde_json::to_vec(&self.0).map(|v| v.len()).unwrap_or(0)
    }

    /// Look up a top-level field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for LogRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
