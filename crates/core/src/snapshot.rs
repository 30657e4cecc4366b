//! Snapshot: a point-in-time view of a directory tree

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::hash::ContentHash;
use crate::scan::FileRecord;

/// Per-file metadata as it travels inside a diff request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRecord {
    pub content_hash: ContentHash,
    pub modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Snapshot entries as carried on the wire, one loosely typed value per path
pub type WireSnapshot = BTreeMap<String, Value>;

/// A snapshot of a directory tree at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// All files in the snapshot, keyed by relative path
    pub files: BTreeMap<String, FileRecord>,
}

impl Snapshot {
    /// Create a snapshot from scanned records
    #[must_use]
    pub fn from_records(records: Vec<FileRecord>) -> Self {
        let files = records.into_iter().map(|r| (r.path.clone(), r)).collect();
        Self { files }
    }

    /// Create an empty snapshot
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Get the number of files
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Get a file by path
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    /// Total bytes across all files
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|r| r.size).sum()
    }

    /// Encode for a diff request
    #[must_use]
    pub fn to_wire(&self) -> WireSnapshot {
        self.files
            .iter()
            .map(|(path, record)| {
                let wire = WireRecord {
                    content_hash: record.hash,
                    modified_at: record.modified,
                    size: Some(record.size),
                };
                // A struct of a string, a timestamp and an integer always serializes
                let value = serde_json::to_value(wire).unwrap_or(Value::Null);
                (path.clone(), value)
            })
            .collect()
    }

    /// Decode a diff request's entries, keeping every entry that validates
    ///
    /// Entries that fail validation come back as `MalformedPayload` errors
    /// alongside the snapshot of the valid ones.
    #[must_use]
    pub fn from_wire(wire: &WireSnapshot) -> (Self, Vec<SyncError>) {
        let mut files = BTreeMap::new();
        let mut rejected = Vec::new();

        for (path, value) in wire {
            match extract_record(path, value) {
                Ok(record) => {
                    files.insert(path.clone(), record);
                }
                Err(e) => rejected.push(e),
            }
        }

        (Self { files }, rejected)
    }
}

/// Validate one loosely typed snapshot entry
fn extract_record(path: &str, value: &Value) -> Result<FileRecord, SyncError> {
    let malformed = |reason: String| SyncError::MalformedPayload {
        path: path.to_string(),
        reason,
    };

    let Value::Object(fields) = value else {
        return Err(malformed(format!("expected an object, got {value}")));
    };

    let hash = match fields.get("contentHash") {
        Some(Value::String(s)) => s.parse::<ContentHash>().map_err(malformed)?,
        Some(other) => return Err(malformed(format!("contentHash is not a string: {other}"))),
        None => return Err(malformed("missing contentHash".to_string())),
    };

    let modified = match fields.get("modifiedAt") {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map_err(|e| malformed(format!("invalid modifiedAt {s:?}: {e}")))?
            .with_timezone(&Utc),
        Some(other) => return Err(malformed(format!("modifiedAt is not a string: {other}"))),
        None => return Err(malformed("missing modifiedAt".to_string())),
    };

    let size = fields.get("size").and_then(Value::as_u64).unwrap_or(0);

    Ok(FileRecord {
        path: path.to_string(),
        hash,
        modified,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(path: &str, content: &[u8], secs: i64) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            hash: ContentHash::from_bytes(content),
            modified: Utc.timestamp_opt(secs, 123_456_789).unwrap(),
            size: content.len() as u64,
        }
    }

    #[test]
    fn test_wire_roundtrip_keeps_nanoseconds() {
        let snapshot = Snapshot::from_records(vec![
            record("notes/a.md", b"hello", 1_700_000_000),
            record("b.md", b"b", 1_600_000_000),
        ]);

        let (decoded, rejected) = Snapshot::from_wire(&snapshot.to_wire());

        assert!(rejected.is_empty());
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_malformed_entries_are_skipped_individually() {
        let good = ContentHash::from_bytes(b"good").to_hex();
        let wire: WireSnapshot = [
            (
                "good.md".to_string(),
                json!({"contentHash": good, "modifiedAt": "2024-05-01T10:00:00.5Z"}),
            ),
            ("no-hash.md".to_string(), json!({"modifiedAt": "2024-05-01T10:00:00Z"})),
            (
                "hash-not-string.md".to_string(),
                json!({"contentHash": 42, "modifiedAt": "2024-05-01T10:00:00Z"}),
            ),
            (
                "bad-time.md".to_string(),
                json!({"contentHash": good, "modifiedAt": "yesterday"}),
            ),
            ("not-object.md".to_string(), json!("oops")),
        ]
        .into_iter()
        .collect();

        let (snapshot, rejected) = Snapshot::from_wire(&wire);

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("good.md").is_some());
        assert_eq!(rejected.len(), 4);
        assert!(
            rejected
                .iter()
                .all(|e| matches!(e, SyncError::MalformedPayload { .. }))
        );
        let messages: Vec<String> = rejected.iter().map(ToString::to_string).collect();
        assert!(messages.iter().any(|m| m.contains("missing contentHash")));
        assert!(messages.iter().any(|m| m.contains("invalid modifiedAt")));
    }
}
