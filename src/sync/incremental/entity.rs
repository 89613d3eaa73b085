//! The unit of delta sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::datetime;

/// An entity tracked by delta sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
    /// Increments on every local tracked change
    pub version: u64,
    /// Tombstone for a deleted entity
    #[serde(default)]
    pub deleted: bool,
}

impl SyncEntity {
    /// Build an entity stamped now, with its checksum computed.
    #[must_use]
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>, data: Value) -> Self {
        let checksum = checksum(&data, false);
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            data,
            timestamp: datetime::now(),
            checksum,
            version: 1,
            deleted: false,
        }
    }

    /// Build a tombstone.
    #[must_use]
    pub fn tombstone(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            checksum: checksum(&Value::Null, true),
            deleted: true,
            data: Value::Null,
            ..Self::new(id, entity_type, Value::Null)
        }
    }

    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Checksum derived from the current content.
    #[must_use]
    pub fn computed_checksum(&self) -> String {
        checksum(&self.data, self.deleted)
    }

    /// Whether the stored checksum matches the content.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.computed_checksum()
    }

    /// Approximate serialized size in bytes.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len())
    }
}

/// Content digest of `data`.
///
/// Object keys are hashed in sorted order, so two values that differ only in
/// key order produce the same digest.
#[must_use]
pub fn checksum(data: &Value, deleted: bool) -> String {
    let mut hasher = blake3::Hasher::new();
    if deleted {
        hasher.update(b"\x00deleted");
    }
    let mut buf = Vec::new();
    write_canonical(data, &mut buf);
    hasher.update(&buf);
    hasher.finalize().to_hex().to_string()
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // Serializing a scalar cannot fail.
    if let Ok(bytes) = serde_json::to_vec(value) {
        out.extend_from_slice(&bytes);
    }
}
