use crate::change_vector::ChangeVector;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::ops::BitOr;

pub const METADATA_KEY: &str = "@metadata";
pub const COLLECTION_KEY: &str = "@collection";
pub const ATTACHMENTS_KEY: &str = "@attachments";
pub const COUNTERS_KEY: &str = "@counters";
pub const TIME_SERIES_KEY: &str = "@timeseries";
pub const EMPTY_COLLECTION: &str = "@empty";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentFlags(u32);

impl DocumentFlags {
    pub const NONE: DocumentFlags = DocumentFlags(0);
    pub const HAS_REVISIONS: DocumentFlags = DocumentFlags(1);
    pub const HAS_ATTACHMENTS: DocumentFlags = DocumentFlags(1 << 1);
    pub const HAS_COUNTERS: DocumentFlags = DocumentFlags(1 << 2);
    pub const HAS_TIME_SERIES: DocumentFlags = DocumentFlags(1 << 3);
    pub const FROM_CLUSTER_TRANSACTION: DocumentFlags = DocumentFlags(1 << 4);
    pub const REVISION: DocumentFlags = DocumentFlags(1 << 5);

    /// Flags derived from the document's side tables; callers cannot set them.
    pub const DERIVED: DocumentFlags = DocumentFlags(
        Self::HAS_REVISIONS.0
            | Self::HAS_ATTACHMENTS.0
            | Self::HAS_COUNTERS.0
            | Self::HAS_TIME_SERIES.0,
    );

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: DocumentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: DocumentFlags) -> DocumentFlags {
        DocumentFlags(self.0 | other.0)
    }

    pub fn without(self, other: DocumentFlags) -> DocumentFlags {
        DocumentFlags(self.0 & !other.0)
    }

    pub fn toggled(self, other: DocumentFlags, on: bool) -> DocumentFlags {
        if on { self.with(other) } else { self.without(other) }
    }

    pub fn intersection(self, other: DocumentFlags) -> DocumentFlags {
        DocumentFlags(self.0 & other.0)
    }
}

impl BitOr for DocumentFlags {
    type Output = DocumentFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.with(rhs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub etag: u64,
    pub change_vector: ChangeVector,
    pub body: Value,
    pub collection: String,
    pub flags: DocumentFlags,
    pub last_modified_micros: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: String,
    pub etag: u64,
    pub change_vector: ChangeVector,
    pub collection: String,
    pub flags: DocumentFlags,
    pub last_modified_micros: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: String,
    pub etag: u64,
    pub change_vector: ChangeVector,
    pub body: Value,
    pub flags: DocumentFlags,
    pub last_modified_micros: u64,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentEntry {
    pub name: String,
    pub hash: String,
    pub content_type: String,
    pub size: u64,
    pub etag: u64,
    pub change_vector: ChangeVector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEntry {
    pub name: String,
    pub value: i64,
    pub etag: u64,
    pub change_vector: ChangeVector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: i64,
    pub values: Vec<f64>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesSegment {
    pub name: String,
    pub points: BTreeMap<i64, TimeSeriesPoint>,
    pub etag: u64,
    pub change_vector: ChangeVector,
}

impl TimeSeriesSegment {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            points: BTreeMap::new(),
            etag: 0,
            change_vector: ChangeVector::new(),
        }
    }
}

/// Document ids compare case-insensitively.
pub fn lower_id(id: &str) -> String {
    id.to_lowercase()
}

pub fn collection_of(body: &Value) -> String {
    body.get(METADATA_KEY)
        .and_then(|metadata| metadata.get(COLLECTION_KEY))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or(EMPTY_COLLECTION)
        .to_string()
}

pub fn content_hash(body: &Value) -> String {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collection_defaults_to_empty() {
        assert_eq!(collection_of(&json!({"name": "a"})), EMPTY_COLLECTION);
        assert_eq!(
            collection_of(&json!({"@metadata": {"@collection": "Users"}})),
            "Users"
        );
        assert_eq!(
            collection_of(&json!({"@metadata": {"@collection": ""}})),
            EMPTY_COLLECTION
        );
    }

    #[test]
    fn flags_compose() {
        let flags = DocumentFlags::HAS_ATTACHMENTS | DocumentFlags::FROM_CLUSTER_TRANSACTION;
        assert!(flags.contains(DocumentFlags::HAS_ATTACHMENTS));
        assert!(!flags.contains(DocumentFlags::HAS_COUNTERS));
        assert_eq!(
            flags.intersection(DocumentFlags::DERIVED),
            DocumentFlags::HAS_ATTACHMENTS
        );
        assert_eq!(
            flags.toggled(DocumentFlags::HAS_ATTACHMENTS, false),
            DocumentFlags::FROM_CLUSTER_TRANSACTION
        );
    }
}
