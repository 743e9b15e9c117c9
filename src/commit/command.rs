use crate::change_vector::ChangeVector;
use crate::storage::documents::DocumentFlags;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Location of one attachment stream inside a batch's spill file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentStream {
    pub offset: u64,
    pub length: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForceRevisionStrategy {
    #[default]
    None,
    /// Snapshot the current document into revisions before overwriting it.
    Before,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutCommand {
    pub id: String,
    pub body: Value,
    #[serde(default)]
    pub expected_change_vector: Option<ChangeVector>,
    #[serde(default)]
    pub flags: DocumentFlags,
    #[serde(default)]
    pub force_revision: ForceRevisionStrategy,
    /// Set on ids the server generated; the put fails with an identity
    /// collision instead of overwriting.
    #[serde(default)]
    pub must_be_new: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteCommand {
    pub id: String,
    #[serde(default)]
    pub expected_change_vector: Option<ChangeVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRequest {
    pub script: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl PatchRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            args: Map::new(),
        }
    }

    pub fn with_arg(mut self, name: &str, value: Value) -> Self {
        self.args.insert(name.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchCommand {
    pub id: String,
    pub patch: PatchRequest,
    #[serde(default)]
    pub patch_if_missing: Option<PatchRequest>,
    #[serde(default)]
    pub expected_change_vector: Option<ChangeVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentPutCommand {
    pub document_id: String,
    pub name: String,
    pub content_type: String,
    pub stream: AttachmentStream,
    #[serde(default)]
    pub expected_change_vector: Option<ChangeVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDeleteCommand {
    pub document_id: String,
    pub name: String,
    #[serde(default)]
    pub expected_change_vector: Option<ChangeVector>,
}

/// Shared by move and copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentTransferCommand {
    pub document_id: String,
    pub name: String,
    pub destination_id: String,
    pub destination_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterOperationKind {
    Increment(i64),
    Delete,
    Get,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterOperation {
    pub name: String,
    pub kind: CounterOperationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterCommand {
    pub document_id: String,
    pub operations: Vec<CounterOperation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesAppend {
    pub timestamp: i64,
    pub values: Vec<f64>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Inclusive range; open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self {
            from: None,
            to: None,
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.from.is_none_or(|from| timestamp >= from) && self.to.is_none_or(|to| timestamp <= to)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesCommand {
    pub document_id: String,
    pub name: String,
    #[serde(default)]
    pub appends: Vec<TimeSeriesAppend>,
    #[serde(default)]
    pub deletes: Vec<TimeRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesCopyCommand {
    pub source_id: String,
    pub source_name: String,
    pub destination_id: String,
    pub destination_name: String,
    pub range: TimeRange,
}

/// Every logical write the merger can execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteCommand {
    Put(PutCommand),
    Delete(DeleteCommand),
    DeleteByPrefix { id_prefix: String },
    Patch(PatchCommand),
    ForceRevision { id: String },
    AttachmentPut(AttachmentPutCommand),
    AttachmentDelete(AttachmentDeleteCommand),
    AttachmentMove(AttachmentTransferCommand),
    AttachmentCopy(AttachmentTransferCommand),
    Counters(CounterCommand),
    TimeSeries(TimeSeriesCommand),
    TimeSeriesCopy(TimeSeriesCopyCommand),
}

impl WriteCommand {
    pub fn put(id: impl Into<String>, body: Value) -> Self {
        WriteCommand::Put(PutCommand {
            id: id.into(),
            body,
            expected_change_vector: None,
            flags: DocumentFlags::NONE,
            force_revision: ForceRevisionStrategy::None,
            must_be_new: false,
        })
    }

    pub fn put_expecting(id: impl Into<String>, body: Value, expected: ChangeVector) -> Self {
        WriteCommand::Put(PutCommand {
            id: id.into(),
            body,
            expected_change_vector: Some(expected),
            flags: DocumentFlags::NONE,
            force_revision: ForceRevisionStrategy::None,
            must_be_new: false,
        })
    }

    pub fn delete(id: impl Into<String>) -> Self {
        WriteCommand::Delete(DeleteCommand {
            id: id.into(),
            expected_change_vector: None,
        })
    }

    pub fn patch(id: impl Into<String>, patch: PatchRequest) -> Self {
        WriteCommand::Patch(PatchCommand {
            id: id.into(),
            patch,
            patch_if_missing: None,
            expected_change_vector: None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            WriteCommand::Put(_) => "PUT",
            WriteCommand::Delete(_) => "DELETE",
            WriteCommand::DeleteByPrefix { .. } => "DELETE_BY_PREFIX",
            WriteCommand::Patch(_) => "PATCH",
            WriteCommand::ForceRevision { .. } => "FORCE_REVISION",
            WriteCommand::AttachmentPut(_) => "ATTACHMENT_PUT",
            WriteCommand::AttachmentDelete(_) => "ATTACHMENT_DELETE",
            WriteCommand::AttachmentMove(_) => "ATTACHMENT_MOVE",
            WriteCommand::AttachmentCopy(_) => "ATTACHMENT_COPY",
            WriteCommand::Counters(_) => "COUNTERS",
            WriteCommand::TimeSeries(_) => "TIME_SERIES",
            WriteCommand::TimeSeriesCopy(_) => "TIME_SERIES_COPY",
        }
    }

    /// Rough in-memory footprint, used for bulk-insert batching.
    pub fn approximate_size(&self) -> usize {
        const OVERHEAD: usize = 64;
        OVERHEAD
            + match self {
                WriteCommand::Put(cmd) => cmd.id.len() + json_size(&cmd.body),
                WriteCommand::Delete(cmd) => cmd.id.len(),
                WriteCommand::DeleteByPrefix { id_prefix } => id_prefix.len(),
                WriteCommand::Patch(cmd) => {
                    cmd.id.len() + cmd.patch.script.len() + json_size_map(&cmd.patch.args)
                }
                WriteCommand::ForceRevision { id } => id.len(),
                WriteCommand::AttachmentPut(cmd) => {
                    cmd.document_id.len() + cmd.name.len() + cmd.stream.length as usize
                }
                WriteCommand::AttachmentDelete(cmd) => cmd.document_id.len() + cmd.name.len(),
                WriteCommand::AttachmentMove(cmd) | WriteCommand::AttachmentCopy(cmd) => {
                    cmd.document_id.len()
                        + cmd.name.len()
                        + cmd.destination_id.len()
                        + cmd.destination_name.len()
                }
                WriteCommand::Counters(cmd) => {
                    cmd.document_id.len()
                        + cmd
                            .operations
                            .iter()
                            .map(|op| op.name.len() + 16)
                            .sum::<usize>()
                }
                WriteCommand::TimeSeries(cmd) => {
                    cmd.document_id.len()
                        + cmd.name.len()
                        + cmd
                            .appends
                            .iter()
                            .map(|append| 16 + append.values.len() * 8)
                            .sum::<usize>()
                }
                WriteCommand::TimeSeriesCopy(cmd) => {
                    cmd.source_id.len() + cmd.destination_id.len() + 32
                }
            }
    }

    pub(crate) fn strip_expected_change_vector(&mut self) {
        match self {
            WriteCommand::Put(cmd) => cmd.expected_change_vector = None,
            WriteCommand::Delete(cmd) => cmd.expected_change_vector = None,
            WriteCommand::Patch(cmd) => cmd.expected_change_vector = None,
            WriteCommand::AttachmentPut(cmd) => cmd.expected_change_vector = None,
            WriteCommand::AttachmentDelete(cmd) => cmd.expected_change_vector = None,
            WriteCommand::DeleteByPrefix { .. }
            | WriteCommand::ForceRevision { .. }
            | WriteCommand::AttachmentMove(_)
            | WriteCommand::AttachmentCopy(_)
            | WriteCommand::Counters(_)
            | WriteCommand::TimeSeries(_)
            | WriteCommand::TimeSeriesCopy(_) => {}
        }
    }
}

fn json_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(json_size).sum::<usize>(),
        Value::Object(map) => json_size_map(map),
    }
}

fn json_size_map(map: &Map<String, Value>) -> usize {
    2 + map
        .iter()
        .map(|(key, value)| key.len() + 3 + json_size(value))
        .sum::<usize>()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutReply {
    pub id: String,
    pub collection: String,
    pub change_vector: ChangeVector,
    pub last_modified_micros: u64,
    pub flags: DocumentFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteReply {
    pub id: String,
    pub deleted: bool,
    pub change_vector: Option<ChangeVector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchStatus {
    Patched,
    NotModified,
    Created,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchReply {
    pub id: String,
    pub status: PatchStatus,
    pub change_vector: Option<ChangeVector>,
    pub collection: Option<String>,
    pub last_modified_micros: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceRevisionReply {
    pub id: String,
    pub revision_created: bool,
    pub change_vector: ChangeVector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentReply {
    pub document_id: String,
    pub name: String,
    pub hash: String,
    pub content_type: String,
    pub size: u64,
    pub change_vector: ChangeVector,
    /// Filled by the post-batch metadata fix-up of the owning document.
    pub document_change_vector: Option<ChangeVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDeleteReply {
    pub document_id: String,
    pub name: String,
    pub deleted: bool,
    pub document_change_vector: Option<ChangeVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMoveReply {
    pub document_id: String,
    pub name: String,
    pub destination_id: String,
    pub destination_name: String,
    pub hash: String,
    pub change_vector: ChangeVector,
    pub document_change_vector: Option<ChangeVector>,
    pub destination_document_change_vector: Option<ChangeVector>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDetail {
    pub name: String,
    /// `None` once the counter is deleted or when it never existed.
    pub total: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountersReply {
    pub document_id: String,
    pub change_vector: Option<ChangeVector>,
    pub counters: Vec<CounterDetail>,
    pub document_change_vector: Option<ChangeVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesReply {
    pub document_id: String,
    pub name: String,
    pub change_vector: Option<ChangeVector>,
    pub document_change_vector: Option<ChangeVector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandReply {
    Put(PutReply),
    Delete(DeleteReply),
    Patch(PatchReply),
    ForceRevision(ForceRevisionReply),
    AttachmentPut(AttachmentReply),
    AttachmentDelete(AttachmentDeleteReply),
    AttachmentMove(AttachmentMoveReply),
    AttachmentCopy(AttachmentReply),
    Counters(CountersReply),
    TimeSeries(TimeSeriesReply),
    TimeSeriesCopy(TimeSeriesReply),
}

impl CommandReply {
    pub fn id(&self) -> &str {
        match self {
            CommandReply::Put(reply) => &reply.id,
            CommandReply::Delete(reply) => &reply.id,
            CommandReply::Patch(reply) => &reply.id,
            CommandReply::ForceRevision(reply) => &reply.id,
            CommandReply::AttachmentPut(reply) | CommandReply::AttachmentCopy(reply) => {
                &reply.document_id
            }
            CommandReply::AttachmentDelete(reply) => &reply.document_id,
            CommandReply::AttachmentMove(reply) => &reply.document_id,
            CommandReply::Counters(reply) => &reply.document_id,
            CommandReply::TimeSeries(reply) | CommandReply::TimeSeriesCopy(reply) => {
                &reply.document_id
            }
        }
    }

    /// The change vector of the document or item this reply describes.
    pub fn change_vector(&self) -> Option<&ChangeVector> {
        match self {
            CommandReply::Put(reply) => Some(&reply.change_vector),
            CommandReply::Delete(reply) => reply.change_vector.as_ref(),
            CommandReply::Patch(reply) => reply.change_vector.as_ref(),
            CommandReply::ForceRevision(reply) => Some(&reply.change_vector),
            CommandReply::AttachmentPut(reply) | CommandReply::AttachmentCopy(reply) => {
                Some(&reply.change_vector)
            }
            CommandReply::AttachmentDelete(reply) => reply.document_change_vector.as_ref(),
            CommandReply::AttachmentMove(reply) => Some(&reply.change_vector),
            CommandReply::Counters(reply) => reply.change_vector.as_ref(),
            CommandReply::TimeSeries(reply) | CommandReply::TimeSeriesCopy(reply) => {
                reply.change_vector.as_ref()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn time_range_bounds_are_inclusive() {
        let range = TimeRange {
            from: Some(10),
            to: Some(20),
        };
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(21));
        assert!(TimeRange::all().contains(i64::MIN));
    }

    #[test]
    fn size_estimate_grows_with_body() {
        let small = WriteCommand::put("users/1", json!({"a": 1}));
        let large = WriteCommand::put("users/1", json!({"a": "x".repeat(1024)}));
        assert!(large.approximate_size() > small.approximate_size() + 1000);
    }

    #[test]
    fn stripping_expected_vector_keeps_payload() {
        let mut cmd = WriteCommand::put_expecting(
            "users/1",
            json!({"a": 1}),
            ChangeVector::single("A", "db", 1),
        );
        cmd.strip_expected_change_vector();
        assert_eq!(cmd, WriteCommand::put("users/1", json!({"a": 1})));
    }
}
