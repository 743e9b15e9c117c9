use crate::change_vector::ChangeVector;
use crate::cluster::ClusterTransactionViolation;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Document,
    Attachment,
    Counter,
    TimeSeries,
    ClusterTransaction,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Document => write!(f, "document"),
            ResourceType::Attachment => write!(f, "attachment"),
            ResourceType::Counter => write!(f, "counter"),
            ResourceType::TimeSeries => write!(f, "time series"),
            ResourceType::ClusterTransaction => write!(f, "cluster transaction"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDbErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    Unavailable,
    DocumentNotFound,
    AttachmentNotFound,
    CounterNotFound,
    TimeSeriesNotFound,
    ClusterTransactionNotFound,
    ConcurrencyViolation,
    ClusterTransactionConcurrency,
    UnsupportedInClusterTransaction,
    IdentityCollision,
    CollectionMismatch,
    ClusterTransactionFailed,
    RecordingAlreadyActive,
    RecordingNotActive,
    CommitTimeout,
    StorageFatal,
    QueueFull,
    Timeout,
}

impl MergeDbErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeDbErrorCode::Io => "io",
            MergeDbErrorCode::Encode => "encode",
            MergeDbErrorCode::Decode => "decode",
            MergeDbErrorCode::Validation => "validation",
            MergeDbErrorCode::InvalidConfig => "invalid_config",
            MergeDbErrorCode::Unavailable => "unavailable",
            MergeDbErrorCode::DocumentNotFound => "document_not_found",
            MergeDbErrorCode::AttachmentNotFound => "attachment_not_found",
            MergeDbErrorCode::CounterNotFound => "counter_not_found",
            MergeDbErrorCode::TimeSeriesNotFound => "time_series_not_found",
            MergeDbErrorCode::ClusterTransactionNotFound => "cluster_transaction_not_found",
            MergeDbErrorCode::ConcurrencyViolation => "concurrency_violation",
            MergeDbErrorCode::ClusterTransactionConcurrency => "cluster_transaction_concurrency",
            MergeDbErrorCode::UnsupportedInClusterTransaction => {
                "unsupported_in_cluster_transaction"
            }
            MergeDbErrorCode::IdentityCollision => "identity_collision",
            MergeDbErrorCode::CollectionMismatch => "collection_mismatch",
            MergeDbErrorCode::ClusterTransactionFailed => "cluster_transaction_failed",
            MergeDbErrorCode::RecordingAlreadyActive => "recording_already_active",
            MergeDbErrorCode::RecordingNotActive => "recording_not_active",
            MergeDbErrorCode::CommitTimeout => "commit_timeout",
            MergeDbErrorCode::StorageFatal => "storage_fatal",
            MergeDbErrorCode::QueueFull => "queue_full",
            MergeDbErrorCode::Timeout => "timeout",
        }
    }

    /// Stable numeric code, used by callers that cannot carry strings.
    pub fn code(self) -> u16 {
        match self {
            MergeDbErrorCode::Io => 1,
            MergeDbErrorCode::Encode => 2,
            MergeDbErrorCode::Decode => 3,
            MergeDbErrorCode::Validation => 4,
            MergeDbErrorCode::InvalidConfig => 5,
            MergeDbErrorCode::Unavailable => 6,
            MergeDbErrorCode::DocumentNotFound => 100,
            MergeDbErrorCode::AttachmentNotFound => 101,
            MergeDbErrorCode::CounterNotFound => 102,
            MergeDbErrorCode::TimeSeriesNotFound => 103,
            MergeDbErrorCode::ClusterTransactionNotFound => 104,
            MergeDbErrorCode::ConcurrencyViolation => 200,
            MergeDbErrorCode::ClusterTransactionConcurrency => 201,
            MergeDbErrorCode::UnsupportedInClusterTransaction => 202,
            MergeDbErrorCode::IdentityCollision => 203,
            MergeDbErrorCode::CollectionMismatch => 204,
            MergeDbErrorCode::ClusterTransactionFailed => 205,
            MergeDbErrorCode::RecordingAlreadyActive => 300,
            MergeDbErrorCode::RecordingNotActive => 301,
            MergeDbErrorCode::CommitTimeout => 400,
            MergeDbErrorCode::StorageFatal => 401,
            MergeDbErrorCode::QueueFull => 402,
            MergeDbErrorCode::Timeout => 403,
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeDbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error(
        "concurrency violation on '{id}': expected change vector {}, actual {}",
        display_optional_vector(.expected),
        display_optional_vector(.actual)
    )]
    ConcurrencyViolation {
        id: String,
        expected: Option<ChangeVector>,
        actual: Option<ChangeVector>,
    },
    #[error(
        "cluster transaction at index {commit_index} rejected with {} violation(s)",
        .violations.len()
    )]
    ClusterTransactionConcurrency {
        commit_index: u64,
        violations: Vec<ClusterTransactionViolation>,
    },
    #[error("{command} is not supported in a cluster-wide transaction")]
    UnsupportedInClusterTransaction { command: String },
    #[error("generated identity '{id}' collides with an existing document")]
    IdentityCollision { id: String, command_index: usize },
    #[error("document '{id}' belongs to collection '{existing}', cannot move it to '{requested}'")]
    CollectionMismatch {
        id: String,
        existing: String,
        requested: String,
    },
    /// A committed cluster transaction that can never apply; the log moves
    /// past it.
    #[error("cluster transaction at index {commit_index} failed to apply: {message}")]
    ClusterTransactionFailed { commit_index: u64, message: String },
    #[error("another recording is already in progress")]
    RecordingAlreadyActive,
    #[error("no recording is in progress")]
    RecordingNotActive,
    #[error("cluster transaction at index {commit_index} was not committed in time")]
    CommitTimeout { commit_index: u64 },
    #[error("storage fatal: {0}")]
    StorageFatal(String),
    #[error("queue full")]
    QueueFull,
    #[error("timeout")]
    Timeout,
}

fn display_optional_vector(vector: &Option<ChangeVector>) -> String {
    match vector {
        Some(cv) if cv.is_empty() => "<empty>".to_string(),
        Some(cv) => cv.to_string(),
        None => "<none>".to_string(),
    }
}

impl MergeDbError {
    pub fn code(&self) -> MergeDbErrorCode {
        match self {
            MergeDbError::Io(_) => MergeDbErrorCode::Io,
            MergeDbError::Encode(_) => MergeDbErrorCode::Encode,
            MergeDbError::Decode(_) => MergeDbErrorCode::Decode,
            MergeDbError::Validation(_) => MergeDbErrorCode::Validation,
            MergeDbError::InvalidConfig { .. } => MergeDbErrorCode::InvalidConfig,
            MergeDbError::Unavailable { .. } => MergeDbErrorCode::Unavailable,
            MergeDbError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Document => MergeDbErrorCode::DocumentNotFound,
                ResourceType::Attachment => MergeDbErrorCode::AttachmentNotFound,
                ResourceType::Counter => MergeDbErrorCode::CounterNotFound,
                ResourceType::TimeSeries => MergeDbErrorCode::TimeSeriesNotFound,
                ResourceType::ClusterTransaction => MergeDbErrorCode::ClusterTransactionNotFound,
            },
            MergeDbError::ConcurrencyViolation { .. } => MergeDbErrorCode::ConcurrencyViolation,
            MergeDbError::ClusterTransactionConcurrency { .. } => {
                MergeDbErrorCode::ClusterTransactionConcurrency
            }
            MergeDbError::UnsupportedInClusterTransaction { .. } => {
                MergeDbErrorCode::UnsupportedInClusterTransaction
            }
            MergeDbError::IdentityCollision { .. } => MergeDbErrorCode::IdentityCollision,
            MergeDbError::CollectionMismatch { .. } => MergeDbErrorCode::CollectionMismatch,
            MergeDbError::ClusterTransactionFailed { .. } => {
                MergeDbErrorCode::ClusterTransactionFailed
            }
            MergeDbError::RecordingAlreadyActive => MergeDbErrorCode::RecordingAlreadyActive,
            MergeDbError::RecordingNotActive => MergeDbErrorCode::RecordingNotActive,
            MergeDbError::CommitTimeout { .. } => MergeDbErrorCode::CommitTimeout,
            MergeDbError::StorageFatal(_) => MergeDbErrorCode::StorageFatal,
            MergeDbError::QueueFull => MergeDbErrorCode::QueueFull,
            MergeDbError::Timeout => MergeDbErrorCode::Timeout,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Errors a caller can resolve by reloading state and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MergeDbError::ConcurrencyViolation { .. }
                | MergeDbError::ClusterTransactionConcurrency { .. }
                | MergeDbError::CommitTimeout { .. }
                | MergeDbError::Timeout
        )
    }

    pub(crate) fn document_not_found(id: &str) -> Self {
        MergeDbError::NotFound {
            resource_type: ResourceType::Document,
            resource_id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MergeDbError, MergeDbErrorCode, ResourceType};
    use crate::change_vector::ChangeVector;

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(MergeDbErrorCode::DocumentNotFound.as_str(), "document_not_found");
        assert_eq!(
            MergeDbErrorCode::UnsupportedInClusterTransaction.as_str(),
            "unsupported_in_cluster_transaction"
        );
        assert_eq!(MergeDbErrorCode::StorageFatal.code(), 401);
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = MergeDbError::NotFound {
            resource_type: ResourceType::Attachment,
            resource_id: "users/1".into(),
        };
        assert_eq!(err.code(), MergeDbErrorCode::AttachmentNotFound);
        assert_eq!(err.code_str(), "attachment_not_found");
    }

    #[test]
    fn concurrency_violation_message_names_both_vectors() {
        let actual: ChangeVector = "A:3-db1".parse().expect("parse");
        let err = MergeDbError::ConcurrencyViolation {
            id: "users/1".into(),
            expected: Some(ChangeVector::new()),
            actual: Some(actual),
        };
        let text = err.to_string();
        assert!(text.contains("<empty>"));
        assert!(text.contains("A:3-db1"));
        assert!(err.is_retryable());
        assert!(!MergeDbError::StorageFatal("disk".into()).is_retryable());
    }
}
