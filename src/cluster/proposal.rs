use crate::change_vector::{ChangeVector, TRXN_TAG};
use crate::commit::command::{ForceRevisionStrategy, WriteCommand};
use crate::error::MergeDbError;
use crate::storage::documents::lower_id;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ATOMIC_GUARD_PREFIX: &str = "rvn-atomic/";

/// Compare-exchange key guarding a document written by cluster transactions.
pub fn atomic_guard_key(document_id: &str) -> String {
    format!("{ATOMIC_GUARD_PREFIX}{}", lower_id(document_id))
}

/// Guard index a write expects, taken from the `TRXN` entry of its change
/// vector. Zero means the guard must not exist.
pub fn expected_guard_index(change_vector: Option<&ChangeVector>) -> u64 {
    change_vector
        .map(|cv| {
            cv.entries()
                .iter()
                .filter(|entry| entry.tag == TRXN_TAG)
                .map(|entry| entry.counter)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterCommand {
    Put {
        id: String,
        body: Value,
        #[serde(default)]
        expected_change_vector: Option<ChangeVector>,
    },
    Delete {
        id: String,
        #[serde(default)]
        expected_change_vector: Option<ChangeVector>,
    },
    CompareExchangePut {
        key: String,
        value: Value,
        expected_index: u64,
    },
    CompareExchangeDelete {
        key: String,
        expected_index: u64,
    },
}

impl ClusterCommand {
    /// Only plain puts and deletes can be guarded cluster-wide.
    pub fn from_write_command(command: WriteCommand) -> Result<Self, MergeDbError> {
        match command {
            WriteCommand::Put(put)
                if put.force_revision == ForceRevisionStrategy::None && !put.must_be_new =>
            {
                Ok(ClusterCommand::Put {
                    id: put.id,
                    body: put.body,
                    expected_change_vector: put.expected_change_vector,
                })
            }
            WriteCommand::Delete(delete) => Ok(ClusterCommand::Delete {
                id: delete.id,
                expected_change_vector: delete.expected_change_vector,
            }),
            other => Err(MergeDbError::UnsupportedInClusterTransaction {
                command: other.name().to_string(),
            }),
        }
    }

    pub fn document_id(&self) -> Option<&str> {
        match self {
            ClusterCommand::Put { id, .. } | ClusterCommand::Delete { id, .. } => Some(id),
            ClusterCommand::CompareExchangePut { .. }
            | ClusterCommand::CompareExchangeDelete { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClusterCommand::Put { .. } => "PUT",
            ClusterCommand::Delete { .. } => "DELETE",
            ClusterCommand::CompareExchangePut { .. } => "COMPARE_EXCHANGE_PUT",
            ClusterCommand::CompareExchangeDelete { .. } => "COMPARE_EXCHANGE_DELETE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTransactionOptions {
    /// Skip atomic guards; resulting change vectors carry no `TRXN` entry.
    pub disable_atomic_document_writes: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTransactionProposal {
    pub database: String,
    pub idempotency_key: String,
    pub commands: Vec<ClusterCommand>,
    #[serde(default)]
    pub options: ClusterTransactionOptions,
    pub creation_micros: u64,
}

impl ClusterTransactionProposal {
    pub fn validate(&self, separator: char) -> Result<(), MergeDbError> {
        if self.commands.is_empty() {
            return Err(MergeDbError::Validation(
                "cluster transaction has no commands".into(),
            ));
        }
        if self.idempotency_key.is_empty() {
            return Err(MergeDbError::Validation(
                "cluster transaction requires an idempotency key".into(),
            ));
        }
        for command in &self.commands {
            let id = match command {
                ClusterCommand::Put { id, .. } | ClusterCommand::Delete { id, .. } => id,
                ClusterCommand::CompareExchangePut { key, .. }
                | ClusterCommand::CompareExchangeDelete { key, .. } => key,
            };
            if id.is_empty() || id.ends_with(separator) || id.ends_with('|') {
                return Err(MergeDbError::Validation(format!(
                    "'{id}' is not a valid id in a cluster transaction; server-generated ids are not allowed"
                )));
            }
            if let ClusterCommand::Put { body, .. } = command
                && !body.is_object()
            {
                return Err(MergeDbError::Validation(format!(
                    "document '{id}' body must be a JSON object"
                )));
            }
            if command.document_id().is_none() && id.starts_with(ATOMIC_GUARD_PREFIX) {
                return Err(MergeDbError::Validation(format!(
                    "compare exchange key '{id}' is reserved for atomic guards"
                )));
            }
        }
        Ok(())
    }

    /// Puts and deletes; each advances the database's raft command count.
    pub fn document_command_count(&self) -> u64 {
        self.commands
            .iter()
            .filter(|command| command.document_id().is_some())
            .count() as u64
    }
}

/// A proposal the consensus layer accepted, with its position in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedClusterTransaction {
    pub commit_index: u64,
    /// Raft command count of the database before this transaction.
    pub previous_count: u64,
    pub proposal: ClusterTransactionProposal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    Document,
    CompareExchange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTransactionViolation {
    pub id: String,
    pub expected: u64,
    pub actual: Option<u64>,
    pub kind: ViolationKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::command::PatchRequest;
    use serde_json::json;

    fn proposal(commands: Vec<ClusterCommand>) -> ClusterTransactionProposal {
        ClusterTransactionProposal {
            database: "db".into(),
            idempotency_key: "key-1".into(),
            commands,
            options: ClusterTransactionOptions::default(),
            creation_micros: 1,
        }
    }

    #[test]
    fn only_put_and_delete_convert() {
        assert!(
            ClusterCommand::from_write_command(WriteCommand::put("users/1", json!({}))).is_ok()
        );
        assert!(ClusterCommand::from_write_command(WriteCommand::delete("users/1")).is_ok());
        let err = ClusterCommand::from_write_command(WriteCommand::patch(
            "users/1",
            PatchRequest::new("{}"),
        ))
        .expect_err("patch is not guardable");
        match err {
            MergeDbError::UnsupportedInClusterTransaction { command } => {
                assert_eq!(command, "PATCH")
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(
            ClusterCommand::from_write_command(WriteCommand::DeleteByPrefix {
                id_prefix: "users/".into()
            })
            .is_err()
        );
    }

    #[test]
    fn server_generated_ids_are_rejected() {
        let sep = '/';
        for id in ["users/", "users|", ""] {
            let p = proposal(vec![ClusterCommand::Delete {
                id: id.into(),
                expected_change_vector: None,
            }]);
            assert!(p.validate(sep).is_err(), "id {id:?} must be rejected");
        }
        let p = proposal(vec![ClusterCommand::CompareExchangePut {
            key: atomic_guard_key("users/1"),
            value: json!(1),
            expected_index: 0,
        }]);
        assert!(p.validate(sep).is_err());
        assert!(proposal(Vec::new()).validate(sep).is_err());
    }

    #[test]
    fn put_body_must_be_an_object() {
        let p = proposal(vec![ClusterCommand::Put {
            id: "users/1".into(),
            body: json!(1),
            expected_change_vector: None,
        }]);
        let err = p.validate('/').expect_err("scalar body");
        assert!(matches!(err, MergeDbError::Validation(_)));
    }

    #[test]
    fn guard_index_comes_from_trxn_entry() {
        let cv = ChangeVector::single("A", "db", 9).with_bumped(TRXN_TAG, "tx", 4);
        assert_eq!(expected_guard_index(Some(&cv)), 4);
        assert_eq!(expected_guard_index(Some(&ChangeVector::single("A", "db", 9))), 0);
        assert_eq!(expected_guard_index(None), 0);
        assert_eq!(atomic_guard_key("Users/1"), "rvn-atomic/users/1");
    }

    #[test]
    fn compare_exchange_commands_do_not_count_as_document_commands() {
        let p = proposal(vec![
            ClusterCommand::Put {
                id: "users/1".into(),
                body: json!({}),
                expected_change_vector: None,
            },
            ClusterCommand::CompareExchangePut {
                key: "names/a".into(),
                value: json!("users/1"),
                expected_index: 0,
            },
            ClusterCommand::Delete {
                id: "users/2".into(),
                expected_change_vector: None,
            },
        ]);
        assert_eq!(p.document_command_count(), 2);
    }
}
