use crate::cluster::proposal::{
    ClusterCommand, ClusterTransactionProposal, ClusterTransactionViolation,
    CommittedClusterTransaction, ViolationKind, atomic_guard_key, expected_guard_index,
};
use crate::error::MergeDbError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalOutcome {
    Accepted { commit_index: u64 },
    /// The idempotency key was already accepted at `commit_index`.
    Duplicate { commit_index: u64 },
    Rejected {
        commit_index: u64,
        violations: Vec<ClusterTransactionViolation>,
    },
}

/// Contract of the replicated log the coordinator proposes to.
#[async_trait]
pub trait Consensus: Send + Sync {
    async fn propose(
        &self,
        proposal: ClusterTransactionProposal,
    ) -> Result<ProposalOutcome, MergeDbError>;

    /// Resolves once the local node observed `commit_index`, or fails with
    /// `CommitTimeout` carrying the index.
    async fn wait_for_commit_index(
        &self,
        commit_index: u64,
        timeout: Duration,
    ) -> Result<(), MergeDbError>;

    /// Committed transactions of `database` with `after < index <= up_to`,
    /// in index order.
    async fn committed_transactions(
        &self,
        database: &str,
        after: u64,
        up_to: u64,
    ) -> Result<Vec<CommittedClusterTransaction>, MergeDbError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareExchangeValue {
    pub value: Value,
    pub index: u64,
}

#[derive(Debug, Default)]
struct ConsensusState {
    last_index: u64,
    log: BTreeMap<u64, CommittedClusterTransaction>,
    idempotency: HashMap<(String, String), u64>,
    command_counts: HashMap<String, u64>,
    compare_exchange: BTreeMap<String, CompareExchangeValue>,
}

/// Single-node consensus: proposals are validated and committed in-process.
/// Commits can be held back to simulate a slow leader.
#[derive(Debug, Default)]
pub struct LocalConsensus {
    state: Mutex<ConsensusState>,
    committed_index: AtomicU64,
    hold_commits: AtomicBool,
    notify: Notify,
}

impl LocalConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted proposals stay invisible to waiters until `release_commits`.
    pub fn hold_commits(&self) {
        self.hold_commits.store(true, Ordering::Release);
    }

    pub fn release_commits(&self) {
        self.hold_commits.store(false, Ordering::Release);
        let last = self.state.lock().last_index;
        self.advance(last);
    }

    pub fn committed_index(&self) -> u64 {
        self.committed_index.load(Ordering::Acquire)
    }

    pub fn last_index(&self) -> u64 {
        self.state.lock().last_index
    }

    pub fn compare_exchange_value(&self, key: &str) -> Option<CompareExchangeValue> {
        self.state.lock().compare_exchange.get(key).cloned()
    }

    /// Index of the last cluster transaction that wrote `document_id`.
    pub fn atomic_guard_index(&self, document_id: &str) -> Option<u64> {
        self.state
            .lock()
            .compare_exchange
            .get(&atomic_guard_key(document_id))
            .map(|entry| entry.index)
    }

    fn advance(&self, index: u64) {
        let previous = self.committed_index.fetch_max(index, Ordering::AcqRel);
        if index > previous {
            self.notify.notify_waiters();
        }
    }
}

fn check_guard(
    table: &BTreeMap<String, CompareExchangeValue>,
    id: &str,
    key: &str,
    expected: u64,
    kind: ViolationKind,
) -> Option<ClusterTransactionViolation> {
    let actual = table.get(key).map(|entry| entry.index);
    if actual.unwrap_or(0) == expected {
        return None;
    }
    let message = match (kind, actual) {
        (ViolationKind::Document, None) => format!(
            "document '{id}' was expected to have been written by cluster transaction {expected} but has no atomic guard"
        ),
        (ViolationKind::Document, Some(actual)) if expected == 0 => format!(
            "document '{id}' was expected to be new but its atomic guard is at index {actual}"
        ),
        (ViolationKind::Document, Some(actual)) => format!(
            "document '{id}' atomic guard is at index {actual}, expected {expected}"
        ),
        (ViolationKind::CompareExchange, actual) => format!(
            "compare exchange '{id}' is at index {}, expected {expected}",
            actual.unwrap_or(0)
        ),
    };
    Some(ClusterTransactionViolation {
        id: id.to_string(),
        expected,
        actual,
        kind,
        message,
    })
}

fn collect_violations(
    table: &BTreeMap<String, CompareExchangeValue>,
    proposal: &ClusterTransactionProposal,
) -> Vec<ClusterTransactionViolation> {
    let guarded = !proposal.options.disable_atomic_document_writes;
    let mut violations = Vec::new();
    for command in &proposal.commands {
        let violation = match command {
            ClusterCommand::Put {
                id,
                expected_change_vector,
                ..
            } if guarded => check_guard(
                table,
                id,
                &atomic_guard_key(id),
                expected_guard_index(expected_change_vector.as_ref()),
                ViolationKind::Document,
            ),
            // A delete without a change vector removes whatever is there.
            ClusterCommand::Delete {
                id,
                expected_change_vector: Some(cv),
            } if guarded => check_guard(
                table,
                id,
                &atomic_guard_key(id),
                expected_guard_index(Some(cv)),
                ViolationKind::Document,
            ),
            ClusterCommand::CompareExchangePut {
                key,
                expected_index,
                ..
            }
            | ClusterCommand::CompareExchangeDelete {
                key,
                expected_index,
            } => check_guard(table, key, key, *expected_index, ViolationKind::CompareExchange),
            _ => None,
        };
        violations.extend(violation);
    }
    violations
}

fn apply_guards(
    table: &mut BTreeMap<String, CompareExchangeValue>,
    proposal: &ClusterTransactionProposal,
    commit_index: u64,
) {
    let guarded = !proposal.options.disable_atomic_document_writes;
    for command in &proposal.commands {
        match command {
            ClusterCommand::Put { id, .. } if guarded => {
                table.insert(
                    atomic_guard_key(id),
                    CompareExchangeValue {
                        value: json!({ "Id": id }),
                        index: commit_index,
                    },
                );
            }
            ClusterCommand::Delete { id, .. } if guarded => {
                table.remove(&atomic_guard_key(id));
            }
            ClusterCommand::CompareExchangePut { key, value, .. } => {
                table.insert(
                    key.clone(),
                    CompareExchangeValue {
                        value: value.clone(),
                        index: commit_index,
                    },
                );
            }
            ClusterCommand::CompareExchangeDelete { key, .. } => {
                table.remove(key);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    async fn propose(
        &self,
        proposal: ClusterTransactionProposal,
    ) -> Result<ProposalOutcome, MergeDbError> {
        let (outcome, committed) = {
            let mut state = self.state.lock();
            let dedup_key = (proposal.database.clone(), proposal.idempotency_key.clone());
            if let Some(&commit_index) = state.idempotency.get(&dedup_key) {
                return Ok(ProposalOutcome::Duplicate { commit_index });
            }
            state.last_index += 1;
            let commit_index = state.last_index;
            let violations = collect_violations(&state.compare_exchange, &proposal);
            if !violations.is_empty() {
                debug!(
                    commit_index,
                    violations = violations.len(),
                    "cluster transaction rejected"
                );
                (
                    ProposalOutcome::Rejected {
                        commit_index,
                        violations,
                    },
                    commit_index,
                )
            } else {
                apply_guards(&mut state.compare_exchange, &proposal, commit_index);
                let count = state
                    .command_counts
                    .entry(proposal.database.clone())
                    .or_insert(0);
                let previous_count = *count;
                *count += proposal.document_command_count();
                state.idempotency.insert(dedup_key, commit_index);
                state.log.insert(
                    commit_index,
                    CommittedClusterTransaction {
                        commit_index,
                        previous_count,
                        proposal,
                    },
                );
                (ProposalOutcome::Accepted { commit_index }, commit_index)
            }
        };
        if !self.hold_commits.load(Ordering::Acquire) {
            self.advance(committed);
        }
        Ok(outcome)
    }

    async fn wait_for_commit_index(
        &self,
        commit_index: u64,
        timeout: Duration,
    ) -> Result<(), MergeDbError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.committed_index() >= commit_index {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MergeDbError::CommitTimeout { commit_index });
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err()
                && self.committed_index() < commit_index
            {
                return Err(MergeDbError::CommitTimeout { commit_index });
            }
        }
    }

    async fn committed_transactions(
        &self,
        database: &str,
        after: u64,
        up_to: u64,
    ) -> Result<Vec<CommittedClusterTransaction>, MergeDbError> {
        let visible = up_to.min(self.committed_index());
        if visible <= after {
            return Ok(Vec::new());
        }
        let state = self.state.lock();
        Ok(state
            .log
            .range(after + 1..=visible)
            .filter(|(_, entry)| entry.proposal.database == database)
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}
