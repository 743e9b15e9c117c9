use crate::cluster::consensus::{Consensus, ProposalOutcome};
use crate::cluster::proposal::{
    ClusterCommand, ClusterTransactionOptions, ClusterTransactionProposal,
};
use crate::commit::command::{CommandReply, WriteCommand};
use crate::commit::executor::{TransactionMerger, now_micros};
use crate::config::MergeDbConfig;
use crate::error::{MergeDbError, ResourceType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterTransactionState {
    Building,
    Proposed,
    CommitPending,
    Applying,
    Completed,
    Failed,
}

impl ClusterTransactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterTransactionState::Building => "building",
            ClusterTransactionState::Proposed => "proposed",
            ClusterTransactionState::CommitPending => "commit_pending",
            ClusterTransactionState::Applying => "applying",
            ClusterTransactionState::Completed => "completed",
            ClusterTransactionState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterBatchResult {
    pub replies: Vec<CommandReply>,
    pub commit_index: u64,
}

/// Drives cluster-wide batches: propose, wait for the commit index, then
/// apply every committed transaction up to it in index order.
pub struct ClusterTransactionCoordinator {
    consensus: Arc<dyn Consensus>,
    merger: TransactionMerger,
    config: Arc<MergeDbConfig>,
    last_applied: AsyncMutex<u64>,
    /// Outcome per commit index; entries that could not apply keep the
    /// failure message.
    results: Mutex<BTreeMap<u64, Result<ClusterBatchResult, String>>>,
}

impl ClusterTransactionCoordinator {
    pub fn new(
        consensus: Arc<dyn Consensus>,
        merger: TransactionMerger,
        config: Arc<MergeDbConfig>,
    ) -> Self {
        Self {
            consensus,
            merger,
            config,
            last_applied: AsyncMutex::new(0),
            results: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn execute(
        &self,
        commands: Vec<WriteCommand>,
        idempotency_key: impl Into<String>,
        options: ClusterTransactionOptions,
    ) -> Result<ClusterBatchResult, MergeDbError> {
        let commands = commands
            .into_iter()
            .map(ClusterCommand::from_write_command)
            .collect::<Result<Vec<_>, _>>()?;
        self.execute_commands(commands, idempotency_key, options).await
    }

    /// Like `execute`, for callers that also need compare-exchange commands.
    pub async fn execute_commands(
        &self,
        commands: Vec<ClusterCommand>,
        idempotency_key: impl Into<String>,
        options: ClusterTransactionOptions,
    ) -> Result<ClusterBatchResult, MergeDbError> {
        let proposal = ClusterTransactionProposal {
            database: self.config.database_name.clone(),
            idempotency_key: idempotency_key.into(),
            commands,
            options,
            creation_micros: now_micros(),
        };
        proposal.validate(self.config.identity_parts_separator)?;
        let idempotency_key = proposal.idempotency_key.clone();
        trace_state(&idempotency_key, ClusterTransactionState::Proposed);
        let commit_index = match self.consensus.propose(proposal).await? {
            ProposalOutcome::Accepted { commit_index } => commit_index,
            ProposalOutcome::Duplicate { commit_index } => {
                debug!(
                    idempotency_key = %idempotency_key,
                    commit_index, "cluster transaction already proposed"
                );
                commit_index
            }
            ProposalOutcome::Rejected {
                commit_index,
                violations,
            } => {
                warn!(
                    idempotency_key = %idempotency_key,
                    commit_index,
                    violations = violations.len(),
                    "cluster transaction rejected"
                );
                trace_state(&idempotency_key, ClusterTransactionState::Failed);
                return Err(MergeDbError::ClusterTransactionConcurrency {
                    commit_index,
                    violations,
                });
            }
        };
        trace_state(&idempotency_key, ClusterTransactionState::CommitPending);
        let result = self.wait_for_commit(commit_index).await;
        let state = match &result {
            Ok(_) => ClusterTransactionState::Completed,
            Err(_) => ClusterTransactionState::Failed,
        };
        trace_state(&idempotency_key, state);
        result
    }

    /// Waits for `commit_index` and returns its result. Safe to call again
    /// after a `CommitTimeout`; the transaction is applied at most once.
    pub async fn wait_for_commit(
        &self,
        commit_index: u64,
    ) -> Result<ClusterBatchResult, MergeDbError> {
        let timeout = Duration::from_millis(self.config.cluster_commit_timeout_ms);
        if let Err(err) = self
            .consensus
            .wait_for_commit_index(commit_index, timeout)
            .await
        {
            warn!(commit_index, error = %err, "cluster commit not observed");
            return Err(err);
        }
        self.apply_up_to(commit_index).await?;
        let cached = self.results.lock().get(&commit_index).cloned();
        if let Some(result) = cached {
            return result.map_err(|message| MergeDbError::ClusterTransactionFailed {
                commit_index,
                message,
            });
        }
        // evicted from the cache: re-applying only rebuilds the replies
        let entry = self
            .consensus
            .committed_transactions(
                &self.config.database_name,
                commit_index.saturating_sub(1),
                commit_index,
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MergeDbError::NotFound {
                resource_type: ResourceType::ClusterTransaction,
                resource_id: commit_index.to_string(),
            })?;
        self.merger
            .apply_cluster_transaction(entry)
            .await
            .map_err(|err| failed_apply(commit_index, err))
    }

    pub async fn last_applied_index(&self) -> u64 {
        *self.last_applied.lock().await
    }

    async fn apply_up_to(&self, commit_index: u64) -> Result<(), MergeDbError> {
        let mut last_applied = self.last_applied.lock().await;
        if *last_applied >= commit_index {
            return Ok(());
        }
        let entries = self
            .consensus
            .committed_transactions(&self.config.database_name, *last_applied, commit_index)
            .await?;
        for entry in entries {
            let index = entry.commit_index;
            trace_state(
                &entry.proposal.idempotency_key,
                ClusterTransactionState::Applying,
            );
            let result = match self.merger.apply_cluster_transaction(entry).await {
                Ok(result) => Ok(result),
                Err(err) if interrupts_apply(&err) => return Err(err),
                Err(err) => {
                    warn!(
                        commit_index = index,
                        error = %err,
                        "committed cluster transaction cannot apply, moving past it"
                    );
                    Err(err.to_string())
                }
            };
            self.remember(index, result);
            *last_applied = index;
        }
        *last_applied = (*last_applied).max(commit_index);
        Ok(())
    }

    fn remember(&self, commit_index: u64, result: Result<ClusterBatchResult, String>) {
        let mut results = self.results.lock();
        results.insert(commit_index, result);
        while results.len() > self.config.cluster_result_cache_size.max(1) {
            results.pop_first();
        }
    }
}

/// Failures that say nothing about the entry itself; the entry is retried on
/// the next wait instead of being skipped.
fn interrupts_apply(err: &MergeDbError) -> bool {
    matches!(
        err,
        MergeDbError::StorageFatal(_)
            | MergeDbError::Io(_)
            | MergeDbError::QueueFull
            | MergeDbError::Timeout
            | MergeDbError::Unavailable { .. }
    )
}

fn failed_apply(commit_index: u64, err: MergeDbError) -> MergeDbError {
    if interrupts_apply(&err) {
        err
    } else {
        MergeDbError::ClusterTransactionFailed {
            commit_index,
            message: err.to_string(),
        }
    }
}

fn trace_state(idempotency_key: &str, state: ClusterTransactionState) {
    debug!(idempotency_key, state = state.as_str(), "cluster transaction");
}
