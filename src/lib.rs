pub mod bulk;
pub mod change_vector;
pub mod cluster;
pub mod commit;
pub mod config;
pub mod error;
pub mod recording;
pub mod storage;

pub use bulk::{AccumulatorState, BatchSink, PipelineSummary, PipelinedBatchAccumulator, SizedItem};
pub use change_vector::{ChangeVector, ChangeVectorEntry, RAFT_TAG, SharedChangeVector, TRXN_TAG};
pub use cluster::{
    ClusterBatchResult, ClusterCommand, ClusterTransactionCoordinator, ClusterTransactionOptions,
    ClusterTransactionState, ClusterTransactionViolation, Consensus, LocalConsensus, ViolationKind,
};
pub use commit::batch::{Batch, BatchResult};
pub use commit::command::{CommandReply, WriteCommand};
pub use commit::executor::{MergerMetrics, TransactionMerger};
pub use commit::patch::{MergePatchEngine, ScriptEngine};
pub use config::MergeDbConfig;
pub use error::{MergeDbError, MergeDbErrorCode};
pub use recording::{RecordingSummary, ReplayProgress};
pub use storage::{MemoryStorage, StorageEngine};

use crate::storage::documents::Document;
use crate::storage::keyspace::Keyspace;
use futures::Stream;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// A database: the transaction merger that owns every local write plus the
/// coordinator for cluster-wide transactions, wired to one storage engine
/// and one consensus log.
pub struct MergeDbInstance {
    config: Arc<MergeDbConfig>,
    merger: TransactionMerger,
    coordinator: ClusterTransactionCoordinator,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationalMetrics {
    pub batches_total: u64,
    pub batch_errors: u64,
    pub transactions_total: u64,
    pub identity_retries: u64,
    pub fatal_aborts: u64,
    pub conflict_rate: f64,
    pub avg_batch_latency_micros: u64,
    pub inflight_batches: usize,
    pub last_applied_commit_index: u64,
    pub recording_active: bool,
    pub document_count: usize,
}

impl MergeDbInstance {
    /// In-memory storage and a single-node consensus log. Must be called
    /// inside a tokio runtime.
    pub fn open(config: MergeDbConfig) -> Result<Self, MergeDbError> {
        Self::with_components(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(LocalConsensus::new()),
            Arc::new(MergePatchEngine),
        )
    }

    pub fn with_components(
        config: MergeDbConfig,
        storage: Arc<dyn StorageEngine>,
        consensus: Arc<dyn Consensus>,
        scripts: Arc<dyn ScriptEngine>,
    ) -> Result<Self, MergeDbError> {
        let merger = TransactionMerger::new(config, storage, scripts)?;
        let config = Arc::new(merger.config().clone());
        let coordinator =
            ClusterTransactionCoordinator::new(consensus, merger.clone(), Arc::clone(&config));
        info!(
            database = %config.database_name,
            node_tag = %config.node_tag,
            max_batches_per_transaction = config.max_batches_per_transaction,
            "database opened"
        );
        Ok(Self {
            config,
            merger,
            coordinator,
        })
    }

    pub async fn submit_batch(
        &self,
        commands: Vec<WriteCommand>,
    ) -> Result<BatchResult, MergeDbError> {
        self.merger.enqueue(Batch::new(commands)).await
    }

    /// For batches built with [`Batch::put_attachment`].
    pub async fn submit_prepared_batch(&self, batch: Batch) -> Result<BatchResult, MergeDbError> {
        self.merger.enqueue(batch).await
    }

    pub async fn submit_cluster_batch(
        &self,
        commands: Vec<WriteCommand>,
        idempotency_key: impl Into<String>,
    ) -> Result<ClusterBatchResult, MergeDbError> {
        self.coordinator
            .execute(commands, idempotency_key, ClusterTransactionOptions::default())
            .await
    }

    pub async fn submit_cluster_transaction(
        &self,
        commands: Vec<ClusterCommand>,
        idempotency_key: impl Into<String>,
        options: ClusterTransactionOptions,
    ) -> Result<ClusterBatchResult, MergeDbError> {
        self.coordinator
            .execute_commands(commands, idempotency_key, options)
            .await
    }

    /// Waits again for a cluster transaction that returned `CommitTimeout`.
    pub async fn wait_for_cluster_transaction(
        &self,
        commit_index: u64,
    ) -> Result<ClusterBatchResult, MergeDbError> {
        self.coordinator.wait_for_commit(commit_index).await
    }

    pub async fn start_recording(&self, path: &Path) -> Result<(), MergeDbError> {
        self.merger.start_recording(path).await
    }

    pub async fn stop_recording(&self) -> Result<RecordingSummary, MergeDbError> {
        self.merger.stop_recording().await
    }

    pub fn replay(
        &self,
        path: &Path,
    ) -> impl Stream<Item = Result<ReplayProgress, MergeDbError>> + use<> {
        self.merger.replay(path)
    }

    /// Accumulator feeding this database, sized by the bulk settings.
    pub fn bulk_accumulator(&self) -> PipelinedBatchAccumulator<WriteCommand> {
        PipelinedBatchAccumulator::new(
            self.merger.clone(),
            self.config.bulk_insert_threshold_bytes,
            self.config.bulk_min_flush_bytes,
        )
    }

    pub async fn bulk_insert(
        &self,
        commands: impl IntoIterator<Item = WriteCommand>,
    ) -> Result<PipelineSummary, MergeDbError> {
        let mut accumulator = self.bulk_accumulator();
        for command in commands {
            accumulator.add(command).await?;
            accumulator.maybe_flush()?;
        }
        accumulator.finish().await
    }

    pub fn get_document(&self, id: &str) -> Option<Document> {
        self.merger.snapshot().document(id).cloned()
    }

    pub fn snapshot(&self) -> Keyspace {
        self.merger.snapshot()
    }

    pub fn database_change_vector(&self) -> ChangeVector {
        self.merger.database_change_vector()
    }

    pub fn merger(&self) -> &TransactionMerger {
        &self.merger
    }

    pub fn coordinator(&self) -> &ClusterTransactionCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &MergeDbConfig {
        &self.config
    }

    pub fn metrics(&self) -> MergerMetrics {
        self.merger.metrics()
    }

    pub async fn operational_metrics(&self) -> OperationalMetrics {
        let core = self.merger.metrics();
        let conflict_rate = if core.batches_total == 0 {
            0.0
        } else {
            core.conflict_rejections as f64 / core.batches_total as f64
        };
        OperationalMetrics {
            batches_total: core.batches_total,
            batch_errors: core.batch_errors,
            transactions_total: core.transactions_total,
            identity_retries: core.identity_retries,
            fatal_aborts: core.fatal_aborts,
            conflict_rate,
            avg_batch_latency_micros: core.avg_batch_latency_micros,
            inflight_batches: core.inflight_batches,
            last_applied_commit_index: self.coordinator.last_applied_index().await,
            recording_active: self.merger.is_recording().await,
            document_count: self.merger.snapshot().document_count(),
        }
    }
}
