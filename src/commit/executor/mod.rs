use crate::change_vector::{ChangeVector, SharedChangeVector};
use crate::cluster::{ClusterBatchResult, CommittedClusterTransaction};
use crate::commit::apply::{ExecutionContext, execute_batch};
use crate::commit::batch::{Batch, BatchResult};
use crate::commit::patch::ScriptEngine;
use crate::config::MergeDbConfig;
use crate::error::MergeDbError;
use crate::recording::{self, RecordedEntry, RecordingSummary, ReplayProgress, TransactionRecorder};
use crate::storage::StorageEngine;
use crate::storage::keyspace::Keyspace;
use futures::Stream;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc as tokio_mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Unit of work the apply loop merges into physical transactions.
#[derive(Debug)]
pub(crate) enum MergedWork {
    Batch(Batch),
    ClusterTransaction(CommittedClusterTransaction),
}

impl MergedWork {
    fn command_count(&self) -> usize {
        match self {
            MergedWork::Batch(batch) => batch.len(),
            MergedWork::ClusterTransaction(entry) => entry.proposal.commands.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WorkOutcome {
    Batch(BatchResult),
    Cluster(ClusterBatchResult),
}

struct WorkRequest {
    work: MergedWork,
    enqueue_micros: u64,
    result_tx: oneshot::Sender<Result<WorkOutcome, MergeDbError>>,
}

struct MergerState {
    storage: Arc<dyn StorageEngine>,
    scripts: Arc<dyn ScriptEngine>,
    config: Arc<MergeDbConfig>,
    change_vector: Arc<SharedChangeVector>,
    recorder: Option<TransactionRecorder>,
}

/// Single-writer actor: every batch and committed cluster transaction goes
/// through one apply loop that coalesces pending work into one physical
/// storage transaction per epoch.
#[derive(Clone)]
pub struct TransactionMerger {
    ingress_tx: tokio_mpsc::Sender<WorkRequest>,
    config: Arc<MergeDbConfig>,
    state: Arc<Mutex<MergerState>>,
    storage: Arc<dyn StorageEngine>,
    change_vector: Arc<SharedChangeVector>,
    telemetry: Arc<MergerTelemetry>,
    background_tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

#[derive(Debug, Default)]
struct MergerTelemetry {
    inflight_batches: AtomicUsize,
    batches_total: AtomicU64,
    batch_errors: AtomicU64,
    commands_total: AtomicU64,
    transactions_total: AtomicU64,
    fatal_aborts: AtomicU64,
    identity_retries: AtomicU64,
    conflict_rejections: AtomicU64,
    queue_full_rejections: AtomicU64,
    timeout_rejections: AtomicU64,
    total_latency_micros: AtomicU64,
    epochs_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergerMetrics {
    pub inflight_batches: usize,
    pub batches_total: u64,
    pub batch_errors: u64,
    pub commands_total: u64,
    pub transactions_total: u64,
    pub fatal_aborts: u64,
    pub identity_retries: u64,
    pub conflict_rejections: u64,
    pub queue_full_rejections: u64,
    pub timeout_rejections: u64,
    pub avg_batch_latency_micros: u64,
    pub epochs_total: u64,
}

impl TransactionMerger {
    /// Spawns the apply loop; must be called inside a tokio runtime.
    pub fn new(
        config: MergeDbConfig,
        storage: Arc<dyn StorageEngine>,
        scripts: Arc<dyn ScriptEngine>,
    ) -> Result<Self, MergeDbError> {
        config.validate()?;
        let config = Arc::new(config);
        let change_vector = Arc::new(SharedChangeVector::new(
            storage.snapshot().database_change_vector().clone(),
        ));
        let state = Arc::new(Mutex::new(MergerState {
            storage: Arc::clone(&storage),
            scripts,
            config: Arc::clone(&config),
            change_vector: Arc::clone(&change_vector),
            recorder: None,
        }));
        let (ingress_tx, mut rx) =
            tokio_mpsc::channel::<WorkRequest>(config.merger_queue_capacity.max(1));
        let telemetry = Arc::new(MergerTelemetry::default());
        let background_tasks = Arc::new(StdMutex::new(Vec::new()));

        let loop_state = Arc::clone(&state);
        let loop_config = Arc::clone(&config);
        let loop_telemetry = Arc::clone(&telemetry);
        let apply_handle = tokio::spawn(async move {
            let mut pending = VecDeque::new();
            let mut ingress_closed = false;

            loop {
                if pending.is_empty() && !ingress_closed {
                    match rx.recv().await {
                        Some(req) => pending.push_back(req),
                        None => ingress_closed = true,
                    }
                }
                while let Ok(req) = rx.try_recv() {
                    pending.push_back(req);
                }
                if pending.is_empty() {
                    break;
                }

                let deadline =
                    Instant::now() + Duration::from_micros(loop_config.epoch_max_wait_us);
                let epoch_requests = build_epoch_requests(
                    &mut pending,
                    loop_config.max_batches_per_transaction.max(1),
                    loop_config.max_commands_per_transaction.max(1),
                    deadline,
                    &mut rx,
                    ingress_closed,
                )
                .await;
                let command_count: usize = epoch_requests
                    .iter()
                    .map(|req| req.work.command_count())
                    .sum();
                debug!(
                    batches = epoch_requests.len(),
                    commands = command_count,
                    queued = pending.len(),
                    "merging epoch"
                );
                let mut s = loop_state.lock().await;
                let epoch_result = process_merged_epoch(&mut s, epoch_requests);
                drop(s);

                loop_telemetry.epochs_total.fetch_add(1, Ordering::Relaxed);
                loop_telemetry
                    .identity_retries
                    .fetch_add(epoch_result.identity_retries, Ordering::Relaxed);
                if epoch_result.committed {
                    loop_telemetry
                        .transactions_total
                        .fetch_add(1, Ordering::Relaxed);
                }
                if epoch_result.fatal {
                    loop_telemetry.fatal_aborts.fetch_add(1, Ordering::Relaxed);
                }
                loop_telemetry
                    .commands_total
                    .fetch_add(command_count as u64, Ordering::Relaxed);

                for outcome in epoch_result.outcomes {
                    let elapsed_micros = now_micros().saturating_sub(outcome.enqueue_micros);
                    loop_telemetry
                        .total_latency_micros
                        .fetch_add(elapsed_micros, Ordering::Relaxed);
                    loop_telemetry.batches_total.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = &outcome.result {
                        loop_telemetry.batch_errors.fetch_add(1, Ordering::Relaxed);
                        if matches!(err, MergeDbError::ConcurrencyViolation { .. }) {
                            loop_telemetry
                                .conflict_rejections
                                .fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    loop_telemetry
                        .inflight_batches
                        .fetch_sub(1, Ordering::Relaxed);
                    let _ = outcome.result_tx.send(outcome.result);
                }
            }

            for req in pending {
                loop_telemetry
                    .inflight_batches
                    .fetch_sub(1, Ordering::Relaxed);
                loop_telemetry.batches_total.fetch_add(1, Ordering::Relaxed);
                loop_telemetry.batch_errors.fetch_add(1, Ordering::Relaxed);
                let _ = req.result_tx.send(Err(MergeDbError::Validation(
                    "merger apply queue closed".into(),
                )));
            }
        });
        background_tasks
            .lock()
            .expect("background task list poisoned")
            .push(apply_handle);

        Ok(Self {
            ingress_tx,
            config,
            state,
            storage,
            change_vector,
            telemetry,
            background_tasks,
        })
    }

    pub async fn enqueue(&self, batch: Batch) -> Result<BatchResult, MergeDbError> {
        match self.enqueue_work(MergedWork::Batch(batch)).await? {
            WorkOutcome::Batch(result) => Ok(result),
            WorkOutcome::Cluster(_) => Err(MergeDbError::Validation(
                "batch produced a cluster transaction result".into(),
            )),
        }
    }

    /// Applies a committed cluster transaction through the same apply loop as
    /// local batches. Re-applying an already applied entry writes nothing.
    pub async fn apply_cluster_transaction(
        &self,
        entry: CommittedClusterTransaction,
    ) -> Result<ClusterBatchResult, MergeDbError> {
        match self
            .enqueue_work(MergedWork::ClusterTransaction(entry))
            .await?
        {
            WorkOutcome::Cluster(result) => Ok(result),
            WorkOutcome::Batch(_) => Err(MergeDbError::Validation(
                "cluster transaction produced a batch result".into(),
            )),
        }
    }

    pub(crate) async fn enqueue_work(&self, work: MergedWork) -> Result<WorkOutcome, MergeDbError> {
        let capacity = self.config.merger_queue_capacity.max(1);
        let mut current = self.telemetry.inflight_batches.load(Ordering::Relaxed);
        loop {
            if current >= capacity {
                self.telemetry
                    .queue_full_rejections
                    .fetch_add(1, Ordering::Relaxed);
                return Err(MergeDbError::QueueFull);
            }
            match self.telemetry.inflight_batches.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        let timeout = Duration::from_millis(self.config.submit_timeout_ms);
        let (result_tx, result_rx) = oneshot::channel();
        let send_result = tokio::time::timeout(
            timeout,
            self.ingress_tx.send(WorkRequest {
                work,
                enqueue_micros: now_micros(),
                result_tx,
            }),
        )
        .await;
        match send_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.telemetry
                    .inflight_batches
                    .fetch_sub(1, Ordering::Relaxed);
                return Err(MergeDbError::Validation(format!("merger queue closed: {e}")));
            }
            Err(_) => {
                self.telemetry
                    .inflight_batches
                    .fetch_sub(1, Ordering::Relaxed);
                self.telemetry
                    .timeout_rejections
                    .fetch_add(1, Ordering::Relaxed);
                return Err(MergeDbError::Timeout);
            }
        }
        match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(MergeDbError::Validation(format!(
                "merger result channel closed: {e}"
            ))),
            Err(_) => {
                self.telemetry
                    .timeout_rejections
                    .fetch_add(1, Ordering::Relaxed);
                Err(MergeDbError::Timeout)
            }
        }
    }

    /// Starts appending every executed batch to a new file at `path`. Takes
    /// effect at the next epoch boundary.
    pub async fn start_recording(&self, path: &Path) -> Result<(), MergeDbError> {
        let mut s = self.state.lock().await;
        if s.recorder.is_some() {
            return Err(MergeDbError::RecordingAlreadyActive);
        }
        s.recorder = Some(TransactionRecorder::create(path)?);
        info!(path = %path.display(), "recording started");
        Ok(())
    }

    pub async fn stop_recording(&self) -> Result<RecordingSummary, MergeDbError> {
        let recorder = self
            .state
            .lock()
            .await
            .recorder
            .take()
            .ok_or(MergeDbError::RecordingNotActive)?;
        recorder.finish()
    }

    pub async fn is_recording(&self) -> bool {
        self.state.lock().await.recorder.is_some()
    }

    /// Re-enqueues a recording; see [`recording::replay`].
    pub fn replay(
        &self,
        path: &Path,
    ) -> impl Stream<Item = Result<ReplayProgress, MergeDbError>> + use<> {
        recording::replay(
            self.clone(),
            path.to_path_buf(),
            self.config.replay_progress_interval,
        )
    }

    /// Last published database change vector.
    pub fn database_change_vector(&self) -> ChangeVector {
        self.change_vector.current()
    }

    pub fn snapshot(&self) -> Keyspace {
        self.storage.snapshot()
    }

    pub fn config(&self) -> &MergeDbConfig {
        &self.config
    }

    pub fn metrics(&self) -> MergerMetrics {
        let batches_total = self.telemetry.batches_total.load(Ordering::Relaxed);
        let total_latency = self.telemetry.total_latency_micros.load(Ordering::Relaxed);
        let avg_batch_latency_micros = if batches_total == 0 {
            0
        } else {
            total_latency / batches_total
        };
        MergerMetrics {
            inflight_batches: self.telemetry.inflight_batches.load(Ordering::Relaxed),
            batches_total,
            batch_errors: self.telemetry.batch_errors.load(Ordering::Relaxed),
            commands_total: self.telemetry.commands_total.load(Ordering::Relaxed),
            transactions_total: self.telemetry.transactions_total.load(Ordering::Relaxed),
            fatal_aborts: self.telemetry.fatal_aborts.load(Ordering::Relaxed),
            identity_retries: self.telemetry.identity_retries.load(Ordering::Relaxed),
            conflict_rejections: self.telemetry.conflict_rejections.load(Ordering::Relaxed),
            queue_full_rejections: self.telemetry.queue_full_rejections.load(Ordering::Relaxed),
            timeout_rejections: self.telemetry.timeout_rejections.load(Ordering::Relaxed),
            avg_batch_latency_micros,
            epochs_total: self.telemetry.epochs_total.load(Ordering::Relaxed),
        }
    }
}

impl Drop for TransactionMerger {
    fn drop(&mut self) {
        if Arc::strong_count(&self.background_tasks) != 1 {
            return;
        }
        let mut handles = self
            .background_tasks
            .lock()
            .expect("background task list poisoned");
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}

mod internals;
use internals::*;
pub use internals::now_micros;

#[cfg(test)]
mod tests;
