use crate::commit::batch::Batch;
use crate::commit::command::WriteCommand;
use crate::commit::executor::TransactionMerger;
use crate::error::MergeDbError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Items the accumulator can size without serializing them.
pub trait SizedItem {
    fn approximate_size(&self) -> usize;
}

impl SizedItem for WriteCommand {
    fn approximate_size(&self) -> usize {
        WriteCommand::approximate_size(self)
    }
}

/// Destination of full batches; commits one batch and reports how many items
/// it executed.
#[async_trait]
pub trait BatchSink<T>: Send + Sync + 'static {
    async fn commit(&self, items: Vec<T>) -> Result<usize, MergeDbError>;
}

#[async_trait]
impl BatchSink<WriteCommand> for TransactionMerger {
    async fn commit(&self, items: Vec<WriteCommand>) -> Result<usize, MergeDbError> {
        Ok(self.enqueue(Batch::new(items)).await?.executed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    /// Nothing buffered and nothing committing.
    Idle,
    /// Items are buffered for the next batch.
    Filling,
    /// The buffer is empty while a previous batch commits.
    Flushing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub flushes: u64,
    pub items: u64,
    pub bytes: u64,
}

/// Double-buffered batch builder. A full batch is handed to a committer task
/// over a channel of depth one, so the producer keeps filling the next batch
/// while the previous one commits and only waits once two batches are
/// outstanding.
pub struct PipelinedBatchAccumulator<T: Send + 'static> {
    threshold_bytes: usize,
    min_flush_bytes: usize,
    buffer: Vec<T>,
    buffered_bytes: usize,
    flush_tx: Option<mpsc::Sender<Vec<T>>>,
    committer: Option<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    committed_items: Arc<AtomicU64>,
    failure: Arc<Mutex<Option<MergeDbError>>>,
    /// Set once a committer failure has been reported; every later call fails.
    failed: Option<String>,
    flushes: u64,
    bytes: u64,
}

impl<T: SizedItem + Send + 'static> PipelinedBatchAccumulator<T> {
    /// Spawns the committer; must be called inside a tokio runtime.
    pub fn new<S: BatchSink<T>>(sink: S, threshold_bytes: usize, min_flush_bytes: usize) -> Self {
        let (flush_tx, mut flush_rx) = mpsc::channel::<Vec<T>>(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let committed_items = Arc::new(AtomicU64::new(0));
        let failure: Arc<Mutex<Option<MergeDbError>>> = Arc::new(Mutex::new(None));

        let task_in_flight = Arc::clone(&in_flight);
        let task_committed = Arc::clone(&committed_items);
        let task_failure = Arc::clone(&failure);
        let committer = tokio::spawn(async move {
            while let Some(items) = flush_rx.recv().await {
                let count = items.len() as u64;
                let failed = match sink.commit(items).await {
                    Ok(_) => {
                        task_committed.fetch_add(count, Ordering::Relaxed);
                        false
                    }
                    Err(err) => {
                        warn!(error = %err, items = count, "bulk batch failed");
                        *task_failure.lock() = Some(err);
                        true
                    }
                };
                // the failure is visible before the batch stops counting as in flight
                task_in_flight.fetch_sub(1, Ordering::AcqRel);
                if failed {
                    // batches still queued are dropped with the receiver
                    break;
                }
            }
        });

        Self {
            threshold_bytes: threshold_bytes.max(1),
            min_flush_bytes,
            buffer: Vec::new(),
            buffered_bytes: 0,
            flush_tx: Some(flush_tx),
            committer: Some(committer),
            in_flight,
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            committed_items,
            failure,
            failed: None,
            flushes: 0,
            bytes: 0,
        }
    }

    /// Buffers `item`, handing the batch off once it reaches the threshold.
    pub async fn add(&mut self, item: T) -> Result<(), MergeDbError> {
        self.check_failure()?;
        self.buffered_bytes += item.approximate_size();
        self.buffer.push(item);
        if self.buffered_bytes >= self.threshold_bytes {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flushes early when the previous batch already committed and enough
    /// is buffered, so the committer never sits idle. Never waits.
    pub fn maybe_flush(&mut self) -> Result<bool, MergeDbError> {
        self.check_failure()?;
        if self.buffer.is_empty()
            || self.buffered_bytes < self.min_flush_bytes
            || !self.previous_batch_completed()
        {
            return Ok(false);
        }
        let Some(flush_tx) = self.flush_tx.clone() else {
            return Ok(false);
        };
        let permit = match flush_tx.try_reserve() {
            Ok(permit) => permit,
            Err(_) => return Ok(false),
        };
        let items = self.take_buffer();
        permit.send(items);
        Ok(true)
    }

    /// Flushes the remainder and waits for every batch to commit.
    pub async fn finish(mut self) -> Result<PipelineSummary, MergeDbError> {
        if !self.buffer.is_empty() {
            self.flush().await?;
        }
        self.flush_tx = None;
        if let Some(committer) = self.committer.take() {
            committer
                .await
                .map_err(|e| MergeDbError::Validation(format!("bulk committer failed: {e}")))?;
        }
        self.check_failure()?;
        let summary = PipelineSummary {
            flushes: self.flushes,
            items: self.committed_items.load(Ordering::Relaxed),
            bytes: self.bytes,
        };
        debug!(
            flushes = summary.flushes,
            items = summary.items,
            bytes = summary.bytes,
            "bulk pipeline finished"
        );
        Ok(summary)
    }

    pub fn state(&self) -> AccumulatorState {
        if !self.buffer.is_empty() {
            AccumulatorState::Filling
        } else if self.in_flight.load(Ordering::Acquire) > 0 {
            AccumulatorState::Flushing
        } else {
            AccumulatorState::Idle
        }
    }

    pub fn previous_batch_completed(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn buffered_items(&self) -> usize {
        self.buffer.len()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Most batches ever handed off and not yet committed at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Relaxed)
    }

    async fn flush(&mut self) -> Result<(), MergeDbError> {
        let Some(flush_tx) = self.flush_tx.clone() else {
            return Err(MergeDbError::Validation("bulk pipeline already finished".into()));
        };
        // count the batch only once the channel has room for it
        let permit = match flush_tx.reserve().await {
            Ok(permit) => permit,
            Err(_) => return Err(self.committer_stopped()),
        };
        let items = self.take_buffer();
        permit.send(items);
        Ok(())
    }

    fn committer_stopped(&mut self) -> MergeDbError {
        match self.check_failure() {
            Err(err) => err,
            Ok(()) => MergeDbError::Validation("bulk committer stopped".into()),
        }
    }

    fn take_buffer(&mut self) -> Vec<T> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::Relaxed);
        self.flushes += 1;
        self.bytes += self.buffered_bytes as u64;
        self.buffered_bytes = 0;
        std::mem::take(&mut self.buffer)
    }

    fn check_failure(&mut self) -> Result<(), MergeDbError> {
        if let Some(err) = self.failure.lock().take() {
            self.failed = Some(err.to_string());
            return Err(err);
        }
        match &self.failed {
            Some(message) => Err(MergeDbError::Unavailable {
                message: format!("bulk pipeline stopped after a failed batch: {message}"),
            }),
            None => Ok(()),
        }
    }
}

impl<T: Send + 'static> Drop for PipelinedBatchAccumulator<T> {
    fn drop(&mut self) {
        let Some(committer) = self.committer.take() else {
            return;
        };
        let in_flight = self.in_flight.load(Ordering::Acquire);
        if !self.buffer.is_empty() || in_flight > 0 {
            warn!(
                buffered_items = self.buffer.len(),
                in_flight, "bulk accumulator dropped before finish, discarding pending batches"
            );
        }
        committer.abort();
    }
}
