use super::{MergedWork, TransactionMerger, WorkRequest, build_epoch_requests};
use crate::change_vector::ChangeVector;
use crate::commit::batch::Batch;
use crate::commit::command::{CommandReply, WriteCommand};
use crate::commit::patch::MergePatchEngine;
use crate::config::MergeDbConfig;
use crate::error::MergeDbError;
use crate::storage::keyspace::Keyspace;
use crate::storage::{CommitInfo, MemoryStorage, StorageEngine, WriteTransaction};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

fn user(name: &str) -> Value {
    json!({"name": name, "@metadata": {"@collection": "Users"}})
}

fn merger_with(config: MergeDbConfig, storage: Arc<dyn StorageEngine>) -> TransactionMerger {
    TransactionMerger::new(config, storage, Arc::new(MergePatchEngine)).expect("merger")
}

fn merger(config: MergeDbConfig) -> TransactionMerger {
    merger_with(config, Arc::new(MemoryStorage::new()))
}

/// Two batches per epoch, and the epoch stays open long enough for both.
fn paired_config() -> MergeDbConfig {
    MergeDbConfig {
        max_batches_per_transaction: 2,
        epoch_max_wait_us: 5_000_000,
        ..MergeDbConfig::default()
    }
}

#[derive(Default)]
struct FailingStorage {
    inner: MemoryStorage,
    fail_commits: AtomicBool,
}

impl StorageEngine for FailingStorage {
    fn begin_write(&self) -> Result<WriteTransaction, MergeDbError> {
        self.inner.begin_write()
    }

    fn commit(&self, txn: WriteTransaction) -> Result<CommitInfo, MergeDbError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(MergeDbError::StorageFatal("disk full".into()));
        }
        self.inner.commit(txn)
    }

    fn snapshot(&self) -> Keyspace {
        self.inner.snapshot()
    }

    fn committed_version(&self) -> u64 {
        self.inner.committed_version()
    }
}

fn request(commands: usize) -> WorkRequest {
    let (result_tx, _result_rx) = oneshot::channel();
    WorkRequest {
        work: MergedWork::Batch(Batch::new(
            (0..commands)
                .map(|i| WriteCommand::put(format!("users/{i}"), user("x")))
                .collect(),
        )),
        enqueue_micros: 0,
        result_tx,
    }
}

#[tokio::test]
async fn epoch_selection_respects_command_budget() {
    let (_tx, mut rx) = mpsc::channel::<WorkRequest>(4);
    let mut pending: VecDeque<_> = (0..3).map(|_| request(3)).collect();
    let selected =
        build_epoch_requests(&mut pending, 16, 7, Instant::now(), &mut rx, true).await;
    assert_eq!(selected.len(), 2);
    assert_eq!(pending.len(), 1);

    let mut pending: VecDeque<_> = vec![request(10), request(1)].into();
    let selected =
        build_epoch_requests(&mut pending, 16, 7, Instant::now(), &mut rx, true).await;
    assert_eq!(selected.len(), 1, "an oversized batch still runs, alone");

    let mut pending: VecDeque<_> = (0..3).map(|_| request(1)).collect();
    let selected = build_epoch_requests(&mut pending, 2, 100, Instant::now(), &mut rx, true).await;
    assert_eq!(selected.len(), 2);
}

#[tokio::test]
async fn epoch_waits_for_late_arrivals_until_deadline() {
    let (tx, mut rx) = mpsc::channel::<WorkRequest>(4);
    let mut pending: VecDeque<_> = vec![request(1)].into();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = tx.send(request(1)).await;
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    let selected = build_epoch_requests(&mut pending, 2, 100, deadline, &mut rx, false).await;
    assert_eq!(selected.len(), 2);
}

#[tokio::test]
async fn batches_in_one_epoch_share_a_physical_transaction() {
    let merger = merger(paired_config());
    let mut tasks = JoinSet::new();
    for i in 0..2 {
        let merger = merger.clone();
        tasks.spawn(async move {
            merger
                .enqueue(Batch::new(vec![
                    WriteCommand::put(format!("users/{i}"), user("a")),
                    WriteCommand::put(format!("users/{i}-b"), user("b")),
                ]))
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let result = joined.expect("join").expect("enqueue");
        assert_eq!(result.executed(), 2);
    }
    let metrics = merger.metrics();
    assert_eq!(metrics.transactions_total, 1);
    assert_eq!(metrics.batches_total, 2);
    assert_eq!(metrics.commands_total, 4);
    assert_eq!(merger.snapshot().document_count(), 4);
    let published = merger.database_change_vector();
    assert_eq!(published.counter_for("A", &merger.config().database_id), 4);
    assert_eq!(merger.snapshot().database_change_vector(), &published);
}

#[tokio::test]
async fn conflicting_batch_fails_alone() {
    let merger = merger(paired_config());
    let mut tasks = JoinSet::new();
    let stale = merger.clone();
    tasks.spawn(async move {
        stale
            .enqueue(Batch::new(vec![WriteCommand::put_expecting(
                "users/1",
                user("a"),
                ChangeVector::single("A", "AAAAAAAAAAAAAAAAAAAAAA", 7),
            )]))
            .await
    });
    let fresh = merger.clone();
    tasks.spawn(async move {
        fresh
            .enqueue(Batch::new(vec![WriteCommand::put("users/2", user("b"))]))
            .await
    });
    let mut ok = 0;
    let mut conflicts = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.expect("join") {
            Ok(_) => ok += 1,
            Err(MergeDbError::ConcurrencyViolation { id, .. }) => {
                assert_eq!(id, "users/1");
                conflicts += 1;
            }
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!((ok, conflicts), (1, 1));
    let snapshot = merger.snapshot();
    assert!(snapshot.document("users/1").is_none());
    assert!(snapshot.document("users/2").is_some());
    let metrics = merger.metrics();
    assert_eq!(metrics.conflict_rejections, 1);
    assert_eq!(metrics.transactions_total, 1);
}

#[tokio::test]
async fn storage_fatal_fails_every_batch_of_the_transaction() {
    let storage = Arc::new(FailingStorage::default());
    storage.fail_commits.store(true, Ordering::SeqCst);
    let merger = merger_with(paired_config(), storage.clone());
    let mut tasks = JoinSet::new();
    for i in 0..2 {
        let merger = merger.clone();
        tasks.spawn(async move {
            merger
                .enqueue(Batch::new(vec![WriteCommand::put(format!("users/{i}"), user("a"))]))
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let err = joined.expect("join").expect_err("fatal");
        assert!(matches!(err, MergeDbError::StorageFatal(_)), "{err}");
    }
    assert_eq!(merger.snapshot().document_count(), 0);
    assert!(merger.database_change_vector().is_empty());
    let metrics = merger.metrics();
    assert_eq!(metrics.fatal_aborts, 1);
    assert_eq!(metrics.transactions_total, 0);

    storage.fail_commits.store(false, Ordering::SeqCst);
    merger
        .enqueue(Batch::new(vec![WriteCommand::put("users/9", user("a"))]))
        .await
        .expect("storage recovered");
}

#[tokio::test]
async fn identity_collision_regenerates_and_retries() {
    let merger = merger(MergeDbConfig::default());
    merger
        .enqueue(Batch::new(vec![WriteCommand::put(
            "users/0000000000000000002-A",
            user("taken"),
        )]))
        .await
        .expect("seed");
    let mut batch = Batch::new(vec![WriteCommand::put("users/", user("new"))]);
    batch
        .put_attachment("users/", "photo.png", "image/png", &b"png"[..])
        .expect("attach");
    let result = merger.enqueue(batch).await.expect("retried");
    let CommandReply::Put(put) = &result.replies[0] else {
        panic!("expected put reply");
    };
    assert_ne!(put.id, "users/0000000000000000002-A");
    assert!(put.id.starts_with("users/") && put.id.ends_with("-A"));
    assert_eq!(result.replies[1].id(), put.id);
    assert_eq!(merger.metrics().identity_retries, 1);
    let snapshot = merger.snapshot();
    assert_eq!(snapshot.document_count(), 2);
    assert!(snapshot.attachment(&put.id, "photo.png").is_some());
}

#[tokio::test]
async fn exhausted_identity_retries_surface_the_collision() {
    let merger = merger(MergeDbConfig {
        max_identity_retries: 0,
        ..MergeDbConfig::default()
    });
    merger
        .enqueue(Batch::new(vec![WriteCommand::put(
            "users/0000000000000000002-A",
            user("taken"),
        )]))
        .await
        .expect("seed");
    let err = merger
        .enqueue(Batch::new(vec![WriteCommand::put("users/", user("new"))]))
        .await
        .expect_err("collision");
    assert!(matches!(
        err,
        MergeDbError::IdentityCollision { command_index: 0, .. }
    ));
}

#[tokio::test]
async fn full_queue_rejects_new_work() {
    let merger = merger(MergeDbConfig {
        merger_queue_capacity: 1,
        ..MergeDbConfig::default()
    });
    let guard = merger.state.lock().await;
    let first = {
        let merger = merger.clone();
        tokio::spawn(async move {
            merger
                .enqueue(Batch::new(vec![WriteCommand::put("users/1", user("a"))]))
                .await
        })
    };
    while merger.metrics().inflight_batches == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let err = merger
        .enqueue(Batch::new(vec![WriteCommand::put("users/2", user("b"))]))
        .await
        .expect_err("queue full");
    assert!(matches!(err, MergeDbError::QueueFull));
    drop(guard);
    first.await.expect("join").expect("first batch");
    assert_eq!(merger.metrics().queue_full_rejections, 1);
}

#[tokio::test]
async fn only_one_recording_at_a_time() {
    let dir = tempdir().expect("tempdir");
    let merger = merger(MergeDbConfig::default());
    assert!(matches!(
        merger.stop_recording().await,
        Err(MergeDbError::RecordingNotActive)
    ));
    merger
        .start_recording(&dir.path().join("a.rec"))
        .await
        .expect("start");
    assert!(matches!(
        merger.start_recording(&dir.path().join("b.rec")).await,
        Err(MergeDbError::RecordingAlreadyActive)
    ));
    assert!(merger.is_recording().await);
    merger
        .enqueue(Batch::new(vec![WriteCommand::put("users/1", user("a"))]))
        .await
        .expect("enqueue");
    let summary = merger.stop_recording().await.expect("stop");
    assert_eq!((summary.entries, summary.commands), (1, 1));
    assert!(!merger.is_recording().await);
}
