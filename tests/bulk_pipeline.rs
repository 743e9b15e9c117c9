use mergedb::commit::command::WriteCommand;
use mergedb::{AccumulatorState, MergeDbConfig, MergeDbInstance};
use serde_json::json;

fn kilobyte_doc(i: usize) -> WriteCommand {
    WriteCommand::put(
        format!("blobs/{i}"),
        json!({"payload": "x".repeat(1000), "@metadata": {"@collection": "Blobs"}}),
    )
}

#[tokio::test]
async fn bulk_insert_overlaps_commits_with_filling() {
    let db = MergeDbInstance::open(MergeDbConfig {
        bulk_insert_threshold_bytes: 1024 * 1024,
        bulk_min_flush_bytes: 64 * 1024,
        ..MergeDbConfig::default()
    })
    .expect("open");

    let mut accumulator = db.bulk_accumulator();
    assert_eq!(accumulator.state(), AccumulatorState::Idle);
    for i in 0..2000 {
        accumulator.add(kilobyte_doc(i)).await.expect("add");
        accumulator.maybe_flush().expect("maybe flush");
        assert!(accumulator.max_in_flight() <= 2);
    }
    assert!(accumulator.flushes() >= 2);
    let summary = accumulator.finish().await.expect("finish");
    assert_eq!(summary.items, 2000);
    assert!(summary.bytes >= 2000 * 1000);

    let snapshot = db.snapshot();
    assert_eq!(snapshot.document_count(), 2000);
    assert_eq!(snapshot.last_etag(), 2000);
    assert_eq!(db.metrics().batches_total, summary.flushes);
}

#[tokio::test]
async fn failed_bulk_batch_stops_the_pipeline() {
    let db = MergeDbInstance::open(MergeDbConfig {
        bulk_insert_threshold_bytes: 4 * 1024,
        bulk_min_flush_bytes: 1024,
        ..MergeDbConfig::default()
    })
    .expect("open");
    db.submit_batch(vec![kilobyte_doc(3)]).await.expect("seed");

    let commands = (0..50).map(|i| {
        if i == 3 {
            WriteCommand::put_expecting(
                "blobs/3",
                json!({"payload": "stale"}),
                mergedb::ChangeVector::new(),
            )
        } else {
            kilobyte_doc(i)
        }
    });
    let err = db.bulk_insert(commands).await.expect_err("conflicting batch");
    assert!(matches!(
        err,
        mergedb::MergeDbError::ConcurrencyViolation { .. }
    ));
}

#[tokio::test]
async fn finish_still_fails_after_the_failure_was_reported() {
    let db = MergeDbInstance::open(MergeDbConfig::default()).expect("open");
    db.submit_batch(vec![kilobyte_doc(1)]).await.expect("seed");

    let mut accumulator = mergedb::PipelinedBatchAccumulator::new(db.merger().clone(), 1, 1);
    accumulator
        .add(WriteCommand::put_expecting(
            "blobs/1",
            json!({}),
            mergedb::ChangeVector::new(),
        ))
        .await
        .expect("handed to the committer");
    while !accumulator.previous_batch_completed() {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    let reported = accumulator.maybe_flush().expect_err("failure reported");
    assert!(matches!(
        reported,
        mergedb::MergeDbError::ConcurrencyViolation { .. }
    ));
    assert!(accumulator.maybe_flush().is_err());
    assert!(accumulator.add(kilobyte_doc(2)).await.is_err());
    accumulator
        .finish()
        .await
        .expect_err("finish reports the earlier failure");
    assert!(db.get_document("blobs/2").is_none());
}
