use mergedb::commit::command::WriteCommand;
use mergedb::{ChangeVector, MergeDbConfig, MergeDbError, MergeDbInstance};
use serde_json::{Value, json};
use tokio::task::JoinSet;

fn order(total: u64) -> Value {
    json!({"total": total, "@metadata": {"@collection": "Orders"}})
}

#[tokio::test]
async fn stale_change_vector_is_rejected_and_fresh_one_accepted() {
    let db = MergeDbInstance::open(MergeDbConfig::default()).expect("open");
    db.submit_batch(vec![WriteCommand::put("orders/1", order(10))])
        .await
        .expect("seed");
    let first_read = db.get_document("orders/1").expect("seeded");

    db.submit_batch(vec![WriteCommand::put_expecting(
        "orders/1",
        order(20),
        first_read.change_vector.clone(),
    )])
    .await
    .expect("fresh write");

    let err = db
        .submit_batch(vec![WriteCommand::put_expecting(
            "orders/1",
            order(30),
            first_read.change_vector.clone(),
        )])
        .await
        .expect_err("stale write");
    match err {
        MergeDbError::ConcurrencyViolation {
            id,
            expected,
            actual,
        } => {
            assert_eq!(id, "orders/1");
            assert_eq!(expected, Some(first_read.change_vector));
            assert!(actual.is_some());
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(db.get_document("orders/1").expect("stored").body["total"], 20);
}

#[tokio::test]
async fn expecting_a_missing_document_to_be_absent() {
    let db = MergeDbInstance::open(MergeDbConfig::default()).expect("open");
    db.submit_batch(vec![WriteCommand::put_expecting(
        "orders/new",
        order(1),
        ChangeVector::new(),
    )])
    .await
    .expect("empty vector means must not exist");

    let err = db
        .submit_batch(vec![WriteCommand::put_expecting(
            "orders/new",
            order(2),
            ChangeVector::new(),
        )])
        .await
        .expect_err("now it exists");
    assert!(matches!(err, MergeDbError::ConcurrencyViolation { .. }));
}

#[tokio::test]
async fn a_rejected_batch_leaves_none_of_its_writes() {
    let db = MergeDbInstance::open(MergeDbConfig::default()).expect("open");
    let stale = ChangeVector::single("A", &db.config().database_id, 99);
    let err = db
        .submit_batch(vec![
            WriteCommand::put("orders/a", order(1)),
            WriteCommand::put_expecting("orders/b", order(2), stale),
        ])
        .await
        .expect_err("second command conflicts");
    assert!(matches!(err, MergeDbError::ConcurrencyViolation { .. }));
    assert!(db.get_document("orders/a").is_none());
    assert!(db.database_change_vector().is_empty());
}

#[tokio::test]
async fn concurrent_writers_each_see_a_growing_database_vector() {
    let db = std::sync::Arc::new(
        MergeDbInstance::open(MergeDbConfig {
            max_batches_per_transaction: 8,
            ..MergeDbConfig::default()
        })
        .expect("open"),
    );
    let mut tasks = JoinSet::new();
    for i in 0..32u64 {
        let db = std::sync::Arc::clone(&db);
        tasks.spawn(async move {
            db.submit_batch(vec![WriteCommand::put(format!("orders/{i}"), order(i))])
                .await
        });
    }
    let mut vectors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let result = joined.expect("join").expect("submit");
        vectors.push(result.last_change_vector.expect("put stamps a vector"));
    }
    let published = db.database_change_vector();
    for vector in &vectors {
        assert!(published.dominates(vector), "{published} vs {vector}");
    }
    assert_eq!(
        published.counter_for("A", &db.config().database_id),
        32,
        "every put takes one etag"
    );
    let metrics = db.metrics();
    assert_eq!(metrics.batches_total, 32);
    assert!(metrics.transactions_total <= 32);
}
