use super::*;
use crate::cluster::apply::apply_committed;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

pub(super) struct EpochOutcome {
    pub(super) enqueue_micros: u64,
    pub(super) result_tx: oneshot::Sender<Result<WorkOutcome, MergeDbError>>,
    pub(super) result: Result<WorkOutcome, MergeDbError>,
}

#[derive(Default)]
pub(super) struct EpochProcessResult {
    pub(super) outcomes: Vec<EpochOutcome>,
    pub(super) identity_retries: u64,
    pub(super) committed: bool,
    pub(super) fatal: bool,
}

enum EpochAttempt {
    Done {
        results: Vec<Result<WorkOutcome, MergeDbError>>,
        committed: bool,
    },
    RetryIdentity,
    Fatal(String),
}

/// Takes pending requests in arrival order until the epoch is full. With an
/// empty queue it keeps listening until `deadline` so close arrivals share
/// the physical transaction.
pub(super) async fn build_epoch_requests(
    pending: &mut VecDeque<WorkRequest>,
    max_batches: usize,
    max_commands: usize,
    deadline: Instant,
    rx: &mut tokio_mpsc::Receiver<WorkRequest>,
    ingress_closed: bool,
) -> Vec<WorkRequest> {
    let mut selected = Vec::new();
    let mut commands = 0usize;

    while selected.len() < max_batches {
        if pending.is_empty() {
            if ingress_closed {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match tokio::time::timeout(deadline - now, rx.recv()).await {
                Ok(Some(req)) => pending.push_back(req),
                _ => break,
            }
            while let Ok(req) = rx.try_recv() {
                pending.push_back(req);
            }
            continue;
        }

        let next_commands = pending
            .front()
            .map(|req| req.work.command_count())
            .unwrap_or(0);
        if !selected.is_empty() && commands + next_commands > max_commands {
            break;
        }
        let Some(req) = pending.pop_front() else {
            break;
        };
        commands += next_commands;
        selected.push(req);
    }
    selected
}

/// Runs one epoch to completion. Identity collisions rewrite the colliding
/// batch and re-run the whole physical transaction from scratch.
pub(super) fn process_merged_epoch(
    state: &mut MergerState,
    mut requests: Vec<WorkRequest>,
) -> EpochProcessResult {
    let mut identity_retries = 0u64;
    let mut attempt = 0usize;
    let (results, committed, fatal) = loop {
        match run_merged_transaction(state, &mut requests, attempt) {
            EpochAttempt::RetryIdentity => {
                attempt += 1;
                identity_retries += 1;
            }
            EpochAttempt::Done { results, committed } => break (results, committed, false),
            EpochAttempt::Fatal(message) => {
                let results = requests
                    .iter()
                    .map(|_| Err(MergeDbError::StorageFatal(message.clone())))
                    .collect();
                break (results, false, true);
            }
        }
    };
    let outcomes = requests
        .into_iter()
        .zip(results)
        .map(|(request, result)| EpochOutcome {
            enqueue_micros: request.enqueue_micros,
            result_tx: request.result_tx,
            result,
        })
        .collect();
    EpochProcessResult {
        outcomes,
        identity_retries,
        committed,
        fatal,
    }
}

fn run_merged_transaction(
    state: &mut MergerState,
    requests: &mut [WorkRequest],
    attempt: usize,
) -> EpochAttempt {
    let published = state.change_vector.load();
    let mut txn = match state.storage.begin_write() {
        Ok(txn) => txn,
        Err(err) => {
            error!(error = %err, "failed to open merged write transaction");
            return EpochAttempt::Fatal(err.to_string());
        }
    };
    let mut running = published.vector.merge(txn.database_change_vector());
    let config = Arc::clone(&state.config);
    let scripts = Arc::clone(&state.scripts);
    let ctx = ExecutionContext {
        config: &config,
        scripts: scripts.as_ref(),
        now_micros: now_micros(),
    };
    let recording = state.recorder.is_some();
    let mut results = Vec::with_capacity(requests.len());
    let mut recorded = Vec::new();
    let mut applied = 0usize;

    for request in requests.iter_mut() {
        let mut trial = txn.clone();
        let executed = match &request.work {
            MergedWork::Batch(batch) => execute_batch(&mut trial, &ctx, batch, running.clone())
                .map(|executed| (WorkOutcome::Batch(executed.result), executed.database_vector)),
            MergedWork::ClusterTransaction(entry) => {
                apply_committed(&mut trial, &config, entry, running.clone())
                    .map(|(result, vector)| (WorkOutcome::Cluster(result), vector))
            }
        };
        match executed {
            Ok((outcome, vector)) => {
                if recording {
                    match recorded_entry(&request.work, &outcome, config.identity_parts_separator)
                    {
                        Ok(entry) => recorded.push(entry),
                        Err(err) => {
                            results.push(Err(err));
                            continue;
                        }
                    }
                }
                txn = trial;
                running = vector;
                applied += 1;
                results.push(Ok(outcome));
            }
            Err(MergeDbError::IdentityCollision { id, command_index })
                if attempt < config.max_identity_retries =>
            {
                if let MergedWork::Batch(batch) = &mut request.work {
                    let rewritten = batch.regenerate_identities(
                        command_index,
                        config.identity_parts_separator,
                        &config.node_tag,
                    );
                    warn!(
                        id = %id,
                        command_index,
                        rewritten,
                        attempt = attempt + 1,
                        "generated identity collided, retrying merged transaction"
                    );
                }
                state.storage.abort(txn);
                return EpochAttempt::RetryIdentity;
            }
            Err(err) => results.push(Err(err)),
        }
    }

    if applied == 0 {
        state.storage.abort(txn);
        return EpochAttempt::Done {
            results,
            committed: false,
        };
    }
    txn.set_database_change_vector(running.clone());

    if let Some(recorder) = state.recorder.as_mut() {
        let appended = recorded
            .iter()
            .try_for_each(|entry| recorder.append(entry))
            .and_then(|()| recorder.flush());
        if let Err(err) = appended {
            error!(
                path = %recorder.path().display(),
                error = %err,
                "recording write failed, aborting merged transaction"
            );
            // a partially written entry leaves the file unusable
            state.recorder = None;
            state.storage.abort(txn);
            return EpochAttempt::Fatal(format!("recording write failed: {err}"));
        }
    }

    if let Err(err) = state.storage.commit(txn) {
        error!(error = %err, batches = applied, "merged transaction commit failed");
        return EpochAttempt::Fatal(err.to_string());
    }
    state.change_vector.merge_in(&running);
    EpochAttempt::Done {
        results,
        committed: true,
    }
}

fn recorded_entry(
    work: &MergedWork,
    outcome: &WorkOutcome,
    separator: char,
) -> Result<RecordedEntry, MergeDbError> {
    match (work, outcome) {
        (MergedWork::Batch(batch), WorkOutcome::Batch(result)) => {
            RecordedEntry::from_executed_batch(batch, result, separator)
        }
        (MergedWork::ClusterTransaction(entry), _) => {
            Ok(RecordedEntry::ClusterTransaction(entry.clone()))
        }
        (MergedWork::Batch(_), WorkOutcome::Cluster(_)) => Err(MergeDbError::Validation(
            "batch produced a cluster transaction result".into(),
        )),
    }
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
