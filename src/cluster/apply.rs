use crate::change_vector::{ChangeVector, RAFT_TAG, TRXN_TAG};
use crate::cluster::ClusterBatchResult;
use crate::cluster::proposal::{ClusterCommand, CommittedClusterTransaction};
use crate::commit::apply::sync_metadata;
use crate::commit::command::{CommandReply, DeleteReply, PutReply};
use crate::config::MergeDbConfig;
use crate::error::MergeDbError;
use crate::storage::WriteTransaction;
use crate::storage::documents::{
    Document, DocumentFlags, EMPTY_COLLECTION, Tombstone, collection_of,
};
use serde_json::Value;

/// Applies a committed cluster transaction. Commands whose raft count is not
/// above the database's `RAFT` counter were applied before; their replies are
/// rebuilt from stored state without writing.
pub(crate) fn apply_committed(
    txn: &mut WriteTransaction,
    config: &MergeDbConfig,
    entry: &CommittedClusterTransaction,
    database_vector: ChangeVector,
) -> Result<(ClusterBatchResult, ChangeVector), MergeDbError> {
    let applied_count = database_vector.counter_for(RAFT_TAG, &config.database_group_id);
    let mut highest = applied_count;
    let mut replies = Vec::with_capacity(entry.proposal.commands.len());
    let mut position = 0u64;
    for command in &entry.proposal.commands {
        let (id, body) = match command {
            ClusterCommand::Put { id, body, .. } => (id, Some(body)),
            ClusterCommand::Delete { id, .. } => (id, None),
            ClusterCommand::CompareExchangePut { .. }
            | ClusterCommand::CompareExchangeDelete { .. } => continue,
        };
        position += 1;
        let count = entry.previous_count + position;
        let change_vector = cluster_change_vector(config, entry, count);
        let reply = match body {
            Some(body) if count > applied_count => {
                put_document(txn, entry, id, body.clone(), change_vector)?
            }
            Some(body) => synthesize_put(txn, entry, id, body, change_vector),
            None if count > applied_count => delete_document(txn, entry, id, change_vector),
            None => CommandReply::Delete(DeleteReply {
                id: id.clone(),
                deleted: true,
                change_vector: Some(change_vector),
            }),
        };
        highest = highest.max(count);
        replies.push(reply);
    }
    let database_vector = if highest > applied_count {
        database_vector.with_bumped(RAFT_TAG, &config.database_group_id, highest)
    } else {
        database_vector
    };
    Ok((
        ClusterBatchResult {
            replies,
            commit_index: entry.commit_index,
        },
        database_vector,
    ))
}

fn cluster_change_vector(
    config: &MergeDbConfig,
    entry: &CommittedClusterTransaction,
    count: u64,
) -> ChangeVector {
    let vector = ChangeVector::single(RAFT_TAG, &config.database_group_id, count);
    if entry.proposal.options.disable_atomic_document_writes {
        vector
    } else {
        vector.with_bumped(TRXN_TAG, &config.cluster_transaction_id, entry.commit_index)
    }
}

fn put_document(
    txn: &mut WriteTransaction,
    entry: &CommittedClusterTransaction,
    id: &str,
    mut body: Value,
    change_vector: ChangeVector,
) -> Result<CommandReply, MergeDbError> {
    if !body.is_object() {
        return Err(MergeDbError::Validation(format!(
            "document '{id}' body must be a JSON object"
        )));
    }
    let mut flags = DocumentFlags::FROM_CLUSTER_TRANSACTION;
    if let Some(existing) = txn.document(id) {
        flags = flags.with(existing.flags.intersection(DocumentFlags::HAS_REVISIONS));
    }
    let flags = sync_metadata(txn, id, &mut body, flags);
    let etag = txn.next_etag();
    let document = Document {
        id: id.to_string(),
        etag,
        change_vector,
        collection: collection_of(&body),
        body,
        flags,
        last_modified_micros: entry.proposal.creation_micros,
    };
    let reply = put_reply(&document);
    txn.put_document(document);
    Ok(reply)
}

fn synthesize_put(
    txn: &WriteTransaction,
    entry: &CommittedClusterTransaction,
    id: &str,
    body: &Value,
    change_vector: ChangeVector,
) -> CommandReply {
    if let Some(document) = txn.document(id)
        && document.change_vector == change_vector
    {
        return put_reply(document);
    }
    // overwritten or deleted since; a revision of the write keeps its flags
    match txn
        .revisions_of(id)
        .into_iter()
        .find(|revision| revision.change_vector == change_vector)
    {
        Some(revision) => CommandReply::Put(PutReply {
            id: id.to_string(),
            collection: collection_of(&revision.body),
            change_vector,
            last_modified_micros: revision.last_modified_micros,
            flags: revision.flags.without(DocumentFlags::REVISION),
        }),
        None => CommandReply::Put(PutReply {
            id: id.to_string(),
            collection: collection_of(body),
            change_vector,
            last_modified_micros: entry.proposal.creation_micros,
            flags: DocumentFlags::FROM_CLUSTER_TRANSACTION,
        }),
    }
}

fn delete_document(
    txn: &mut WriteTransaction,
    entry: &CommittedClusterTransaction,
    id: &str,
    change_vector: ChangeVector,
) -> CommandReply {
    let collection = txn
        .document(id)
        .map(|doc| doc.collection.clone())
        .or_else(|| txn.tombstone(id).map(|t| t.collection.clone()))
        .unwrap_or_else(|| EMPTY_COLLECTION.to_string());
    let etag = txn.next_etag();
    txn.delete_document(Tombstone {
        id: id.to_string(),
        etag,
        change_vector: change_vector.clone(),
        collection,
        flags: DocumentFlags::FROM_CLUSTER_TRANSACTION,
        last_modified_micros: entry.proposal.creation_micros,
    });
    CommandReply::Delete(DeleteReply {
        id: id.to_string(),
        deleted: true,
        change_vector: Some(change_vector),
    })
}

fn put_reply(document: &Document) -> CommandReply {
    CommandReply::Put(PutReply {
        id: document.id.clone(),
        collection: document.collection.clone(),
        change_vector: document.change_vector.clone(),
        last_modified_micros: document.last_modified_micros,
        flags: document.flags,
    })
}
