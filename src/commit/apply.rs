use crate::change_vector::{ChangeVector, TRXN_TAG};
use crate::commit::batch::{Batch, BatchResult, non_conflicting_id};
use crate::commit::command::{
    AttachmentDeleteCommand, AttachmentDeleteReply, AttachmentMoveReply, AttachmentPutCommand,
    AttachmentReply, AttachmentTransferCommand, CommandReply, CounterCommand, CounterDetail,
    CounterOperationKind, CountersReply, DeleteCommand, DeleteReply, ForceRevisionReply,
    ForceRevisionStrategy, PatchCommand, PatchReply, PatchStatus, PutCommand, PutReply,
    TimeSeriesCommand, TimeSeriesCopyCommand, TimeSeriesReply, WriteCommand,
};
use crate::commit::patch::{PatchOutcome, ScriptEngine};
use crate::config::MergeDbConfig;
use crate::error::{MergeDbError, ResourceType};
use crate::storage::WriteTransaction;
use crate::storage::documents::{
    ATTACHMENTS_KEY, AttachmentEntry, COUNTERS_KEY, CounterEntry, Document, DocumentFlags,
    METADATA_KEY, Revision, TIME_SERIES_KEY, TimeSeriesPoint, TimeSeriesSegment, Tombstone,
    collection_of, content_hash, lower_id,
};
use crate::storage::keyspace::Keyspace;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub(crate) struct ExecutionContext<'a> {
    pub config: &'a MergeDbConfig,
    pub scripts: &'a dyn ScriptEngine,
    pub now_micros: u64,
}

#[derive(Debug, Clone, Copy)]
enum FixupTarget {
    Reply(usize),
    MoveDestination(usize),
}

pub(crate) struct ExecutedBatch {
    pub result: BatchResult,
    pub database_vector: ChangeVector,
}

/// Runs every command of `batch` in order against `txn`, then rewrites the
/// metadata of documents whose attachments, counters or time series changed.
pub(crate) fn execute_batch(
    txn: &mut WriteTransaction,
    ctx: &ExecutionContext<'_>,
    batch: &Batch,
    database_vector: ChangeVector,
) -> Result<ExecutedBatch, MergeDbError> {
    let mut exec = BatchExecution::new(database_vector);
    for (idx, command) in batch.commands().iter().enumerate() {
        let reply = exec.execute(txn, ctx, batch, idx, command)?;
        exec.replies.push(reply);
    }
    exec.fix_up_documents(txn, ctx);
    Ok(exec.finish(txn))
}

struct BatchExecution {
    replies: Vec<CommandReply>,
    database_vector: ChangeVector,
    last_change_vector: Option<ChangeVector>,
    modified_collections: BTreeSet<String>,
    documents_to_fix: BTreeMap<String, (String, Vec<FixupTarget>)>,
    last_put_id: Option<String>,
}

impl BatchExecution {
    fn new(database_vector: ChangeVector) -> Self {
        Self {
            replies: Vec::new(),
            database_vector,
            last_change_vector: None,
            modified_collections: BTreeSet::new(),
            documents_to_fix: BTreeMap::new(),
            last_put_id: None,
        }
    }

    fn execute(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        batch: &Batch,
        idx: usize,
        command: &WriteCommand,
    ) -> Result<CommandReply, MergeDbError> {
        match command {
            WriteCommand::Put(cmd) => self.put(txn, ctx, idx, cmd),
            WriteCommand::Delete(cmd) => self.delete(txn, ctx, cmd),
            WriteCommand::DeleteByPrefix { id_prefix } => {
                self.delete_by_prefix(txn, ctx, id_prefix)
            }
            WriteCommand::Patch(cmd) => self.patch(txn, ctx, cmd),
            WriteCommand::ForceRevision { id } => self.force_revision(txn, ctx, id),
            WriteCommand::AttachmentPut(cmd) => self.attachment_put(txn, ctx, batch, idx, cmd),
            WriteCommand::AttachmentDelete(cmd) => self.attachment_delete(txn, ctx, idx, cmd),
            WriteCommand::AttachmentMove(cmd) => self.attachment_transfer(txn, ctx, idx, cmd, true),
            WriteCommand::AttachmentCopy(cmd) => {
                self.attachment_transfer(txn, ctx, idx, cmd, false)
            }
            WriteCommand::Counters(cmd) => self.counters(txn, ctx, idx, cmd),
            WriteCommand::TimeSeries(cmd) => self.time_series(txn, ctx, idx, cmd),
            WriteCommand::TimeSeriesCopy(cmd) => self.time_series_copy(txn, ctx, idx, cmd),
        }
    }

    /// Allocates an etag and the change vector that goes with it.
    fn stamp(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        existing: Option<&ChangeVector>,
    ) -> (u64, ChangeVector) {
        let etag = txn.next_etag();
        let base = match existing {
            Some(cv) => self.database_vector.merge(cv),
            None => self.database_vector.clone(),
        };
        let cv = base.with_bumped(&ctx.config.node_tag, &ctx.config.database_id, etag);
        // TRXN entries belong to single documents, never to the database vector.
        self.database_vector = self.database_vector.merge(&cv.without_tag(TRXN_TAG));
        self.last_change_vector = Some(cv.clone());
        (etag, cv)
    }

    fn schedule_fixup(&mut self, id: &str, target: FixupTarget) {
        self.documents_to_fix
            .entry(lower_id(id))
            .or_insert_with(|| (id.to_string(), Vec::new()))
            .1
            .push(target);
    }

    fn write_document(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        id: &str,
        mut body: Value,
        flags: DocumentFlags,
        existing: Option<&Document>,
    ) -> Result<Document, MergeDbError> {
        if !body.is_object() {
            return Err(MergeDbError::Validation(format!(
                "document '{id}' body must be a JSON object"
            )));
        }
        let collection = collection_of(&body);
        if let Some(doc) = existing
            && doc.collection != collection
        {
            return Err(MergeDbError::CollectionMismatch {
                id: id.to_string(),
                existing: doc.collection.clone(),
                requested: collection,
            });
        }
        let flags = sync_metadata(txn, id, &mut body, flags);
        let (etag, change_vector) = self.stamp(txn, ctx, existing.map(|d| &d.change_vector));
        let document = Document {
            id: id.to_string(),
            etag,
            change_vector,
            body,
            collection: collection.clone(),
            flags,
            last_modified_micros: ctx.now_micros,
        };
        txn.put_document(document.clone());
        self.modified_collections.insert(collection);
        Ok(document)
    }

    fn delete_document(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        doc: &Document,
    ) -> ChangeVector {
        let (etag, change_vector) = self.stamp(txn, ctx, Some(&doc.change_vector));
        txn.delete_document(Tombstone {
            id: doc.id.clone(),
            etag,
            change_vector: change_vector.clone(),
            collection: doc.collection.clone(),
            flags: doc.flags.intersection(DocumentFlags::HAS_REVISIONS),
            last_modified_micros: ctx.now_micros,
        });
        self.modified_collections.insert(doc.collection.clone());
        change_vector
    }

    fn put(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        idx: usize,
        cmd: &PutCommand,
    ) -> Result<CommandReply, MergeDbError> {
        let separator = ctx.config.identity_parts_separator;
        let (id, must_be_new) = if cmd.id.is_empty() {
            (non_conflicting_id("", &ctx.config.node_tag), true)
        } else if cmd.id.ends_with(separator) {
            (
                format!(
                    "{}{:019}-{}",
                    cmd.id,
                    txn.last_etag() + 1,
                    ctx.config.node_tag
                ),
                true,
            )
        } else {
            (cmd.id.clone(), cmd.must_be_new)
        };
        let existing = txn.document(&id).cloned();
        if must_be_new && existing.is_some() {
            return Err(MergeDbError::IdentityCollision {
                id,
                command_index: idx,
            });
        }
        check_expected(
            &id,
            cmd.expected_change_vector.as_ref(),
            existing.as_ref().map(|d| &d.change_vector),
        )?;
        let mut flags = cmd.flags.without(DocumentFlags::DERIVED);
        if let Some(doc) = &existing {
            flags = flags.with(doc.flags.intersection(DocumentFlags::HAS_REVISIONS));
        }
        if cmd.force_revision == ForceRevisionStrategy::Before {
            let Some(doc) = &existing else {
                return Err(MergeDbError::document_not_found(&id));
            };
            create_revision(txn, doc);
            flags = flags.with(DocumentFlags::HAS_REVISIONS);
        }
        let document =
            self.write_document(txn, ctx, &id, cmd.body.clone(), flags, existing.as_ref())?;
        self.last_put_id = Some(document.id.clone());
        Ok(CommandReply::Put(PutReply {
            id: document.id,
            collection: document.collection,
            change_vector: document.change_vector,
            last_modified_micros: document.last_modified_micros,
            flags: document.flags,
        }))
    }

    fn delete(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        cmd: &DeleteCommand,
    ) -> Result<CommandReply, MergeDbError> {
        let existing = txn.document(&cmd.id).cloned();
        check_expected(
            &cmd.id,
            cmd.expected_change_vector.as_ref(),
            existing.as_ref().map(|d| &d.change_vector),
        )?;
        let Some(doc) = existing else {
            return Ok(CommandReply::Delete(DeleteReply {
                id: cmd.id.clone(),
                deleted: false,
                change_vector: None,
            }));
        };
        let change_vector = self.delete_document(txn, ctx, &doc);
        Ok(CommandReply::Delete(DeleteReply {
            id: doc.id,
            deleted: true,
            change_vector: Some(change_vector),
        }))
    }

    fn delete_by_prefix(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        prefix: &str,
    ) -> Result<CommandReply, MergeDbError> {
        let ids = txn.document_ids_with_prefix(prefix);
        let mut last = None;
        for id in &ids {
            if let Some(doc) = txn.document(id).cloned() {
                last = Some(self.delete_document(txn, ctx, &doc));
            }
        }
        Ok(CommandReply::Delete(DeleteReply {
            id: prefix.to_string(),
            deleted: !ids.is_empty(),
            change_vector: last,
        }))
    }

    fn patch(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        cmd: &PatchCommand,
    ) -> Result<CommandReply, MergeDbError> {
        let existing = txn.document(&cmd.id).cloned();
        check_expected(
            &cmd.id,
            cmd.expected_change_vector.as_ref(),
            existing.as_ref().map(|d| &d.change_vector),
        )?;
        match existing {
            Some(doc) => match ctx.scripts.execute(&cmd.patch, &doc.body)? {
                PatchOutcome::NotModified => Ok(CommandReply::Patch(PatchReply {
                    id: doc.id,
                    status: PatchStatus::NotModified,
                    change_vector: Some(doc.change_vector),
                    collection: Some(doc.collection),
                    last_modified_micros: Some(doc.last_modified_micros),
                })),
                PatchOutcome::Modified(body) => {
                    let flags = doc.flags;
                    let written = self.write_document(txn, ctx, &doc.id, body, flags, Some(&doc))?;
                    Ok(patch_reply(written, PatchStatus::Patched))
                }
            },
            None => {
                let skipped = CommandReply::Patch(PatchReply {
                    id: cmd.id.clone(),
                    status: PatchStatus::Skipped,
                    change_vector: None,
                    collection: None,
                    last_modified_micros: None,
                });
                let Some(if_missing) = &cmd.patch_if_missing else {
                    return Ok(skipped);
                };
                match ctx.scripts.execute(if_missing, &Value::Object(Map::new()))? {
                    PatchOutcome::NotModified => Ok(skipped),
                    PatchOutcome::Modified(body) => {
                        let written = self.write_document(
                            txn,
                            ctx,
                            &cmd.id,
                            body,
                            DocumentFlags::NONE,
                            None,
                        )?;
                        Ok(patch_reply(written, PatchStatus::Created))
                    }
                }
            }
        }
    }

    fn force_revision(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        id: &str,
    ) -> Result<CommandReply, MergeDbError> {
        let doc = txn
            .document(id)
            .cloned()
            .ok_or_else(|| MergeDbError::document_not_found(id))?;
        let current = if doc.flags.contains(DocumentFlags::HAS_REVISIONS) {
            doc
        } else {
            let flags = doc.flags.with(DocumentFlags::HAS_REVISIONS);
            self.write_document(txn, ctx, &doc.id, doc.body.clone(), flags, Some(&doc))?
        };
        let revision_created = create_revision(txn, &current);
        Ok(CommandReply::ForceRevision(ForceRevisionReply {
            id: current.id,
            revision_created,
            change_vector: current.change_vector,
        }))
    }

    /// Ids ending in the separator point at the latest put of this batch
    /// that was generated from the same prefix.
    fn resolve_document_id(
        &self,
        ctx: &ExecutionContext<'_>,
        raw: &str,
    ) -> Result<String, MergeDbError> {
        if !raw.ends_with(ctx.config.identity_parts_separator) {
            return Ok(raw.to_string());
        }
        match &self.last_put_id {
            Some(id) if lower_id(id).starts_with(&lower_id(raw)) => Ok(id.clone()),
            _ => Err(MergeDbError::Validation(format!(
                "cannot resolve document id '{raw}': no preceding put in this batch uses that prefix"
            ))),
        }
    }

    fn attachment_put(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        batch: &Batch,
        idx: usize,
        cmd: &AttachmentPutCommand,
    ) -> Result<CommandReply, MergeDbError> {
        let document_id = self.resolve_document_id(ctx, &cmd.document_id)?;
        let doc = require_document(txn, &document_id)?;
        let existing = txn.attachment(&document_id, &cmd.name).cloned();
        check_expected(
            &format!("{document_id}/{}", cmd.name),
            cmd.expected_change_vector.as_ref(),
            existing.as_ref().map(|a| &a.change_vector),
        )?;
        let bytes = batch.attachment_bytes(&cmd.stream)?;
        let (etag, change_vector) =
            self.stamp(txn, ctx, existing.as_ref().map(|a| &a.change_vector));
        let entry = AttachmentEntry {
            name: cmd.name.clone(),
            hash: cmd.stream.hash.clone(),
            content_type: cmd.content_type.clone(),
            size: bytes.len() as u64,
            etag,
            change_vector: change_vector.clone(),
        };
        txn.put_attachment(&document_id, entry.clone(), Some(Arc::new(bytes)))?;
        self.modified_collections.insert(doc.collection);
        self.schedule_fixup(&document_id, FixupTarget::Reply(idx));
        Ok(CommandReply::AttachmentPut(AttachmentReply {
            document_id: doc.id,
            name: entry.name,
            hash: entry.hash,
            content_type: entry.content_type,
            size: entry.size,
            change_vector,
            document_change_vector: None,
        }))
    }

    fn attachment_delete(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        idx: usize,
        cmd: &AttachmentDeleteCommand,
    ) -> Result<CommandReply, MergeDbError> {
        let document_id = self.resolve_document_id(ctx, &cmd.document_id)?;
        let existing = txn.attachment(&document_id, &cmd.name).cloned();
        check_expected(
            &format!("{document_id}/{}", cmd.name),
            cmd.expected_change_vector.as_ref(),
            existing.as_ref().map(|a| &a.change_vector),
        )?;
        let deleted =
            existing.is_some() && txn.remove_attachment(&document_id, &cmd.name).is_some();
        if deleted {
            self.stamp(txn, ctx, None);
            if let Some(doc) = txn.document(&document_id) {
                self.modified_collections.insert(doc.collection.clone());
            }
            self.schedule_fixup(&document_id, FixupTarget::Reply(idx));
        }
        Ok(CommandReply::AttachmentDelete(AttachmentDeleteReply {
            document_id,
            name: cmd.name.clone(),
            deleted,
            document_change_vector: None,
        }))
    }

    fn attachment_transfer(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        idx: usize,
        cmd: &AttachmentTransferCommand,
        remove_source: bool,
    ) -> Result<CommandReply, MergeDbError> {
        let source_id = self.resolve_document_id(ctx, &cmd.document_id)?;
        let source_doc = require_document(txn, &source_id)?;
        let destination_doc = require_document(txn, &cmd.destination_id)?;
        let source = txn
            .attachment(&source_id, &cmd.name)
            .cloned()
            .ok_or_else(|| MergeDbError::NotFound {
                resource_type: ResourceType::Attachment,
                resource_id: format!("{source_id}/{}", cmd.name),
            })?;
        if txn.attachment(&cmd.destination_id, &cmd.destination_name).is_some() {
            return Err(MergeDbError::Validation(format!(
                "attachment '{}' already exists on '{}'",
                cmd.destination_name, cmd.destination_id
            )));
        }
        let (etag, change_vector) = self.stamp(txn, ctx, None);
        let entry = AttachmentEntry {
            name: cmd.destination_name.clone(),
            etag,
            change_vector: change_vector.clone(),
            ..source.clone()
        };
        // Add first so a move never drops the blob's last reference.
        txn.put_attachment(&cmd.destination_id, entry.clone(), None)?;
        self.modified_collections.insert(destination_doc.collection.clone());
        if remove_source {
            txn.remove_attachment(&source_id, &cmd.name);
            self.modified_collections.insert(source_doc.collection.clone());
            self.schedule_fixup(&source_id, FixupTarget::Reply(idx));
            self.schedule_fixup(&cmd.destination_id, FixupTarget::MoveDestination(idx));
            Ok(CommandReply::AttachmentMove(AttachmentMoveReply {
                document_id: source_doc.id,
                name: cmd.name.clone(),
                destination_id: destination_doc.id,
                destination_name: entry.name,
                hash: entry.hash,
                change_vector,
                document_change_vector: None,
                destination_document_change_vector: None,
            }))
        } else {
            self.schedule_fixup(&cmd.destination_id, FixupTarget::Reply(idx));
            Ok(CommandReply::AttachmentCopy(AttachmentReply {
                document_id: destination_doc.id,
                name: entry.name,
                hash: entry.hash,
                content_type: entry.content_type,
                size: entry.size,
                change_vector,
                document_change_vector: None,
            }))
        }
    }

    fn counters(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        idx: usize,
        cmd: &CounterCommand,
    ) -> Result<CommandReply, MergeDbError> {
        let doc = require_document(txn, &cmd.document_id)?;
        let mut details = Vec::with_capacity(cmd.operations.len());
        let mut last_change_vector = None;
        for op in &cmd.operations {
            let existing = txn.counter(&doc.id, &op.name).cloned();
            match &op.kind {
                CounterOperationKind::Increment(delta) => {
                    let current = existing.as_ref().map(|c| c.value).unwrap_or(0);
                    let value = current.checked_add(*delta).ok_or_else(|| {
                        MergeDbError::Validation(format!("counter '{}' overflowed", op.name))
                    })?;
                    let (etag, change_vector) =
                        self.stamp(txn, ctx, existing.as_ref().map(|c| &c.change_vector));
                    txn.put_counter(
                        &doc.id,
                        CounterEntry {
                            name: existing.map(|c| c.name).unwrap_or_else(|| op.name.clone()),
                            value,
                            etag,
                            change_vector: change_vector.clone(),
                        },
                    );
                    last_change_vector = Some(change_vector);
                    details.push(CounterDetail {
                        name: op.name.clone(),
                        total: Some(value),
                    });
                }
                CounterOperationKind::Delete => {
                    if let Some(removed) = txn.remove_counter(&doc.id, &op.name) {
                        let (_, change_vector) = self.stamp(txn, ctx, Some(&removed.change_vector));
                        last_change_vector = Some(change_vector);
                    }
                    details.push(CounterDetail {
                        name: op.name.clone(),
                        total: None,
                    });
                }
                CounterOperationKind::Get => details.push(CounterDetail {
                    name: op.name.clone(),
                    total: existing.map(|c| c.value),
                }),
            }
        }
        if last_change_vector.is_some() {
            self.modified_collections.insert(doc.collection.clone());
            self.schedule_fixup(&doc.id, FixupTarget::Reply(idx));
        }
        Ok(CommandReply::Counters(CountersReply {
            document_id: doc.id,
            change_vector: last_change_vector,
            counters: details,
            document_change_vector: None,
        }))
    }

    fn time_series(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        idx: usize,
        cmd: &TimeSeriesCommand,
    ) -> Result<CommandReply, MergeDbError> {
        let doc = require_document(txn, &cmd.document_id)?;
        let existing = txn.time_series(&doc.id, &cmd.name).cloned();
        let mut segment = existing
            .clone()
            .unwrap_or_else(|| TimeSeriesSegment::new(&cmd.name));
        for range in &cmd.deletes {
            segment.points.retain(|timestamp, _| !range.contains(*timestamp));
        }
        for append in &cmd.appends {
            if append.values.is_empty() {
                return Err(MergeDbError::Validation(format!(
                    "time series '{}' append at {} has no values",
                    cmd.name, append.timestamp
                )));
            }
            segment.points.insert(
                append.timestamp,
                TimeSeriesPoint {
                    timestamp: append.timestamp,
                    values: append.values.clone(),
                    tag: append.tag.clone(),
                },
            );
        }
        let change_vector = self.store_segment(txn, ctx, &doc, existing, segment);
        if change_vector.is_some() {
            self.schedule_fixup(&doc.id, FixupTarget::Reply(idx));
        }
        Ok(CommandReply::TimeSeries(TimeSeriesReply {
            document_id: doc.id,
            name: cmd.name.clone(),
            change_vector,
            document_change_vector: None,
        }))
    }

    fn time_series_copy(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        idx: usize,
        cmd: &TimeSeriesCopyCommand,
    ) -> Result<CommandReply, MergeDbError> {
        let source_doc = require_document(txn, &cmd.source_id)?;
        let destination_doc = require_document(txn, &cmd.destination_id)?;
        let source = txn
            .time_series(&source_doc.id, &cmd.source_name)
            .cloned()
            .ok_or_else(|| MergeDbError::NotFound {
                resource_type: ResourceType::TimeSeries,
                resource_id: format!("{}/{}", source_doc.id, cmd.source_name),
            })?;
        let existing = txn
            .time_series(&destination_doc.id, &cmd.destination_name)
            .cloned();
        let mut segment = existing
            .clone()
            .unwrap_or_else(|| TimeSeriesSegment::new(&cmd.destination_name));
        for (timestamp, point) in &source.points {
            if cmd.range.contains(*timestamp) {
                segment.points.insert(*timestamp, point.clone());
            }
        }
        let change_vector = self.store_segment(txn, ctx, &destination_doc, existing, segment);
        if change_vector.is_some() {
            self.schedule_fixup(&destination_doc.id, FixupTarget::Reply(idx));
        }
        Ok(CommandReply::TimeSeriesCopy(TimeSeriesReply {
            document_id: destination_doc.id,
            name: cmd.destination_name.clone(),
            change_vector,
            document_change_vector: None,
        }))
    }

    /// Writes or removes the segment. Returns the new change vector when the
    /// stored series changed.
    fn store_segment(
        &mut self,
        txn: &mut WriteTransaction,
        ctx: &ExecutionContext<'_>,
        doc: &Document,
        existing: Option<TimeSeriesSegment>,
        mut segment: TimeSeriesSegment,
    ) -> Option<ChangeVector> {
        if let Some(previous) = &existing
            && previous.points == segment.points
        {
            return None;
        }
        if segment.points.is_empty() {
            let previous = existing?;
            txn.remove_time_series(&doc.id, &segment.name);
            let (_, change_vector) = self.stamp(txn, ctx, Some(&previous.change_vector));
            self.modified_collections.insert(doc.collection.clone());
            return Some(change_vector);
        }
        let (etag, change_vector) =
            self.stamp(txn, ctx, existing.as_ref().map(|s| &s.change_vector));
        segment.etag = etag;
        segment.change_vector = change_vector.clone();
        txn.put_time_series(&doc.id, segment);
        self.modified_collections.insert(doc.collection.clone());
        Some(change_vector)
    }

    fn fix_up_documents(&mut self, txn: &mut WriteTransaction, ctx: &ExecutionContext<'_>) {
        for (_, (id, targets)) in std::mem::take(&mut self.documents_to_fix) {
            let Some(doc) = txn.document(&id).cloned() else {
                continue;
            };
            let mut body = doc.body.clone();
            let flags = sync_metadata(txn, &id, &mut body, doc.flags);
            let (etag, change_vector) = self.stamp(txn, ctx, Some(&doc.change_vector));
            self.modified_collections.insert(doc.collection.clone());
            txn.put_document(Document {
                etag,
                change_vector: change_vector.clone(),
                body,
                flags,
                last_modified_micros: ctx.now_micros,
                ..doc
            });
            for target in targets {
                self.set_document_change_vector(target, &change_vector);
            }
        }
    }

    fn set_document_change_vector(&mut self, target: FixupTarget, change_vector: &ChangeVector) {
        let value = Some(change_vector.clone());
        match target {
            FixupTarget::Reply(idx) => match self.replies.get_mut(idx) {
                Some(CommandReply::AttachmentPut(reply) | CommandReply::AttachmentCopy(reply)) => {
                    reply.document_change_vector = value
                }
                Some(CommandReply::AttachmentDelete(reply)) => reply.document_change_vector = value,
                Some(CommandReply::AttachmentMove(reply)) => reply.document_change_vector = value,
                Some(CommandReply::Counters(reply)) => reply.document_change_vector = value,
                Some(CommandReply::TimeSeries(reply) | CommandReply::TimeSeriesCopy(reply)) => {
                    reply.document_change_vector = value
                }
                _ => {}
            },
            FixupTarget::MoveDestination(idx) => {
                if let Some(CommandReply::AttachmentMove(reply)) = self.replies.get_mut(idx) {
                    reply.destination_document_change_vector = value;
                }
            }
        }
    }

    fn finish(self, txn: &WriteTransaction) -> ExecutedBatch {
        ExecutedBatch {
            result: BatchResult {
                replies: self.replies,
                last_change_vector: self.last_change_vector,
                last_tombstone_etag: txn.last_tombstone_etag(),
                modified_collections: self.modified_collections,
            },
            database_vector: self.database_vector,
        }
    }
}

fn patch_reply(document: Document, status: PatchStatus) -> CommandReply {
    CommandReply::Patch(PatchReply {
        id: document.id,
        status,
        change_vector: Some(document.change_vector),
        collection: Some(document.collection),
        last_modified_micros: Some(document.last_modified_micros),
    })
}

fn require_document(keyspace: &Keyspace, id: &str) -> Result<Document, MergeDbError> {
    keyspace
        .document(id)
        .cloned()
        .ok_or_else(|| MergeDbError::document_not_found(id))
}

/// An expected vector must dominate the stored one. An empty expected vector
/// means the item must not exist.
pub(crate) fn check_expected(
    id: &str,
    expected: Option<&ChangeVector>,
    actual: Option<&ChangeVector>,
) -> Result<(), MergeDbError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let accepted = match actual {
        None => expected.is_empty(),
        Some(actual) => !expected.is_empty() && expected.dominates(actual),
    };
    if accepted {
        Ok(())
    } else {
        Err(MergeDbError::ConcurrencyViolation {
            id: id.to_string(),
            expected: Some(expected.clone()),
            actual: actual.cloned(),
        })
    }
}

/// Creates a revision of `doc` unless one with identical content exists.
pub(crate) fn create_revision(txn: &mut WriteTransaction, doc: &Document) -> bool {
    let hash = content_hash(&doc.body);
    if txn.has_revision_with_hash(&doc.id, &hash) {
        return false;
    }
    let etag = txn.next_etag();
    txn.push_revision(Revision {
        id: doc.id.clone(),
        etag,
        change_vector: doc.change_vector.clone(),
        body: doc.body.clone(),
        flags: doc.flags.with(DocumentFlags::REVISION),
        last_modified_micros: doc.last_modified_micros,
        content_hash: hash,
    });
    true
}

/// Rewrites the `@attachments`, `@counters` and `@timeseries` metadata lists
/// from the side tables and returns the matching flags.
pub(crate) fn sync_metadata(
    keyspace: &Keyspace,
    id: &str,
    body: &mut Value,
    flags: DocumentFlags,
) -> DocumentFlags {
    let attachments: Vec<Value> = keyspace
        .attachments_of(id)
        .into_iter()
        .map(|a| {
            json!({
                "Name": a.name,
                "Hash": a.hash,
                "ContentType": a.content_type,
                "Size": a.size,
            })
        })
        .collect();
    let counters: Vec<Value> = keyspace
        .counters_of(id)
        .into_iter()
        .map(|c| Value::String(c.name))
        .collect();
    let series: Vec<Value> = keyspace
        .time_series_of(id)
        .into_iter()
        .map(|s| Value::String(s.name))
        .collect();
    let flags = flags
        .toggled(DocumentFlags::HAS_ATTACHMENTS, !attachments.is_empty())
        .toggled(DocumentFlags::HAS_COUNTERS, !counters.is_empty())
        .toggled(DocumentFlags::HAS_TIME_SERIES, !series.is_empty());

    let Value::Object(root) = body else {
        return flags;
    };
    let nothing_to_write = attachments.is_empty() && counters.is_empty() && series.is_empty();
    if nothing_to_write && !root.contains_key(METADATA_KEY) {
        return flags;
    }
    let metadata = root
        .entry(METADATA_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    if let Value::Object(metadata) = metadata {
        set_list(metadata, ATTACHMENTS_KEY, attachments);
        set_list(metadata, COUNTERS_KEY, counters);
        set_list(metadata, TIME_SERIES_KEY, series);
    }
    flags
}

fn set_list(metadata: &mut Map<String, Value>, key: &str, items: Vec<Value>) {
    if items.is_empty() {
        metadata.remove(key);
    } else {
        metadata.insert(key.to_string(), Value::Array(items));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::command::{
        CounterOperation, PatchRequest, TimeRange, TimeSeriesAppend,
    };
    use crate::commit::patch::MergePatchEngine;
    use crate::storage::{MemoryStorage, StorageEngine};

    fn run(
        txn: &mut WriteTransaction,
        batch: &Batch,
    ) -> Result<ExecutedBatch, MergeDbError> {
        let config = MergeDbConfig::default();
        let ctx = ExecutionContext {
            config: &config,
            scripts: &MergePatchEngine,
            now_micros: 42,
        };
        let running = txn.database_change_vector().clone();
        execute_batch(txn, &ctx, batch, running)
    }

    fn user(name: &str) -> Value {
        json!({"name": name, "@metadata": {"@collection": "Users"}})
    }

    #[test]
    fn put_stamps_local_tag_and_threads_database_vector() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin_write().expect("begin");
        let batch = Batch::new(vec![
            WriteCommand::put("users/1", user("a")),
            WriteCommand::put("users/2", user("b")),
        ]);
        let executed = run(&mut txn, &batch).expect("execute");
        let config = MergeDbConfig::default();
        match &executed.result.replies[1] {
            CommandReply::Put(reply) => {
                assert_eq!(reply.collection, "Users");
                assert_eq!(
                    reply.change_vector.counter_for(&config.node_tag, &config.database_id),
                    2
                );
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(
            executed
                .database_vector
                .counter_for(&config.node_tag, &config.database_id),
            2
        );
        assert_eq!(executed.result.last_change_vector, Some(executed.database_vector.clone()));
        assert!(executed.result.modified_collections.contains("Users"));
    }

    #[test]
    fn empty_expected_vector_requires_absence() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin_write().expect("begin");
        run(&mut txn, &Batch::new(vec![WriteCommand::put("users/1", user("a"))])).expect("seed");
        let err = run(
            &mut txn,
            &Batch::new(vec![WriteCommand::put_expecting(
                "users/1",
                user("b"),
                ChangeVector::new(),
            )]),
        )
        .err()
        .expect("must conflict");
        assert!(matches!(err, MergeDbError::ConcurrencyViolation { .. }));
        run(
            &mut txn,
            &Batch::new(vec![WriteCommand::put_expecting(
                "users/2",
                user("b"),
                ChangeVector::new(),
            )]),
        )
        .expect("absent document accepts empty vector");
    }

    #[test]
    fn auto_numbered_put_collides_with_existing_id() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin_write().expect("begin");
        run(
            &mut txn,
            &Batch::new(vec![WriteCommand::put("users/0000000000000000003-A", user("a"))]),
        )
        .expect("seed");
        let err = run(
            &mut txn,
            &Batch::new(vec![
                WriteCommand::put("orders/1", json!({})),
                WriteCommand::put("users/", user("b")),
            ]),
        )
        .err()
        .expect("collision");
        match err {
            MergeDbError::IdentityCollision { id, command_index } => {
                assert_eq!(command_index, 1);
                assert_eq!(id, "users/0000000000000000003-A");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn delete_missing_reports_not_deleted() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin_write().expect("begin");
        let executed = run(&mut txn, &Batch::new(vec![WriteCommand::delete("users/404")]))
            .expect("delete");
        assert_eq!(
            executed.result.replies[0],
            CommandReply::Delete(DeleteReply {
                id: "users/404".into(),
                deleted: false,
                change_vector: None,
            })
        );
        assert_eq!(executed.result.last_tombstone_etag, 0);
    }

    #[test]
    fn delete_by_prefix_removes_matching_documents() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin_write().expect("begin");
        run(
            &mut txn,
            &Batch::new(vec![
                WriteCommand::put("users/1", user("a")),
                WriteCommand::put("users/2", user("b")),
                WriteCommand::put("orders/1", json!({})),
            ]),
        )
        .expect("seed");
        let executed = run(
            &mut txn,
            &Batch::new(vec![
                WriteCommand::DeleteByPrefix {
                    id_prefix: "users/".into(),
                },
                WriteCommand::DeleteByPrefix {
                    id_prefix: "nothing/".into(),
                },
            ]),
        )
        .expect("delete");
        assert!(matches!(&executed.result.replies[0], CommandReply::Delete(r) if r.deleted));
        assert!(matches!(&executed.result.replies[1], CommandReply::Delete(r) if !r.deleted));
        assert_eq!(txn.document_count(), 1);
        assert_eq!(txn.tombstone_count(), 2);
        assert_eq!(executed.result.last_tombstone_etag, txn.last_etag());
    }

    #[test]
    fn patch_missing_document_is_skipped_or_created() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin_write().expect("begin");
        let executed = run(
            &mut txn,
            &Batch::new(vec![
                WriteCommand::patch("users/1", PatchRequest::new(r#"{"age": 3}"#)),
                WriteCommand::Patch(PatchCommand {
                    id: "users/2".into(),
                    patch: PatchRequest::new(r#"{"age": 3}"#),
                    patch_if_missing: Some(PatchRequest::new(
                        r#"{"age": 1, "@metadata": {"@collection": "Users"}}"#,
                    )),
                    expected_change_vector: None,
                }),
            ]),
        )
        .expect("patch");
        assert!(matches!(
            &executed.result.replies[0],
            CommandReply::Patch(r) if r.status == PatchStatus::Skipped
        ));
        assert!(matches!(
            &executed.result.replies[1],
            CommandReply::Patch(r) if r.status == PatchStatus::Created
        ));
        assert!(txn.document("users/1").is_none());
        assert_eq!(
            txn.document("users/2").map(|d| d.body["age"].clone()),
            Some(json!(1))
        );
    }

    #[test]
    fn force_revision_is_idempotent() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin_write().expect("begin");
        run(&mut txn, &Batch::new(vec![WriteCommand::put("users/1", user("a"))])).expect("seed");
        let executed = run(
            &mut txn,
            &Batch::new(vec![
                WriteCommand::ForceRevision {
                    id: "users/1".into(),
                },
                WriteCommand::ForceRevision {
                    id: "users/1".into(),
                },
            ]),
        )
        .expect("force");
        let created: Vec<bool> = executed
            .result
            .replies
            .iter()
            .map(|reply| match reply {
                CommandReply::ForceRevision(r) => r.revision_created,
                _ => false,
            })
            .collect();
        assert_eq!(created, vec![true, false]);
        assert_eq!(txn.revisions_of("users/1").len(), 1);
        let flags = txn.document("users/1").map(|d| d.flags).unwrap_or_default();
        assert!(flags.contains(DocumentFlags::HAS_REVISIONS));
    }

    #[test]
    fn attachment_changes_fix_up_owner_metadata_once() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin_write().expect("begin");
        run(&mut txn, &Batch::new(vec![WriteCommand::put("users/1", user("a"))])).expect("seed");
        let before = txn.document("users/1").cloned().expect("doc");
        let mut batch = Batch::default();
        batch
            .put_attachment("users/1", "a.txt", "text/plain", &b"one"[..])
            .expect("a");
        batch
            .put_attachment("users/1", "b.txt", "text/plain", &b"two"[..])
            .expect("b");
        let executed = run(&mut txn, &batch).expect("attach");
        let after = txn.document("users/1").cloned().expect("doc");
        assert!(after.flags.contains(DocumentFlags::HAS_ATTACHMENTS));
        assert_eq!(after.body["@metadata"]["@attachments"].as_array().map(Vec::len), Some(2));
        // two attachment stamps plus one document rewrite
        assert_eq!(after.etag, before.etag + 3);
        for reply in &executed.result.replies {
            match reply {
                CommandReply::AttachmentPut(r) => {
                    assert_eq!(r.document_change_vector.as_ref(), Some(&after.change_vector))
                }
                other => panic!("unexpected reply {other:?}"),
            }
        }
    }

    #[test]
    fn attachment_move_updates_both_documents() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin_write().expect("begin");
        let mut seed = Batch::new(vec![
            WriteCommand::put("users/1", user("a")),
            WriteCommand::put("users/2", user("b")),
        ]);
        seed.put_attachment("users/1", "a.txt", "text/plain", &b"one"[..])
            .expect("attach");
        run(&mut txn, &seed).expect("seed");
        let executed = run(
            &mut txn,
            &Batch::new(vec![WriteCommand::AttachmentMove(AttachmentTransferCommand {
                document_id: "users/1".into(),
                name: "a.txt".into(),
                destination_id: "users/2".into(),
                destination_name: "moved.txt".into(),
            })]),
        )
        .expect("move");
        assert!(txn.attachment("users/1", "a.txt").is_none());
        assert!(txn.attachment("users/2", "moved.txt").is_some());
        assert_eq!(txn.blob_count(), 1);
        match &executed.result.replies[0] {
            CommandReply::AttachmentMove(r) => {
                assert!(r.document_change_vector.is_some());
                assert!(r.destination_document_change_vector.is_some());
            }
            other => panic!("unexpected reply {other:?}"),
        }
        let source = txn.document("users/1").cloned().expect("doc");
        assert!(!source.flags.contains(DocumentFlags::HAS_ATTACHMENTS));
        assert!(source.body["@metadata"].get("@attachments").is_none());
    }

    #[test]
    fn counters_and_time_series_join_the_batch() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin_write().expect("begin");
        let executed = run(
            &mut txn,
            &Batch::new(vec![
                WriteCommand::put("users/1", user("a")),
                WriteCommand::Counters(CounterCommand {
                    document_id: "users/1".into(),
                    operations: vec![
                        CounterOperation {
                            name: "Likes".into(),
                            kind: CounterOperationKind::Increment(5),
                        },
                        CounterOperation {
                            name: "likes".into(),
                            kind: CounterOperationKind::Increment(-2),
                        },
                    ],
                }),
                WriteCommand::TimeSeries(TimeSeriesCommand {
                    document_id: "users/1".into(),
                    name: "HeartRate".into(),
                    appends: vec![
                        TimeSeriesAppend {
                            timestamp: 10,
                            values: vec![60.0],
                            tag: None,
                        },
                        TimeSeriesAppend {
                            timestamp: 20,
                            values: vec![61.0],
                            tag: Some("watch".into()),
                        },
                    ],
                    deletes: Vec::new(),
                }),
                WriteCommand::TimeSeriesCopy(TimeSeriesCopyCommand {
                    source_id: "users/1".into(),
                    source_name: "HeartRate".into(),
                    destination_id: "users/1".into(),
                    destination_name: "Archive".into(),
                    range: TimeRange {
                        from: Some(15),
                        to: None,
                    },
                }),
            ]),
        )
        .expect("execute");
        match &executed.result.replies[1] {
            CommandReply::Counters(r) => {
                assert_eq!(r.counters[1].total, Some(3));
                assert!(r.document_change_vector.is_some());
            }
            other => panic!("unexpected reply {other:?}"),
        }
        let doc = txn.document("users/1").cloned().expect("doc");
        assert!(doc.flags.contains(DocumentFlags::HAS_COUNTERS));
        assert!(doc.flags.contains(DocumentFlags::HAS_TIME_SERIES));
        assert_eq!(doc.body["@metadata"]["@counters"], json!(["Likes"]));
        assert_eq!(
            txn.time_series("users/1", "archive").map(|s| s.points.len()),
            Some(1)
        );
        assert_eq!(
            executed.result.last_change_vector.as_ref(),
            Some(&doc.change_vector)
        );
    }

    #[test]
    fn attachment_on_prefix_resolves_to_last_put() {
        let storage = MemoryStorage::new();
        let mut txn = storage.begin_write().expect("begin");
        let mut batch = Batch::new(vec![WriteCommand::put("users/", user("a"))]);
        batch
            .put_attachment("users/", "a.txt", "text/plain", &b"one"[..])
            .expect("attach");
        let executed = run(&mut txn, &batch).expect("execute");
        let id = executed.result.replies[0].id().to_string();
        assert!(id.starts_with("users/"));
        assert_eq!(executed.result.replies[1].id(), id);
        assert!(txn.attachment(&id, "a.txt").is_some());

        let mut orphan = Batch::default();
        orphan
            .put_attachment("orders/", "a.txt", "text/plain", &b"x"[..])
            .expect("attach");
        assert!(run(&mut txn, &orphan).is_err());
    }
}
