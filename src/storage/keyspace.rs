use crate::change_vector::ChangeVector;
use crate::error::MergeDbError;
use crate::storage::documents::{
    AttachmentEntry, CounterEntry, Document, Revision, TimeSeriesSegment, Tombstone, lower_id,
};
use im::{OrdMap, Vector};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
struct BlobEntry {
    bytes: Arc<Vec<u8>>,
    references: u32,
}

/// Persistent-map state of one database. Clones share structure, so a clone
/// per batch attempt is cheap and dropping it is the abort path.
#[derive(Debug, Clone, Default)]
pub struct Keyspace {
    documents: OrdMap<String, Document>,
    tombstones: OrdMap<String, Tombstone>,
    revisions: OrdMap<String, Vector<Revision>>,
    attachments: OrdMap<String, OrdMap<String, AttachmentEntry>>,
    blobs: OrdMap<String, BlobEntry>,
    counters: OrdMap<String, OrdMap<String, CounterEntry>>,
    time_series: OrdMap<String, OrdMap<String, TimeSeriesSegment>>,
    last_etag: u64,
    last_tombstone_etag: u64,
    database_change_vector: ChangeVector,
}

impl Keyspace {
    pub fn next_etag(&mut self) -> u64 {
        self.last_etag += 1;
        self.last_etag
    }

    pub fn last_etag(&self) -> u64 {
        self.last_etag
    }

    pub fn last_tombstone_etag(&self) -> u64 {
        self.last_tombstone_etag
    }

    pub fn database_change_vector(&self) -> &ChangeVector {
        &self.database_change_vector
    }

    pub fn set_database_change_vector(&mut self, vector: ChangeVector) {
        self.database_change_vector = vector;
    }

    pub fn document(&self, id: &str) -> Option<&Document> {
        self.documents.get(&lower_id(id))
    }

    pub fn tombstone(&self, id: &str) -> Option<&Tombstone> {
        self.tombstones.get(&lower_id(id))
    }

    pub fn put_document(&mut self, document: Document) {
        let key = lower_id(&document.id);
        self.tombstones.remove(&key);
        self.documents.insert(key, document);
    }

    /// Replaces the document with `tombstone` and drops every side table that
    /// hangs off it.
    pub fn delete_document(&mut self, tombstone: Tombstone) -> Option<Document> {
        let key = lower_id(&tombstone.id);
        let removed = self.documents.remove(&key);
        if let Some(entries) = self.attachments.remove(&key) {
            for entry in entries.values() {
                self.release_blob(&entry.hash);
            }
        }
        self.counters.remove(&key);
        self.time_series.remove(&key);
        self.last_tombstone_etag = self.last_tombstone_etag.max(tombstone.etag);
        self.tombstones.insert(key, tombstone);
        removed
    }

    pub fn document_ids_with_prefix(&self, prefix: &str) -> Vec<String> {
        let lower_prefix = lower_id(prefix);
        self.documents
            .range(lower_prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&lower_prefix))
            .map(|(_, doc)| doc.id.clone())
            .collect()
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Document bodies keyed by id, the comparison view used when checking two
    /// stores hold the same data.
    pub fn document_bodies(&self) -> BTreeMap<String, Value> {
        self.documents
            .values()
            .map(|doc| (doc.id.clone(), doc.body.clone()))
            .collect()
    }

    pub fn revisions_of(&self, id: &str) -> Vec<Revision> {
        self.revisions
            .get(&lower_id(id))
            .map(|revisions| revisions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_revision_with_hash(&self, id: &str, content_hash: &str) -> bool {
        self.revisions
            .get(&lower_id(id))
            .is_some_and(|revisions| revisions.iter().any(|r| r.content_hash == content_hash))
    }

    pub fn push_revision(&mut self, revision: Revision) {
        let key = lower_id(&revision.id);
        let mut history = self.revisions.get(&key).cloned().unwrap_or_default();
        history.push_back(revision);
        self.revisions.insert(key, history);
    }

    pub fn attachments_of(&self, id: &str) -> Vec<AttachmentEntry> {
        self.attachments
            .get(&lower_id(id))
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn attachment(&self, id: &str, name: &str) -> Option<&AttachmentEntry> {
        self.attachments.get(&lower_id(id))?.get(name)
    }

    pub fn attachment_content(&self, hash: &str) -> Option<Arc<Vec<u8>>> {
        self.blobs.get(hash).map(|blob| Arc::clone(&blob.bytes))
    }

    /// Stores `entry` under the document. New content must be supplied unless a
    /// blob with the same hash is already referenced.
    pub fn put_attachment(
        &mut self,
        id: &str,
        entry: AttachmentEntry,
        content: Option<Arc<Vec<u8>>>,
    ) -> Result<(), MergeDbError> {
        self.acquire_blob(&entry.hash, content)?;
        let key = lower_id(id);
        let mut entries = self.attachments.get(&key).cloned().unwrap_or_default();
        let previous = entries.insert(entry.name.clone(), entry);
        self.attachments.insert(key, entries);
        if let Some(previous) = previous {
            self.release_blob(&previous.hash);
        }
        Ok(())
    }

    pub fn remove_attachment(&mut self, id: &str, name: &str) -> Option<AttachmentEntry> {
        let key = lower_id(id);
        let entries = self.attachments.get_mut(&key)?;
        let removed = entries.remove(name)?;
        if entries.is_empty() {
            self.attachments.remove(&key);
        }
        self.release_blob(&removed.hash);
        Some(removed)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    pub fn counters_of(&self, id: &str) -> Vec<CounterEntry> {
        self.counters
            .get(&lower_id(id))
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn counter(&self, id: &str, name: &str) -> Option<&CounterEntry> {
        self.counters.get(&lower_id(id))?.get(&name.to_lowercase())
    }

    pub fn put_counter(&mut self, id: &str, entry: CounterEntry) {
        let key = lower_id(id);
        let mut entries = self.counters.get(&key).cloned().unwrap_or_default();
        entries.insert(entry.name.to_lowercase(), entry);
        self.counters.insert(key, entries);
    }

    pub fn remove_counter(&mut self, id: &str, name: &str) -> Option<CounterEntry> {
        let key = lower_id(id);
        let entries = self.counters.get_mut(&key)?;
        let removed = entries.remove(&name.to_lowercase());
        if entries.is_empty() {
            self.counters.remove(&key);
        }
        removed
    }

    pub fn time_series_of(&self, id: &str) -> Vec<TimeSeriesSegment> {
        self.time_series
            .get(&lower_id(id))
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn time_series(&self, id: &str, name: &str) -> Option<&TimeSeriesSegment> {
        self.time_series.get(&lower_id(id))?.get(&name.to_lowercase())
    }

    pub fn put_time_series(&mut self, id: &str, segment: TimeSeriesSegment) {
        let key = lower_id(id);
        let mut entries = self.time_series.get(&key).cloned().unwrap_or_default();
        entries.insert(segment.name.to_lowercase(), segment);
        self.time_series.insert(key, entries);
    }

    pub fn remove_time_series(&mut self, id: &str, name: &str) -> Option<TimeSeriesSegment> {
        let key = lower_id(id);
        let entries = self.time_series.get_mut(&key)?;
        let removed = entries.remove(&name.to_lowercase());
        if entries.is_empty() {
            self.time_series.remove(&key);
        }
        removed
    }

    fn acquire_blob(
        &mut self,
        hash: &str,
        content: Option<Arc<Vec<u8>>>,
    ) -> Result<(), MergeDbError> {
        if let Some(blob) = self.blobs.get_mut(hash) {
            blob.references += 1;
            return Ok(());
        }
        let bytes = content.ok_or_else(|| {
            MergeDbError::Validation(format!("attachment content for hash {hash} is missing"))
        })?;
        self.blobs.insert(
            hash.to_string(),
            BlobEntry {
                bytes,
                references: 1,
            },
        );
        Ok(())
    }

    fn release_blob(&mut self, hash: &str) {
        let drop_blob = match self.blobs.get_mut(hash) {
            Some(blob) => {
                blob.references = blob.references.saturating_sub(1);
                blob.references == 0
            }
            None => false,
        };
        if drop_blob {
            self.blobs.remove(hash);
        }
    }
}
