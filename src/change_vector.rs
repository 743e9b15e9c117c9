use crate::error::MergeDbError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Tag of the entry counting raft commands applied to a database. Node id is
/// the database group id.
pub const RAFT_TAG: &str = "RAFT";
/// Tag of the entry recording the commit index of the cluster transaction that
/// last wrote a document. Node id is the cluster transaction id.
pub const TRXN_TAG: &str = "TRXN";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeVectorEntry {
    pub tag: String,
    pub node_id: String,
    pub counter: u64,
}

impl ChangeVectorEntry {
    pub fn new(tag: impl Into<String>, node_id: impl Into<String>, counter: u64) -> Self {
        Self {
            tag: tag.into(),
            node_id: node_id.into(),
            counter,
        }
    }

    fn key_cmp(&self, tag: &str, node_id: &str) -> Ordering {
        (self.tag.as_str(), self.node_id.as_str()).cmp(&(tag, node_id))
    }
}

/// Result of comparing two change vectors entry by entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    Equal,
    /// The left side happened before the right side.
    Before,
    /// The left side happened after the right side.
    After,
    Concurrent,
}

/// Immutable causality stamp. Entries are kept sorted by `(tag, node_id)` with
/// at most one entry per pair, so structural equality is causal equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<ChangeVectorEntry>", into = "Vec<ChangeVectorEntry>")]
pub struct ChangeVector {
    entries: Vec<ChangeVectorEntry>,
}

impl ChangeVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(tag: &str, node_id: &str, counter: u64) -> Self {
        Self {
            entries: vec![ChangeVectorEntry::new(tag, node_id, counter)],
        }
    }

    /// Builds a vector from arbitrary entries; duplicate `(tag, node_id)` pairs
    /// collapse to their highest counter.
    pub fn from_entries(entries: impl IntoIterator<Item = ChangeVectorEntry>) -> Self {
        let mut out = Self::new();
        for entry in entries {
            out.raise(entry);
        }
        out
    }

    pub fn entries(&self) -> &[ChangeVectorEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn counter_for(&self, tag: &str, node_id: &str) -> u64 {
        self.position(tag, node_id)
            .ok()
            .map(|idx| self.entries[idx].counter)
            .unwrap_or(0)
    }

    /// Highest counter carried by `node_id` under any tag.
    pub fn counter_for_node(&self, node_id: &str) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.node_id == node_id)
            .map(|entry| entry.counter)
            .max()
            .unwrap_or(0)
    }

    pub fn with_bumped(&self, tag: &str, node_id: &str, counter: u64) -> Self {
        let mut next = self.clone();
        match next.position(tag, node_id) {
            Ok(idx) => next.entries[idx].counter = counter,
            Err(idx) => next
                .entries
                .insert(idx, ChangeVectorEntry::new(tag, node_id, counter)),
        }
        next
    }

    /// Removes every entry carrying `tag`.
    pub fn without_tag(&self, tag: &str) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|entry| entry.tag != tag)
                .cloned()
                .collect(),
        }
    }

    pub fn merge(&self, other: &ChangeVector) -> ChangeVector {
        let mut merged = Vec::with_capacity(self.entries.len().max(other.entries.len()));
        let mut left = self.entries.iter().peekable();
        let mut right = other.entries.iter().peekable();
        loop {
            let order = match (left.peek(), right.peek()) {
                (Some(l), Some(r)) => l.key_cmp(&r.tag, &r.node_id),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => break,
            };
            match order {
                Ordering::Less => merged.extend(left.next().cloned()),
                Ordering::Greater => merged.extend(right.next().cloned()),
                Ordering::Equal => {
                    if let (Some(l), Some(r)) = (left.next(), right.next()) {
                        let mut entry = l.clone();
                        entry.counter = entry.counter.max(r.counter);
                        merged.push(entry);
                    }
                }
            }
        }
        ChangeVector { entries: merged }
    }

    /// True when every entry of `other` is less than or equal to the matching
    /// entry of `self`. An empty `other` is dominated by everything.
    pub fn dominates(&self, other: &ChangeVector) -> bool {
        other
            .entries
            .iter()
            .all(|entry| self.counter_for(&entry.tag, &entry.node_id) >= entry.counter)
    }

    pub fn compare(&self, other: &ChangeVector) -> CausalOrder {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// Parses the textual form, `TAG:counter-nodeId` entries joined by `", "`.
    pub fn parse(text: &str) -> Result<Self, MergeDbError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::new());
        }
        let mut entries = Vec::new();
        for raw in trimmed.split(',') {
            entries.push(parse_entry(raw.trim())?);
        }
        Ok(Self::from_entries(entries))
    }

    fn position(&self, tag: &str, node_id: &str) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| entry.key_cmp(tag, node_id))
    }

    fn raise(&mut self, entry: ChangeVectorEntry) {
        match self.position(&entry.tag, &entry.node_id) {
            Ok(idx) => {
                let current = &mut self.entries[idx].counter;
                *current = (*current).max(entry.counter);
            }
            Err(idx) => self.entries.insert(idx, entry),
        }
    }
}

fn parse_entry(raw: &str) -> Result<ChangeVectorEntry, MergeDbError> {
    let (tag, rest) = raw
        .split_once(':')
        .ok_or_else(|| MergeDbError::Decode(format!("change vector entry '{raw}' has no tag")))?;
    let (counter, node_id) = rest.split_once('-').ok_or_else(|| {
        MergeDbError::Decode(format!("change vector entry '{raw}' has no node id"))
    })?;
    if !is_valid_tag(tag) {
        return Err(MergeDbError::Decode(format!(
            "change vector entry '{raw}' has an invalid tag"
        )));
    }
    if !is_valid_node_id(node_id) {
        return Err(MergeDbError::Decode(format!(
            "change vector entry '{raw}' has an invalid node id"
        )));
    }
    if !counter.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MergeDbError::Decode(format!(
            "change vector entry '{raw}' counter must be unsigned digits"
        )));
    }
    let counter = counter.parse::<u64>().map_err(|e| {
        MergeDbError::Decode(format!("change vector entry '{raw}' has a bad counter: {e}"))
    })?;
    Ok(ChangeVectorEntry::new(tag, node_id, counter))
}

pub(crate) fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && !tag
            .chars()
            .any(|c| c == ':' || c == '-' || c == ',' || c.is_whitespace())
}

pub(crate) fn is_valid_node_id(node_id: &str) -> bool {
    !node_id.is_empty() && !node_id.chars().any(|c| c == ',' || c.is_whitespace())
}

impl fmt::Display for ChangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, entry) in self.entries.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:{}-{}", entry.tag, entry.counter, entry.node_id)?;
        }
        Ok(())
    }
}

impl FromStr for ChangeVector {
    type Err = MergeDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<Vec<ChangeVectorEntry>> for ChangeVector {
    type Error = String;

    fn try_from(entries: Vec<ChangeVectorEntry>) -> Result<Self, Self::Error> {
        for entry in &entries {
            if !is_valid_tag(&entry.tag) || !is_valid_node_id(&entry.node_id) {
                return Err(format!(
                    "invalid change vector entry {}:{}",
                    entry.tag, entry.node_id
                ));
            }
        }
        Ok(Self::from_entries(entries))
    }
}

impl From<ChangeVector> for Vec<ChangeVectorEntry> {
    fn from(value: ChangeVector) -> Self {
        value.entries
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedChangeVector {
    pub version: u64,
    pub vector: ChangeVector,
}

/// Process-wide database change vector. Writers publish with an explicit
/// compare-and-swap on the version; readers take consistent snapshots.
#[derive(Debug, Default)]
pub struct SharedChangeVector {
    inner: RwLock<VersionedChangeVector>,
}

impl SharedChangeVector {
    pub fn new(initial: ChangeVector) -> Self {
        Self {
            inner: RwLock::new(VersionedChangeVector {
                version: 0,
                vector: initial,
            }),
        }
    }

    pub fn load(&self) -> VersionedChangeVector {
        self.inner.read().clone()
    }

    pub fn current(&self) -> ChangeVector {
        self.inner.read().vector.clone()
    }

    /// Installs `next` if the stored version is still `expected_version`.
    /// On mismatch the current state is returned so the caller can retry.
    pub fn compare_and_swap(
        &self,
        expected_version: u64,
        next: ChangeVector,
    ) -> Result<u64, VersionedChangeVector> {
        let mut guard = self.inner.write();
        if guard.version != expected_version {
            return Err(guard.clone());
        }
        guard.version += 1;
        guard.vector = next;
        Ok(guard.version)
    }

    /// Merges `vector` into the shared value with a CAS loop.
    pub fn merge_in(&self, vector: &ChangeVector) -> VersionedChangeVector {
        let mut current = self.load();
        loop {
            let merged = current.vector.merge(vector);
            if merged == current.vector {
                return current;
            }
            match self.compare_and_swap(current.version, merged.clone()) {
                Ok(version) => {
                    return VersionedChangeVector {
                        version,
                        vector: merged,
                    };
                }
                Err(observed) => current = observed,
            }
        }
    }
}
