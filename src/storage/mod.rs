pub mod documents;
pub mod keyspace;

use crate::error::MergeDbError;
use keyspace::Keyspace;
use parking_lot::RwLock;
use std::ops::{Deref, DerefMut};

/// A write transaction over a private copy of the keyspace. Dropping it
/// without committing discards every change.
#[derive(Debug, Clone)]
pub struct WriteTransaction {
    keyspace: Keyspace,
    base_version: u64,
}

impl WriteTransaction {
    pub fn new(keyspace: Keyspace, base_version: u64) -> Self {
        Self {
            keyspace,
            base_version,
        }
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn into_keyspace(self) -> Keyspace {
        self.keyspace
    }
}

impl Deref for WriteTransaction {
    type Target = Keyspace;

    fn deref(&self) -> &Self::Target {
        &self.keyspace
    }
}

impl DerefMut for WriteTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.keyspace
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    pub version: u64,
    pub last_etag: u64,
}

/// Transactional store the merger writes through. Only one write transaction
/// is expected to be open at a time.
pub trait StorageEngine: Send + Sync {
    fn begin_write(&self) -> Result<WriteTransaction, MergeDbError>;

    fn commit(&self, txn: WriteTransaction) -> Result<CommitInfo, MergeDbError>;

    fn abort(&self, txn: WriteTransaction) {
        drop(txn);
    }

    /// Latest committed state.
    fn snapshot(&self) -> Keyspace;

    fn committed_version(&self) -> u64;
}

#[derive(Debug, Default)]
struct CommittedState {
    keyspace: Keyspace,
    version: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<CommittedState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keyspace(keyspace: Keyspace) -> Self {
        Self {
            state: RwLock::new(CommittedState {
                keyspace,
                version: 0,
            }),
        }
    }
}

impl StorageEngine for MemoryStorage {
    fn begin_write(&self) -> Result<WriteTransaction, MergeDbError> {
        let state = self.state.read();
        Ok(WriteTransaction::new(state.keyspace.clone(), state.version))
    }

    fn commit(&self, txn: WriteTransaction) -> Result<CommitInfo, MergeDbError> {
        let mut state = self.state.write();
        if txn.base_version() != state.version {
            return Err(MergeDbError::StorageFatal(format!(
                "write transaction based on version {} but store is at {}",
                txn.base_version(),
                state.version
            )));
        }
        state.keyspace = txn.into_keyspace();
        state.version += 1;
        Ok(CommitInfo {
            version: state.version,
            last_etag: state.keyspace.last_etag(),
        })
    }

    fn snapshot(&self) -> Keyspace {
        self.state.read().keyspace.clone()
    }

    fn committed_version(&self) -> u64 {
        self.state.read().version
    }
}
