//! Physical storage capabilities.
//!
//! The generic commit, read and dateback logic depends only on these traits.
//! Two backends ship with the crate: [`InMemoryBackend`] and [`RedbBackend`].

mod memory;
mod redb_store;

pub use self::memory::{InMemoryBackend, InMemoryMatrix};
pub use self::redb_store::RedbBackend;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::matrix::TemporalDataMatrix;
use crate::types::{Timestamp, WalToken};

/// Persisted description of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchMetadata {
    pub name: String,
    /// `None` only for master.
    pub parent: Option<String>,
    pub branching_timestamp: Timestamp,
    pub created_at: DateTime<Utc>,
}

impl BranchMetadata {
    pub fn new(name: impl Into<String>, parent: Option<String>, branching_timestamp: Timestamp) -> Self {
        Self {
            name: name.into(),
            parent,
            branching_timestamp,
            created_at: Utc::now(),
        }
    }
}

/// Branch catalog plus access to each branch's storage.
pub trait StorageBackend: Send + Sync {
    fn load_branches(&self) -> Result<Vec<BranchMetadata>>;

    fn save_branch(&self, metadata: &BranchMetadata) -> Result<()>;

    /// Remove the branch from the catalog together with all of its data.
    fn delete_branch(&self, name: &str) -> Result<()>;

    fn open_branch_storage(&self, branch: &str) -> Result<Arc<dyn BranchStorage>>;
}

/// Everything one branch's store persists: its matrices, its now, its WAL
/// token and its commit metadata.
pub trait BranchStorage: Send + Sync {
    fn create_matrix(
        &self,
        keyspace: &str,
        creation_timestamp: Timestamp,
    ) -> Result<Arc<dyn TemporalDataMatrix>>;

    fn load_matrices(&self) -> Result<Vec<Arc<dyn TemporalDataMatrix>>>;

    /// Remove a keyspace's matrix and every version in it.
    fn drop_matrix(&self, keyspace: &str) -> Result<()>;

    /// Stored now, without any clamping to the branching timestamp.
    fn now(&self) -> Result<Timestamp>;

    fn set_now(&self, timestamp: Timestamp) -> Result<()>;

    fn write_wal_token(&self, token: &WalToken) -> Result<()>;

    fn read_wal_token(&self) -> Result<Option<WalToken>>;

    fn clear_wal_token(&self) -> Result<()>;

    fn commit_metadata(&self) -> &dyn CommitMetadataStore;
}

/// Append-only `timestamp -> metadata bytes` mapping.
pub trait CommitMetadataStore: Send + Sync {
    fn put(&self, timestamp: Timestamp, metadata: &[u8]) -> Result<()>;

    fn get(&self, timestamp: Timestamp) -> Result<Option<Vec<u8>>>;

    /// Commit timestamps within `[lower, upper]`, ascending.
    fn timestamps_between(&self, lower: Timestamp, upper: Timestamp) -> Result<Vec<Timestamp>>;

    /// Remove metadata newer than `timestamp`.
    fn rollback(&self, timestamp: Timestamp) -> Result<()>;

    /// Remove the metadata at exactly `timestamp`. Returns whether it existed.
    fn purge(&self, timestamp: Timestamp) -> Result<bool>;
}
