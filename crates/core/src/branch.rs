use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::backend::BranchMetadata;
use crate::error::Result;
use crate::store::TemporalKeyValueStore;
use crate::types::{BranchHeadStatistics, Timestamp};

/// Name of the root branch. It always exists and cannot be deleted.
pub const MASTER_BRANCH: &str = "master";

/// A node of the branch tree. Owns exactly one store.
pub struct Branch {
    metadata: BranchMetadata,
    origin: Option<Arc<Branch>>,
    store: Arc<TemporalKeyValueStore>,
}

impl Branch {
    pub(crate) fn new(metadata: BranchMetadata, origin: Option<Arc<Branch>>, store: TemporalKeyValueStore) -> Self {
        Self {
            metadata,
            origin,
            store: Arc::new(store),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.metadata.parent.as_deref()
    }

    /// The parent branch. `None` for master.
    pub fn origin(&self) -> Option<&Arc<Branch>> {
        self.origin.as_ref()
    }

    pub fn branching_timestamp(&self) -> Timestamp {
        self.metadata.branching_timestamp
    }

    /// Wall-clock time the branch was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.metadata.created_at
    }

    pub fn is_master(&self) -> bool {
        self.origin.is_none()
    }

    /// Timestamp of the latest commit, or the branching timestamp if the
    /// branch has no commits of its own.
    pub fn now(&self) -> Result<Timestamp> {
        self.store.now()
    }

    pub fn head_statistics(&self) -> Result<BranchHeadStatistics> {
        self.store.head_statistics()
    }

    pub fn is_deleted(&self) -> bool {
        self.store.is_deleted()
    }

    pub fn metadata(&self) -> &BranchMetadata {
        &self.metadata
    }

    pub(crate) fn store(&self) -> &Arc<TemporalKeyValueStore> {
        &self.store
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("name", &self.metadata.name)
            .field("parent", &self.metadata.parent)
            .field("branching_timestamp", &self.metadata.branching_timestamp)
            .finish()
    }
}
