//! Contract for the secondary indexing engine fed by commits.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::error::Result;
use crate::types::{ChronoIdentifier, QualifiedKey, Timestamp};

/// One change pushed to the secondary index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: ChronoIdentifier,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

pub trait SecondaryIndexManager: Send + Sync {
    fn index(&self, entries: &[IndexEntry]) -> Result<()>;

    /// Discard index state for `branch` newer than `timestamp`, restricted to
    /// `keys` when given.
    fn rollback(
        &self,
        branch: &str,
        timestamp: Timestamp,
        keys: Option<&BTreeSet<QualifiedKey>>,
    ) -> Result<()>;

    fn clear_query_cache(&self);
}
