//! Pluggable commit metadata filters and the registry that names them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::types::Timestamp;

/// Decides whether a commit may proceed given its metadata. A rejected
/// commit fails before anything is written.
pub trait CommitMetadataFilter: Send + Sync {
    fn accepts(&self, branch: &str, timestamp: Timestamp, metadata: Option<&Value>) -> bool;
}

/// Rejects commits that carry no metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequireMetadata;

impl CommitMetadataFilter for RequireMetadata {
    fn accepts(&self, _branch: &str, _timestamp: Timestamp, metadata: Option<&Value>) -> bool {
        metadata.is_some_and(|m| !m.is_null())
    }
}

pub type FilterConstructor = fn() -> Arc<dyn CommitMetadataFilter>;

/// Named filter constructors, used to resolve filters from configuration.
#[derive(Clone)]
pub struct FilterRegistry {
    constructors: BTreeMap<String, FilterConstructor>,
}

impl FilterRegistry {
    /// A registry without any filters.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: FilterConstructor) -> &mut Self {
        self.constructors.insert(name.into(), constructor);
        self
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn CommitMetadataFilter>> {
        self.constructors.get(name).map(|construct| construct())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl Default for FilterRegistry {
    /// Registry holding the built-in `require-metadata` filter.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("require-metadata", || Arc::new(RequireMetadata));
        registry
    }
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}
