//! Branch creation, lookup and recursive deletion.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use crate::backend::BranchMetadata;
use crate::branch::{Branch, MASTER_BRANCH};
use crate::database::{create_branch, Verso};
use crate::error::{Result, VersoError};
use crate::types::Timestamp;

pub struct BranchManager<'a> {
    db: &'a Verso,
}

impl<'a> BranchManager<'a> {
    pub(crate) fn new(db: &'a Verso) -> Self {
        Self { db }
    }

    /// Branch off master at master's current now.
    pub fn create_branch(&self, name: &str) -> Result<Arc<Branch>> {
        let master = self.db.branch_named(MASTER_BRANCH)?;
        let now = master.now()?;
        self.create_branch_from(MASTER_BRANCH, name, now)
    }

    /// Branch off `parent` at `branching_timestamp`, which must not lie after
    /// the parent's now.
    pub fn create_branch_from(&self, parent: &str, name: &str, branching_timestamp: Timestamp) -> Result<Arc<Branch>> {
        if name.trim().is_empty() {
            return Err(VersoError::InvalidArgument("branch name must not be empty".into()));
        }
        let _db = self.db.shared.db_lock.read();
        let mut branches = self.db.branches.write();
        if branches.contains_key(name) {
            return Err(VersoError::BranchAlreadyExists(name.to_string()));
        }
        let origin = branches
            .get(parent)
            .cloned()
            .ok_or_else(|| VersoError::BranchNotFound(parent.to_string()))?;
        let parent_now = origin.store().now_unlocked()?;
        if branching_timestamp > parent_now {
            return Err(VersoError::InvalidArgument(format!(
                "branching timestamp {branching_timestamp} is after the now ({parent_now}) of parent '{parent}'"
            )));
        }

        let metadata = BranchMetadata::new(name, Some(parent.to_string()), branching_timestamp);
        let branch = create_branch(self.db, metadata, origin)?;
        branches.insert(name.to_string(), Arc::clone(&branch));
        info!(branch = name, parent, branching_timestamp, "created branch");
        Ok(branch)
    }

    pub fn branch(&self, name: &str) -> Result<Arc<Branch>> {
        self.db.branch_named(name)
    }

    pub fn master(&self) -> Result<Arc<Branch>> {
        self.db.branch_named(MASTER_BRANCH)
    }

    pub fn branch_names(&self) -> BTreeSet<String> {
        self.db.branches.read().keys().cloned().collect()
    }

    /// Direct children of `name`.
    pub fn child_branches(&self, name: &str) -> Result<Vec<Arc<Branch>>> {
        let branches = self.db.branches.read();
        if !branches.contains_key(name) {
            return Err(VersoError::BranchNotFound(name.to_string()));
        }
        Ok(branches
            .values()
            .filter(|b| b.parent_name() == Some(name))
            .cloned()
            .collect())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.db.branches.read().contains_key(name)
    }

    /// Delete `name` and all of its descendants, children before parents.
    /// Returns the deleted names in deletion order.
    pub fn delete_branch_recursively(&self, name: &str) -> Result<Vec<String>> {
        if name == MASTER_BRANCH {
            return Err(VersoError::InvalidArgument("the master branch cannot be deleted".into()));
        }
        let _db = self.db.shared.db_lock.write();
        let mut branches = self.db.branches.write();
        if !branches.contains_key(name) {
            return Err(VersoError::BranchNotFound(name.to_string()));
        }

        // Expand to a fixed point over the parent relation.
        let mut discovered = vec![name.to_string()];
        loop {
            let found: Vec<String> = branches
                .values()
                .filter(|b| {
                    b.parent_name().is_some_and(|p| discovered.iter().any(|d| d == p))
                        && !discovered.iter().any(|d| d == b.name())
                })
                .map(|b| b.name().to_string())
                .collect();
            if found.is_empty() {
                break;
            }
            discovered.extend(found);
        }

        let config = &self.db.shared.config;
        let mut deleted = Vec::with_capacity(discovered.len());
        for branch_name in discovered.into_iter().rev() {
            if let Some(branch) = branches.remove(&branch_name) {
                branch.store().mark_deleted();
            }
            self.db.backend.delete_branch(&branch_name)?;
            if let Some(index) = &config.secondary_index {
                index.rollback(&branch_name, 0, None)?;
            }
            info!(branch = %branch_name, "deleted branch");
            deleted.push(branch_name);
        }
        if let Some(cache) = &config.cache {
            cache.clear();
        }
        Ok(deleted)
    }
}
