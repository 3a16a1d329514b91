//! Transactions: a read timestamp on one branch plus pending writes.
//!
//! Reads see committed state as of the transaction timestamp; pending
//! writes become visible only once committed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::branch::Branch;
use crate::error::{Result, VersoError};
use crate::store::commit::CommitRequest;
use crate::types::{GetResult, Order, QualifiedKey, TemporalKey, Timestamp, TxId};

/// Keyspace used when the caller has no reason to pick another.
pub const DEFAULT_KEYSPACE: &str = "default";

pub struct Transaction {
    id: TxId,
    branch: Arc<Branch>,
    timestamp: Timestamp,
    changes: BTreeMap<QualifiedKey, Option<Value>>,
}

fn qualified(keyspace: &str, key: &str) -> Result<QualifiedKey> {
    if keyspace.is_empty() {
        return Err(VersoError::InvalidArgument("keyspace must not be empty".into()));
    }
    if key.is_empty() {
        return Err(VersoError::InvalidArgument("key must not be empty".into()));
    }
    Ok(QualifiedKey::new(keyspace, key))
}

fn check_range(lower: Timestamp, upper: Timestamp) -> Result<()> {
    if lower > upper {
        return Err(VersoError::InvalidArgument(format!(
            "lower bound {lower} exceeds upper bound {upper}"
        )));
    }
    Ok(())
}

impl Transaction {
    pub(crate) fn new(branch: Arc<Branch>, timestamp: Timestamp) -> Self {
        Self {
            id: TxId::next(),
            branch,
            timestamp,
            changes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// The timestamp reads are served at.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn branch(&self) -> &Arc<Branch> {
        &self.branch
    }

    pub fn branch_name(&self) -> &str {
        self.branch.name()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub fn put(&mut self, keyspace: &str, key: &str, value: impl Serialize) -> Result<()> {
        let key = qualified(keyspace, key)?;
        let value = serde_json::to_value(value)?;
        self.changes.insert(key, Some(value));
        Ok(())
    }

    /// Stage a deletion. The key reads as absent after the commit.
    pub fn remove(&mut self, keyspace: &str, key: &str) -> Result<()> {
        let key = qualified(keyspace, key)?;
        self.changes.insert(key, None);
        Ok(())
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn pending_changes(&self) -> &BTreeMap<QualifiedKey, Option<Value>> {
        &self.changes
    }

    /// Commit pending writes. Returns the commit timestamp, or `None` when
    /// there was nothing to commit.
    pub fn commit(&mut self) -> Result<Option<Timestamp>> {
        self.commit_inner(None)
    }

    /// Commit with a payload recorded in the commit metadata store.
    pub fn commit_with_metadata(&mut self, metadata: impl Serialize) -> Result<Option<Timestamp>> {
        let metadata = serde_json::to_value(metadata)?;
        self.commit_inner(Some(metadata))
    }

    fn commit_inner(&mut self, metadata: Option<Value>) -> Result<Option<Timestamp>> {
        let committed = self.branch.store().commit(CommitRequest {
            tx: self.id,
            tx_timestamp: self.timestamp,
            changes: &self.changes,
            metadata,
        });
        match committed {
            Ok(Some(timestamp)) => {
                self.changes.clear();
                self.timestamp = timestamp;
                Ok(Some(timestamp))
            }
            Ok(None) => Ok(None),
            Err(err @ VersoError::CommitFailed { .. }) => {
                self.changes.clear();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Write pending changes as one step of an incremental commit. All steps
    /// share one timestamp, which becomes visible with the final
    /// [`commit`](Self::commit).
    pub fn commit_incremental(&mut self) -> Result<Timestamp> {
        let timestamp = self
            .branch
            .store()
            .commit_incremental(self.id, self.timestamp, &self.changes)?;
        self.changes.clear();
        Ok(timestamp)
    }

    pub fn is_incremental_commit_in_progress(&self) -> bool {
        self.branch.store().owns_incremental(self.id)
    }

    /// Discard pending changes and undo an incremental commit this
    /// transaction started.
    pub fn rollback(&mut self) -> Result<()> {
        self.changes.clear();
        if self.is_incremental_commit_in_progress() {
            self.branch.store().rollback_incremental(self.id)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, keyspace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.get_with_period(keyspace, key)?.into_value())
    }

    pub fn get_as<T: DeserializeOwned>(&self, keyspace: &str, key: &str) -> Result<Option<T>> {
        self.get(keyspace, key)?
            .map(|v| serde_json::from_value(v).map_err(VersoError::from))
            .transpose()
    }

    /// The value together with the period during which it is valid.
    pub fn get_with_period(&self, keyspace: &str, key: &str) -> Result<GetResult<Value>> {
        let key = qualified(keyspace, key)?;
        let ts = self.timestamp;
        self.branch.store().with_read_lock(|s| s.get_unlocked(ts, &key))
    }

    pub fn exists(&self, keyspace: &str, key: &str) -> Result<bool> {
        Ok(self.get_with_period(keyspace, key)?.value().is_some())
    }

    pub fn key_set(&self, keyspace: &str) -> Result<BTreeSet<String>> {
        if keyspace.is_empty() {
            return Err(VersoError::InvalidArgument("keyspace must not be empty".into()));
        }
        let ts = self.timestamp;
        self.branch.store().with_read_lock(|s| s.key_set_unlocked(ts, keyspace))
    }

    pub fn keyspaces(&self) -> Result<BTreeSet<String>> {
        let ts = self.timestamp;
        self.branch.store().with_read_lock(|s| s.keyspaces_unlocked(ts))
    }

    /// Every version timestamp of a key up to the transaction timestamp.
    pub fn history(&self, keyspace: &str, key: &str, order: Order) -> Result<Vec<Timestamp>> {
        self.history_between(keyspace, key, 0, self.timestamp, order)
    }

    pub fn history_between(
        &self,
        keyspace: &str,
        key: &str,
        lower: Timestamp,
        upper: Timestamp,
        order: Order,
    ) -> Result<Vec<Timestamp>> {
        let key = qualified(keyspace, key)?;
        check_range(lower, upper)?;
        let ts = self.timestamp;
        self.branch
            .store()
            .with_read_lock(|s| s.history_unlocked(ts, &key, lower, upper, order))
    }

    pub fn last_modification_timestamp(&self, keyspace: &str, key: &str) -> Result<Option<Timestamp>> {
        let key = qualified(keyspace, key)?;
        let ts = self.timestamp;
        self.branch
            .store()
            .with_read_lock(|s| s.last_modification_timestamp_unlocked(ts, &key))
    }

    /// All versions in `keyspace` within `[lower, upper]`, ascending.
    pub fn modifications_between(
        &self,
        keyspace: &str,
        lower: Timestamp,
        upper: Timestamp,
    ) -> Result<Vec<TemporalKey>> {
        check_range(lower, upper)?;
        let ts = self.timestamp;
        self.branch
            .store()
            .with_read_lock(|s| s.modifications_between_unlocked(ts, keyspace, lower, upper))
    }

    pub fn changed_keys_at_commit(&self, commit_timestamp: Timestamp, keyspace: &str) -> Result<BTreeSet<String>> {
        let ts = self.timestamp;
        self.branch
            .store()
            .with_read_lock(|s| s.changed_keys_at_commit_unlocked(ts, commit_timestamp, keyspace))
    }

    pub fn commit_timestamps_between(&self, lower: Timestamp, upper: Timestamp, order: Order) -> Result<Vec<Timestamp>> {
        check_range(lower, upper)?;
        let ts = self.timestamp;
        self.branch
            .store()
            .with_read_lock(|s| s.commit_timestamps_between_unlocked(ts, lower, upper, order))
    }

    /// The payload passed to [`commit_with_metadata`](Self::commit_with_metadata)
    /// for the commit at `commit_timestamp`.
    pub fn commit_metadata(&self, commit_timestamp: Timestamp) -> Result<Option<Value>> {
        let ts = self.timestamp;
        self.branch
            .store()
            .with_read_lock(|s| s.commit_metadata_unlocked(ts, commit_timestamp))
    }

    pub fn commit_metadata_between(
        &self,
        lower: Timestamp,
        upper: Timestamp,
        order: Order,
    ) -> Result<Vec<(Timestamp, Option<Value>)>> {
        check_range(lower, upper)?;
        let ts = self.timestamp;
        self.branch
            .store()
            .with_read_lock(|s| s.commit_metadata_between_unlocked(ts, lower, upper, order))
    }

    pub fn count_commits_between(&self, lower: Timestamp, upper: Timestamp) -> Result<usize> {
        Ok(self.commit_timestamps_between(lower, upper, Order::Ascending)?.len())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.is_incremental_commit_in_progress() {
            return;
        }
        warn!(branch = %self.branch.name(), tx = %self.id, "dropping transaction with an open incremental commit, rolling back");
        if let Err(err) = self.branch.store().rollback_incremental(self.id) {
            warn!(branch = %self.branch.name(), tx = %self.id, error = %err, "incremental rollback on drop failed");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("branch", &self.branch.name())
            .field("timestamp", &self.timestamp)
            .field("pending", &self.changes.len())
            .finish()
    }
}
