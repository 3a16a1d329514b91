//! The per-branch temporal key-value store.
//!
//! Reads consult the branch's own matrices and fall back to the origin
//! branch's store for anything at or before the branching timestamp. The
//! commit protocol lives in [`commit`], history rewriting in [`dateback`].
//!
//! Locking is layered. Public entry points take the database read lock and
//! then this branch's lock; the `*_unlocked` methods assume the caller holds
//! them. Delegation to an origin store only takes the origin's branch lock,
//! since the database lock is already held.

pub(crate) mod commit;
pub(crate) mod dateback;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use crate::backend::BranchStorage;
use crate::codec::decode_entry;
use crate::database::Shared;
use crate::error::{Result, VersoError};
use crate::matrix::TemporalDataMatrix;
use crate::types::{
    BranchHeadStatistics, CommitMetadata, GetResult, Order, Period, QualifiedKey, TemporalKey,
    Timestamp, TxId,
};

/// Owner, reserved timestamp and pre-commit now of an open incremental commit.
#[derive(Debug, Clone, Copy, Default)]
struct IncrementalState {
    owner: Option<TxId>,
    timestamp: Timestamp,
    now_before: Timestamp,
}

pub(crate) struct TemporalKeyValueStore {
    branch: String,
    origin: Option<Arc<TemporalKeyValueStore>>,
    branching_timestamp: Timestamp,
    storage: Arc<dyn BranchStorage>,
    shared: Arc<Shared>,
    matrices: RwLock<HashMap<String, Arc<dyn TemporalDataMatrix>>>,
    branch_lock: RwLock<()>,
    commit_lock: Mutex<()>,
    incremental: Mutex<IncrementalState>,
    head_statistics: Mutex<Option<BranchHeadStatistics>>,
    deleted: AtomicBool,
}

impl TemporalKeyValueStore {
    /// Load the branch's matrices and repair an interrupted commit, if any.
    pub(crate) fn open(
        branch: impl Into<String>,
        origin: Option<Arc<TemporalKeyValueStore>>,
        branching_timestamp: Timestamp,
        storage: Arc<dyn BranchStorage>,
        shared: Arc<Shared>,
    ) -> Result<Self> {
        let branch = branch.into();
        let matrices = storage
            .load_matrices()?
            .into_iter()
            .map(|m| (m.keyspace().to_string(), m))
            .collect::<HashMap<_, _>>();
        debug!(branch = %branch, keyspaces = matrices.len(), "opened branch store");

        let store = Self {
            branch,
            origin,
            branching_timestamp,
            storage,
            shared,
            matrices: RwLock::new(matrices),
            branch_lock: RwLock::new(()),
            commit_lock: Mutex::new(()),
            incremental: Mutex::new(IncrementalState::default()),
            head_statistics: Mutex::new(None),
            deleted: AtomicBool::new(false),
        };
        store.recover_on_open()?;
        Ok(store)
    }

    pub(crate) fn branch_name(&self) -> &str {
        &self.branch
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(VersoError::BranchDeleted(self.branch.clone()));
        }
        Ok(())
    }

    /// Run `f` under the database read lock and this branch's read lock.
    pub(crate) fn with_read_lock<R>(&self, f: impl FnOnce(&Self) -> Result<R>) -> Result<R> {
        let _db = self.shared.db_lock.read();
        self.ensure_alive()?;
        let _branch = self.branch_lock.read();
        f(self)
    }

    /// Run `f` under this branch's read lock only. Used when a child branch
    /// delegates a read, at which point the database lock is already held.
    fn with_branch_read_lock<R>(&self, f: impl FnOnce(&Self) -> Result<R>) -> Result<R> {
        let _branch = self.branch_lock.read();
        f(self)
    }

    fn matrix(&self, keyspace: &str) -> Option<Arc<dyn TemporalDataMatrix>> {
        self.matrices.read().get(keyspace).cloned()
    }

    fn all_matrices(&self) -> Vec<Arc<dyn TemporalDataMatrix>> {
        self.matrices.read().values().cloned().collect()
    }

    /// Pick up matrices created in storage behind this store's back.
    /// Requires the branch write lock.
    fn reload_matrices(&self) -> Result<()> {
        let stored = self.storage.load_matrices()?;
        let mut matrices = self.matrices.write();
        for matrix in stored {
            matrices
                .entry(matrix.keyspace().to_string())
                .or_insert(matrix);
        }
        Ok(())
    }

    /// Requires the branch write lock.
    fn get_or_create_matrix(&self, keyspace: &str, timestamp: Timestamp) -> Result<Arc<dyn TemporalDataMatrix>> {
        if let Some(matrix) = self.matrix(keyspace) {
            return Ok(matrix);
        }
        let matrix = self.storage.create_matrix(keyspace, timestamp)?;
        debug!(branch = %self.branch, keyspace, timestamp, "created matrix");
        self.matrices
            .write()
            .insert(keyspace.to_string(), Arc::clone(&matrix));
        Ok(matrix)
    }

    /// The latest commit timestamp, never earlier than the branching timestamp.
    pub(crate) fn now_unlocked(&self) -> Result<Timestamp> {
        Ok(self.storage.now()?.max(self.branching_timestamp))
    }

    pub(crate) fn now(&self) -> Result<Timestamp> {
        self.with_read_lock(|s| s.now_unlocked())
    }

    /// The origin store together with the clamped timestamp a read at
    /// `timestamp` is delegated with.
    fn delegate(&self, timestamp: Timestamp) -> Option<(&TemporalKeyValueStore, Timestamp)> {
        self.origin
            .as_deref()
            .map(|origin| (origin, timestamp.min(self.branching_timestamp)))
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    pub(crate) fn get_unlocked(&self, timestamp: Timestamp, key: &QualifiedKey) -> Result<GetResult<Value>> {
        let cache = self.shared.config.cache.as_deref();
        if let Some(cached) = cache.and_then(|c| c.get(&self.branch, timestamp, key)) {
            return Ok(cached);
        }
        let result = self.get_uncached(timestamp, key)?;
        if let Some(cache) = cache {
            cache.cache(&self.branch, key, &result);
        }
        Ok(result)
    }

    fn get_uncached(&self, timestamp: Timestamp, key: &QualifiedKey) -> Result<GetResult<Value>> {
        let codec = self.shared.config.codec.as_ref();
        let local = match self.matrix(&key.keyspace) {
            Some(matrix) => matrix
                .get(timestamp, &key.key)?
                .try_map(|bytes| decode_entry(codec, &bytes))?,
            None => GetResult::miss(Period::eternal()),
        };
        if local.is_hit() {
            return Ok(local);
        }
        let Some((origin, origin_timestamp)) = self.delegate(timestamp) else {
            return Ok(local);
        };
        let inherited = origin.with_branch_read_lock(|o| o.get_unlocked(origin_timestamp, key))?;
        // Origin changes after the branching timestamp are invisible here, so
        // an inherited value holds until the first local write.
        let period = inherited.period();
        let upper = if period.upper() > self.branching_timestamp {
            local.period().upper()
        } else {
            period.upper()
        };
        Ok(inherited.with_period(period.with_upper(upper)))
    }

    pub(crate) fn key_set_unlocked(&self, timestamp: Timestamp, keyspace: &str) -> Result<BTreeSet<String>> {
        let mut keys = match self.delegate(timestamp) {
            Some((origin, ts)) => origin.with_branch_read_lock(|o| o.key_set_unlocked(ts, keyspace))?,
            None => BTreeSet::new(),
        };
        if let Some(matrix) = self.matrix(keyspace) {
            matrix.key_set_modifications(timestamp)?.apply_to(&mut keys);
        }
        Ok(keys)
    }

    pub(crate) fn keyspaces_unlocked(&self, timestamp: Timestamp) -> Result<BTreeSet<String>> {
        let mut keyspaces = match self.delegate(timestamp) {
            Some((origin, ts)) => origin.with_branch_read_lock(|o| o.keyspaces_unlocked(ts))?,
            None => BTreeSet::new(),
        };
        keyspaces.extend(
            self.all_matrices()
                .iter()
                .filter(|m| m.creation_timestamp() <= timestamp)
                .map(|m| m.keyspace().to_string()),
        );
        Ok(keyspaces)
    }

    /// Version timestamps of `key` within `[lower, min(upper, timestamp)]`.
    pub(crate) fn history_unlocked(
        &self,
        timestamp: Timestamp,
        key: &QualifiedKey,
        lower: Timestamp,
        upper: Timestamp,
        order: Order,
    ) -> Result<Vec<Timestamp>> {
        let upper = upper.min(timestamp);
        if lower > upper {
            return Ok(Vec::new());
        }
        let local = match self.matrix(&key.keyspace) {
            Some(matrix) => matrix.history(&key.key, lower, upper, order)?,
            None => Vec::new(),
        };
        let inherited = match self.delegate(upper) {
            Some((origin, ts)) if lower <= ts => {
                origin.with_branch_read_lock(|o| o.history_unlocked(ts, key, lower, ts, order))?
            }
            _ => Vec::new(),
        };
        Ok(concat_ordered(local, inherited, order))
    }

    pub(crate) fn last_modification_timestamp_unlocked(
        &self,
        timestamp: Timestamp,
        key: &QualifiedKey,
    ) -> Result<Option<Timestamp>> {
        let result = self.get_unlocked(timestamp, key)?;
        Ok(result.is_hit().then(|| result.period().lower()))
    }

    /// Every version in `keyspace` within `[lower, min(upper, timestamp)]`,
    /// ascending.
    pub(crate) fn modifications_between_unlocked(
        &self,
        timestamp: Timestamp,
        keyspace: &str,
        lower: Timestamp,
        upper: Timestamp,
    ) -> Result<Vec<TemporalKey>> {
        let upper = upper.min(timestamp);
        if lower > upper {
            return Ok(Vec::new());
        }
        let mut modifications = match self.delegate(upper) {
            Some((origin, ts)) if lower <= ts => origin
                .with_branch_read_lock(|o| o.modifications_between_unlocked(ts, keyspace, lower, ts))?,
            _ => Vec::new(),
        };
        if let Some(matrix) = self.matrix(keyspace) {
            modifications.extend(matrix.modifications_between(lower, upper)?);
        }
        Ok(modifications)
    }

    pub(crate) fn changed_keys_at_commit_unlocked(
        &self,
        timestamp: Timestamp,
        commit_timestamp: Timestamp,
        keyspace: &str,
    ) -> Result<BTreeSet<String>> {
        if commit_timestamp > timestamp {
            return Ok(BTreeSet::new());
        }
        if let Some((origin, ts)) = self.delegate(timestamp) {
            if commit_timestamp <= self.branching_timestamp {
                return origin.with_branch_read_lock(|o| {
                    o.changed_keys_at_commit_unlocked(ts, commit_timestamp, keyspace)
                });
            }
        }
        Ok(match self.matrix(keyspace) {
            Some(matrix) => matrix
                .entries_at(commit_timestamp)?
                .into_iter()
                .map(|e| e.key)
                .collect(),
            None => BTreeSet::new(),
        })
    }

    pub(crate) fn commit_timestamps_between_unlocked(
        &self,
        timestamp: Timestamp,
        lower: Timestamp,
        upper: Timestamp,
        order: Order,
    ) -> Result<Vec<Timestamp>> {
        let upper = upper.min(timestamp);
        if lower > upper {
            return Ok(Vec::new());
        }
        let mut local = self.storage.commit_metadata().timestamps_between(lower, upper)?;
        if order == Order::Descending {
            local.reverse();
        }
        let inherited = match self.delegate(upper) {
            Some((origin, ts)) if lower <= ts => origin
                .with_branch_read_lock(|o| o.commit_timestamps_between_unlocked(ts, lower, ts, order))?,
            _ => Vec::new(),
        };
        Ok(concat_ordered(local, inherited, order))
    }

    /// The user payload registered with the commit at `commit_timestamp`.
    pub(crate) fn commit_metadata_unlocked(
        &self,
        timestamp: Timestamp,
        commit_timestamp: Timestamp,
    ) -> Result<Option<Value>> {
        Ok(self
            .commit_record_unlocked(timestamp, commit_timestamp)?
            .and_then(|record| record.payload))
    }

    fn commit_record_unlocked(
        &self,
        timestamp: Timestamp,
        commit_timestamp: Timestamp,
    ) -> Result<Option<CommitMetadata>> {
        if commit_timestamp > timestamp {
            return Ok(None);
        }
        if let Some((origin, ts)) = self.delegate(timestamp) {
            if commit_timestamp <= self.branching_timestamp {
                return origin.with_branch_read_lock(|o| o.commit_record_unlocked(ts, commit_timestamp));
            }
        }
        self.storage
            .commit_metadata()
            .get(commit_timestamp)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(VersoError::from))
            .transpose()
    }

    pub(crate) fn commit_metadata_between_unlocked(
        &self,
        timestamp: Timestamp,
        lower: Timestamp,
        upper: Timestamp,
        order: Order,
    ) -> Result<Vec<(Timestamp, Option<Value>)>> {
        self.commit_timestamps_between_unlocked(timestamp, lower, upper, order)?
            .into_iter()
            .map(|ts| Ok((ts, self.commit_metadata_unlocked(timestamp, ts)?)))
            .collect()
    }

    pub(crate) fn head_statistics(&self) -> Result<BranchHeadStatistics> {
        self.with_read_lock(|s| {
            if let Some(cached) = *s.head_statistics.lock() {
                return Ok(cached);
            }
            let now = s.now_unlocked()?;
            let mut total_entries = 0;
            for matrix in s.all_matrices() {
                total_entries += matrix.entry_count()?;
            }
            let mut entries_in_head = 0;
            for keyspace in s.keyspaces_unlocked(now)? {
                entries_in_head += s.key_set_unlocked(now, &keyspace)?.len() as u64;
            }
            let statistics = BranchHeadStatistics {
                total_entries,
                entries_in_head,
            };
            *s.head_statistics.lock() = Some(statistics);
            Ok(statistics)
        })
    }

    fn invalidate_head_statistics(&self) {
        *self.head_statistics.lock() = None;
    }
}

/// Join local and inherited results so the whole sequence keeps `order`:
/// inherited versions are always older than local ones.
fn concat_ordered<T>(local: Vec<T>, inherited: Vec<T>, order: Order) -> Vec<T> {
    let (mut first, second) = match order {
        Order::Ascending => (inherited, local),
        Order::Descending => (local, inherited),
    };
    first.extend(second);
    first
}
