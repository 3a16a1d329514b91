//! The commit protocol: full commits, incremental commits and the rollback
//! transition shared by failed commits and crash recovery.
//!
//! Lock order is database read lock, branch write lock, commit mutex. The
//! incremental state mutex is only held for check-and-set.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, warn};

use super::{IncrementalState, TemporalKeyValueStore};
use crate::change_set::ChangeSet;
use crate::conflict::{AtomicConflict, CommonAncestor};
use crate::error::{Result, VersoError};
use crate::observer::{CommitEvent, CommitPhase};
use crate::types::{ChronoIdentifier, CommitMetadata, QualifiedKey, Timestamp, TxId, WalToken};

/// What a transaction hands to its store on commit.
pub(crate) struct CommitRequest<'a> {
    pub(crate) tx: TxId,
    pub(crate) tx_timestamp: Timestamp,
    pub(crate) changes: &'a BTreeMap<QualifiedKey, Option<Value>>,
    pub(crate) metadata: Option<Value>,
}

impl TemporalKeyValueStore {
    /// Commit `request`. Returns `Ok(None)` when there was nothing to commit.
    pub(crate) fn commit(&self, request: CommitRequest<'_>) -> Result<Option<Timestamp>> {
        let _db = self.shared.db_lock.read();
        self.ensure_alive()?;
        let _branch = self.branch_lock.write();
        let _commit = self.commit_lock.lock();

        let state = *self.incremental.lock();
        let reserved = match state.owner {
            Some(owner) if owner != request.tx => {
                return Err(VersoError::CommitRejected(format!(
                    "an incremental commit owned by {owner} is in progress on branch '{}'",
                    self.branch
                )));
            }
            Some(_) => {
                if !request.changes.is_empty() {
                    self.incremental_step_locked(request.tx_timestamp, state, request.changes)?;
                }
                Some(state)
            }
            None if request.changes.is_empty() => return Ok(None),
            None => None,
        };

        let folded = BTreeMap::new();
        let changes = if reserved.is_some() { &folded } else { request.changes };
        self.commit_locked(&request, changes, reserved).map(Some)
    }

    fn commit_locked(
        &self,
        request: &CommitRequest<'_>,
        changes: &BTreeMap<QualifiedKey, Option<Value>>,
        reserved: Option<IncrementalState>,
    ) -> Result<Timestamp> {
        let config = &self.shared.config;
        if reserved.is_none() {
            self.recover_stale_wal_locked()?;
        }
        let now = self.now_unlocked()?;
        let (timestamp, now_before) = match reserved {
            Some(state) => (state.timestamp, state.now_before),
            None => (self.shared.clock.next_after(now), now),
        };

        let mut process = CommitProcess::new(self, timestamp, now_before, false);
        let mut touched: Option<BTreeSet<QualifiedKey>> = None;
        let outcome = (|| -> Result<usize> {
            process.enter(CommitPhase::LockAcquired)?;
            process.enter(CommitPhase::TimestampAssigned)?;

            if let Some(filter) = &config.commit_metadata_filter {
                if !filter.accepts(&self.branch, timestamp, request.metadata.as_ref()) {
                    return Err(VersoError::CommitRejected(format!(
                        "commit metadata filter rejected commit at {timestamp} on branch '{}'",
                        self.branch
                    )));
                }
            }
            process.enter(CommitPhase::MetadataFiltered)?;

            let read_at = if reserved.is_some() { timestamp } else { now };
            let change_set =
                self.analyze(changes, request.tx_timestamp, timestamp, read_at, reserved.is_none())?;
            touched = Some(change_set.keys());
            process.enter(CommitPhase::ChangeSetAnalyzed)?;

            if reserved.is_none() {
                self.storage.write_wal_token(&WalToken {
                    branch: self.branch.clone(),
                    now_before_commit: now_before,
                    commit_timestamp: timestamp,
                })?;
            }
            process.apply(&change_set, request.metadata.as_ref())?;
            Ok(change_set.len())
        })();

        let applied = match outcome {
            Ok(applied) => applied,
            // nothing was written yet, the caller may retry as is
            Err(err) if !process.phase.requires_rollback() => return Err(err),
            Err(err) => {
                let keys = if reserved.is_some() {
                    // earlier incremental steps may have indexed other keys
                    process.index_touched = true;
                    None
                } else {
                    touched
                };
                process.roll_back(keys.as_ref());
                if reserved.is_some() {
                    self.forget_incremental();
                }
                self.clear_wal_after_failure();
                return Err(VersoError::CommitFailed {
                    branch: self.branch.clone(),
                    source: Box::new(err),
                });
            }
        };

        self.storage.clear_wal_token()?;
        if reserved.is_some() {
            *self.incremental.lock() = IncrementalState::default();
        }
        self.invalidate_head_statistics();
        process.notify(CommitPhase::WalCleared);
        debug!(
            branch = %self.branch,
            timestamp,
            changes = applied,
            incremental = reserved.is_some(),
            "commit applied"
        );
        Ok(timestamp)
    }

    /// Apply one step of the incremental commit owned by `tx`, reserving the
    /// commit timestamp on the first step.
    pub(crate) fn commit_incremental(
        &self,
        tx: TxId,
        tx_timestamp: Timestamp,
        changes: &BTreeMap<QualifiedKey, Option<Value>>,
    ) -> Result<Timestamp> {
        let _db = self.shared.db_lock.read();
        self.ensure_alive()?;
        let _branch = self.branch_lock.write();
        let _commit = self.commit_lock.lock();

        let current = *self.incremental.lock();
        let state = match current.owner {
            Some(owner) if owner != tx => {
                return Err(VersoError::CommitRejected(format!(
                    "an incremental commit owned by {owner} is in progress on branch '{}'",
                    self.branch
                )));
            }
            Some(_) => current,
            None => {
                self.recover_stale_wal_locked()?;
                let now = self.now_unlocked()?;
                let reserved = IncrementalState {
                    owner: Some(tx),
                    timestamp: self.shared.clock.next_after(now),
                    now_before: now,
                };
                *self.incremental.lock() = reserved;

                let started = self.storage.write_wal_token(&WalToken {
                    branch: self.branch.clone(),
                    now_before_commit: reserved.now_before,
                    commit_timestamp: reserved.timestamp,
                });
                if let Err(err) = started {
                    self.forget_incremental();
                    return Err(err);
                }
                debug!(branch = %self.branch, timestamp = reserved.timestamp, %tx, "incremental commit started");
                reserved
            }
        };

        self.incremental_step_locked(tx_timestamp, state, changes)?;
        Ok(state.timestamp)
    }

    /// Requires the branch write lock and the commit mutex.
    fn incremental_step_locked(
        &self,
        tx_timestamp: Timestamp,
        state: IncrementalState,
        changes: &BTreeMap<QualifiedKey, Option<Value>>,
    ) -> Result<()> {
        let mut process = CommitProcess::new(self, state.timestamp, state.now_before, true);
        let outcome = (|| {
            process.enter(CommitPhase::LockAcquired)?;
            process.enter(CommitPhase::TimestampAssigned)?;
            let change_set = self.analyze(changes, tx_timestamp, state.timestamp, state.timestamp, false)?;
            process.enter(CommitPhase::ChangeSetAnalyzed)?;
            process.apply(&change_set, None)
        })();

        if let Err(err) = outcome {
            process.index_touched = true;
            process.roll_back(None);
            self.forget_incremental();
            self.clear_wal_after_failure();
            return Err(VersoError::CommitFailed {
                branch: self.branch.clone(),
                source: Box::new(err),
            });
        }
        Ok(())
    }

    /// Undo every step of the incremental commit owned by `tx`.
    pub(crate) fn rollback_incremental(&self, tx: TxId) -> Result<()> {
        let _db = self.shared.db_lock.read();
        self.ensure_alive()?;
        let _branch = self.branch_lock.write();
        let _commit = self.commit_lock.lock();

        let state = *self.incremental.lock();
        if state.owner != Some(tx) {
            return Err(VersoError::TransactionState(format!(
                "{tx} has no incremental commit in progress on branch '{}'",
                self.branch
            )));
        }
        let rolled_back = self.rollback_to_locked(state.now_before, true, None);
        self.forget_incremental();
        rolled_back?;
        self.storage.clear_wal_token()?;
        debug!(branch = %self.branch, %tx, "incremental commit rolled back");
        Ok(())
    }

    pub(crate) fn owns_incremental(&self, tx: TxId) -> bool {
        self.incremental.lock().owner == Some(tx)
    }

    /// Reset the incremental state. Cached reads may have seen the reserved
    /// timestamp, so the whole cache goes.
    fn forget_incremental(&self) {
        *self.incremental.lock() = IncrementalState::default();
        if let Some(cache) = &self.shared.config.cache {
            cache.clear();
        }
    }

    fn clear_wal_after_failure(&self) {
        if let Err(err) = self.storage.clear_wal_token() {
            warn!(branch = %self.branch, error = %err, "failed to clear WAL token after rollback");
        }
    }

    /// Diff pending writes against the state visible at `read_at`.
    fn analyze(
        &self,
        changes: &BTreeMap<QualifiedKey, Option<Value>>,
        tx_timestamp: Timestamp,
        commit_timestamp: Timestamp,
        read_at: Timestamp,
        detect_conflicts: bool,
    ) -> Result<ChangeSet> {
        let config = &self.shared.config;
        // nothing can have been committed since the transaction started
        let detect_conflicts = detect_conflicts && tx_timestamp != read_at;
        let mut change_set = ChangeSet::default();

        for (key, pending) in changes {
            let current = self.get_unlocked(read_at, key)?;
            let mut value = pending.clone();

            if detect_conflicts && current.is_hit() && current.period().lower() > tx_timestamp {
                let conflict = AtomicConflict::new(
                    tx_timestamp,
                    (
                        ChronoIdentifier::new(self.branch.clone(), commit_timestamp, key.clone()),
                        pending.clone(),
                    ),
                    (
                        ChronoIdentifier::new(self.branch.clone(), current.period().lower(), key.clone()),
                        current.value().cloned(),
                    ),
                    Box::new(move || self.common_ancestor(tx_timestamp, key)),
                );
                value = config.conflict_resolution.resolve(&conflict)?;
                if value.as_ref() == current.value() {
                    debug!(branch = %self.branch, key = %key, "conflict resolved to committed value");
                    continue;
                }
            }

            if config.duplicate_version_elimination && value.as_ref() == current.value() {
                continue;
            }
            change_set.add(
                ChronoIdentifier::new(self.branch.clone(), commit_timestamp, key.clone()),
                current.into_value(),
                value,
            );
        }
        Ok(change_set)
    }

    fn common_ancestor(&self, timestamp: Timestamp, key: &QualifiedKey) -> Result<Option<CommonAncestor>> {
        let result = self.get_unlocked(timestamp, key)?;
        let lower = result.period().lower();
        Ok(result.into_value().map(|value| CommonAncestor {
            id: ChronoIdentifier::new(self.branch.clone(), lower, key.clone()),
            value: Some(value),
        }))
    }

    /// Discard everything after `timestamp` in matrices, commit metadata,
    /// cache and (when touched) the secondary index, and reset now. Matrices
    /// created after `timestamp` are dropped altogether.
    fn rollback_to_locked(
        &self,
        timestamp: Timestamp,
        index_touched: bool,
        keys: Option<&BTreeSet<QualifiedKey>>,
    ) -> Result<()> {
        let config = &self.shared.config;
        let mut discarded = 0;
        for matrix in self.all_matrices() {
            discarded += matrix.rollback(timestamp)?;
            if matrix.creation_timestamp() > timestamp {
                self.storage.drop_matrix(matrix.keyspace())?;
                self.matrices.write().remove(matrix.keyspace());
                debug!(branch = %self.branch, keyspace = matrix.keyspace(), "dropped matrix");
            }
        }
        self.storage.commit_metadata().rollback(timestamp)?;
        self.storage.set_now(timestamp)?;
        if let Some(cache) = &config.cache {
            cache.rollback_to_timestamp(timestamp);
        }
        if index_touched {
            if let Some(index) = &config.secondary_index {
                index.rollback(&self.branch, timestamp, keys)?;
            }
        }
        self.invalidate_head_statistics();
        warn!(branch = %self.branch, timestamp, discarded, "rolled back branch");
        Ok(())
    }

    /// Requires the branch write lock and the commit mutex.
    fn recover_stale_wal_locked(&self) -> Result<()> {
        if let Some(token) = self.storage.read_wal_token()? {
            warn!(
                branch = %self.branch,
                now_before = token.now_before_commit,
                interrupted = token.commit_timestamp,
                "found WAL token of an interrupted commit, recovering"
            );
            // the interrupted commit may have created matrices this store never loaded
            self.reload_matrices()?;
            self.rollback_to_locked(token.now_before_commit, true, None)?;
            self.storage.clear_wal_token()?;
        }
        Ok(())
    }

    pub(super) fn recover_on_open(&self) -> Result<()> {
        let _branch = self.branch_lock.write();
        let _commit = self.commit_lock.lock();
        self.recover_stale_wal_locked()
    }
}

/// One in-flight commit attempt, advancing through [`CommitPhase`]s.
struct CommitProcess<'s> {
    store: &'s TemporalKeyValueStore,
    timestamp: Timestamp,
    now_before: Timestamp,
    incremental: bool,
    /// Last phase entered. A failure from here on is judged by
    /// [`CommitPhase::requires_rollback`].
    phase: CommitPhase,
    index_touched: bool,
}

impl<'s> CommitProcess<'s> {
    fn new(store: &'s TemporalKeyValueStore, timestamp: Timestamp, now_before: Timestamp, incremental: bool) -> Self {
        Self {
            store,
            timestamp,
            now_before,
            incremental,
            phase: CommitPhase::LockAcquired,
            index_touched: false,
        }
    }

    fn enter(&mut self, phase: CommitPhase) -> Result<()> {
        self.phase = phase;
        match &self.store.shared.config.observer {
            Some(observer) => observer.on_phase(&CommitEvent {
                branch: &self.store.branch,
                timestamp: self.timestamp,
                phase,
                incremental: self.incremental,
            }),
            None => Ok(()),
        }
    }

    /// Report a phase whose outcome can no longer change the commit.
    fn notify(&mut self, phase: CommitPhase) {
        if let Err(err) = self.enter(phase) {
            warn!(branch = %self.store.branch, ?phase, error = %err, "commit observer failed");
        }
    }

    /// Everything from the WAL being in place up to advancing now. A step
    /// of an incremental commit stops short of metadata and now.
    fn apply(&mut self, change_set: &ChangeSet, metadata: Option<&Value>) -> Result<()> {
        let store = self.store;
        let config = &store.shared.config;
        self.enter(CommitPhase::WalWritten)?;

        for (keyspace, entries) in change_set.matrix_entries(config.codec.as_ref(), self.timestamp)? {
            store
                .get_or_create_matrix(&keyspace, self.timestamp)?
                .insert_entries(&entries, false)?;
        }
        self.enter(CommitPhase::PrimaryIndexUpdated)?;

        if let Some(index) = &config.secondary_index {
            if !change_set.is_empty() {
                self.index_touched = true;
                index.index(change_set.index_entries())?;
            }
        }
        self.enter(CommitPhase::SecondaryIndexUpdated)?;

        if !self.incremental {
            let record = serde_json::to_vec(&CommitMetadata::user(metadata.cloned()))?;
            store.storage.commit_metadata().put(self.timestamp, &record)?;
            self.enter(CommitPhase::MetadataStored)?;
        }

        if let Some(cache) = &config.cache {
            cache.write_through(&store.branch, self.timestamp, change_set.entries());
        }
        self.enter(CommitPhase::CacheUpdated)?;

        if !self.incremental {
            store.storage.set_now(self.timestamp)?;
            self.enter(CommitPhase::NowAdvanced)?;
        }
        Ok(())
    }

    fn roll_back(&mut self, keys: Option<&BTreeSet<QualifiedKey>>) {
        if let Err(err) = self.store.rollback_to_locked(self.now_before, self.index_touched, keys) {
            warn!(branch = %self.store.branch, error = %err, "rollback after failed commit did not complete");
        }
        self.notify(CommitPhase::RolledBack);
    }
}
