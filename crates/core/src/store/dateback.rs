//! Dateback: editing history that has already been committed.
//!
//! A dateback session holds the database write lock for its whole duration
//! and bypasses conflict detection. Each operation is applied as soon as it
//! is called; if a later operation fails, earlier ones stay applied. Once
//! the session ends the value cache is cleared and the index query cache is
//! dropped, and the returned [`DatebackReport`] tells the host what to
//! re-index.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use super::TemporalKeyValueStore;
use crate::codec::{decode_entry, encode_entry};
use crate::error::{Result, VersoError};
use crate::matrix::TemporalDataMatrix;
use crate::types::{CommitMetadata, MatrixEntry, Order, QualifiedKey, Timestamp};

/// Outcome of a dateback transformation for one version.
#[derive(Debug, Clone, PartialEq)]
pub enum Rewrite {
    /// Keep the version as it is.
    Unchanged,
    /// Replace the version's value.
    Value(Value),
    /// Turn the version into a tombstone.
    Delete,
}

/// One applied dateback operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatebackOperation {
    PurgeEntry { key: QualifiedKey, timestamp: Timestamp },
    PurgeKey { key: QualifiedKey, removed: usize },
    PurgeCommit { timestamp: Timestamp },
    PurgeCommitsInRange { lower: Timestamp, upper: Timestamp, commits: Vec<Timestamp> },
    InjectEntries { timestamp: Timestamp, keys: BTreeSet<QualifiedKey> },
    TransformEntry { key: QualifiedKey, timestamp: Timestamp },
    TransformValuesOfKey { key: QualifiedKey, rewritten: usize },
    TransformValuesOfKeyspace { keyspace: String, rewritten: usize },
    TransformCommit { timestamp: Timestamp },
    UpdateCommitMetadata { timestamp: Timestamp },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatebackReport {
    pub operations: Vec<DatebackOperation>,
    /// Oldest timestamp whose state changed. Anything derived from history
    /// at or after it is stale.
    pub earliest_touched_timestamp: Option<Timestamp>,
}

impl DatebackReport {
    fn record(&mut self, operation: DatebackOperation, touched: Option<Timestamp>) {
        if let Some(ts) = touched {
            self.earliest_touched_timestamp = Some(match self.earliest_touched_timestamp {
                Some(current) => current.min(ts),
                None => ts,
            });
        }
        self.operations.push(operation);
    }
}

/// Handle passed to the closure of [`crate::Verso::dateback`].
pub struct Dateback<'a> {
    store: &'a TemporalKeyValueStore,
    now: Timestamp,
    report: DatebackReport,
}

impl TemporalKeyValueStore {
    pub(crate) fn dateback<F>(&self, f: F) -> Result<DatebackReport>
    where
        F: FnOnce(&mut Dateback<'_>) -> Result<()>,
    {
        let _db = self.shared.db_lock.write();
        self.ensure_alive()?;
        let _branch = self.branch_lock.write();
        let _commit = self.commit_lock.lock();

        if let Some(owner) = self.incremental.lock().owner {
            return Err(VersoError::Dateback(format!(
                "an incremental commit owned by {owner} is in progress on branch '{}'",
                self.branch
            )));
        }

        let mut session = Dateback {
            store: self,
            now: self.now_unlocked()?,
            report: DatebackReport::default(),
        };
        let outcome = f(&mut session);

        if let Some(cache) = &self.shared.config.cache {
            cache.clear();
        }
        if let Some(index) = &self.shared.config.secondary_index {
            index.clear_query_cache();
        }
        self.invalidate_head_statistics();
        info!(
            branch = %self.branch,
            operations = session.report.operations.len(),
            earliest = ?session.report.earliest_touched_timestamp,
            failed = outcome.is_err(),
            "dateback finished"
        );

        outcome.map(|()| session.report)
    }
}

impl<'a> Dateback<'a> {
    pub fn branch_name(&self) -> &str {
        self.store.branch_name()
    }

    /// The branch's now when the session started.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Applied so far.
    pub fn report(&self) -> &DatebackReport {
        &self.report
    }

    fn check_timestamp(&self, timestamp: Timestamp) -> Result<()> {
        let lower_ok = match self.store.origin {
            Some(_) => timestamp > self.store.branching_timestamp,
            None => true,
        };
        if !lower_ok || timestamp > self.now {
            return Err(VersoError::Dateback(format!(
                "timestamp {timestamp} is outside the editable range of branch '{}' (branched at {}, now {})",
                self.store.branch, self.store.branching_timestamp, self.now
            )));
        }
        Ok(())
    }

    fn existing_matrix(&self, keyspace: &str) -> Result<Arc<dyn TemporalDataMatrix>> {
        self.store.matrix(keyspace).ok_or_else(|| {
            VersoError::Dateback(format!(
                "keyspace '{keyspace}' does not exist on branch '{}'",
                self.store.branch
            ))
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Option<Value>> {
        decode_entry(self.store.shared.config.codec.as_ref(), bytes)
    }

    fn encode(&self, value: Option<&Value>) -> Result<Vec<u8>> {
        encode_entry(self.store.shared.config.codec.as_ref(), value)
    }

    /// Timestamps of every local version of `key`, ascending. A key with
    /// no local versions is a dateback error.
    fn local_history(&self, matrix: &dyn TemporalDataMatrix, key: &str) -> Result<Vec<Timestamp>> {
        let history = matrix.history(key, 0, Timestamp::MAX, Order::Ascending)?;
        if history.is_empty() {
            return Err(VersoError::Dateback(format!(
                "no version of {}->{key} on branch '{}'",
                matrix.keyspace(),
                self.store.branch
            )));
        }
        Ok(history)
    }

    /// The value stored exactly at `timestamp`, or `None` when there is no
    /// version at that timestamp.
    fn version_at(
        &self,
        matrix: &dyn TemporalDataMatrix,
        key: &str,
        timestamp: Timestamp,
    ) -> Result<Option<Option<Value>>> {
        let result = matrix.get(timestamp, key)?;
        if !result.is_hit() || result.period().lower() != timestamp {
            return Ok(None);
        }
        let bytes = result.into_value().unwrap_or_default();
        self.decode(&bytes).map(Some)
    }

    fn rewrite(&self, matrix: &dyn TemporalDataMatrix, key: &str, timestamp: Timestamp, rewrite: Rewrite) -> Result<bool> {
        let value = match rewrite {
            Rewrite::Unchanged => return Ok(false),
            Rewrite::Value(value) => Some(value),
            Rewrite::Delete => None,
        };
        let bytes = self.encode(value.as_ref())?;
        matrix.insert_entries(&[MatrixEntry::new(key, timestamp, bytes)], true)?;
        Ok(true)
    }

    /// Irrevocably delete the version of `keyspace->key` at `timestamp`.
    pub fn purge_entry(&mut self, keyspace: &str, key: &str, timestamp: Timestamp) -> Result<()> {
        self.check_timestamp(timestamp)?;
        let matrix = self.existing_matrix(keyspace)?;
        if matrix.purge_entries(&[(key.to_string(), timestamp)])? == 0 {
            return Err(VersoError::Dateback(format!(
                "no version of {keyspace}->{key} at {timestamp}"
            )));
        }
        self.report.record(
            DatebackOperation::PurgeEntry {
                key: QualifiedKey::new(keyspace, key),
                timestamp,
            },
            Some(timestamp),
        );
        Ok(())
    }

    /// Delete every local version of a key. Returns how many were removed.
    /// Fails when the branch holds no version of the key.
    pub fn purge_key(&mut self, keyspace: &str, key: &str) -> Result<usize> {
        self.purge_key_where(keyspace, key, |_, _| true)
    }

    /// Delete the local versions of a key for which `predicate` holds.
    pub fn purge_key_where(
        &mut self,
        keyspace: &str,
        key: &str,
        predicate: impl Fn(Timestamp, Option<&Value>) -> bool,
    ) -> Result<usize> {
        let matrix = self.existing_matrix(keyspace)?;
        let mut doomed = Vec::new();
        for timestamp in self.local_history(matrix.as_ref(), key)? {
            if let Some(value) = self.version_at(matrix.as_ref(), key, timestamp)? {
                if predicate(timestamp, value.as_ref()) {
                    doomed.push((key.to_string(), timestamp));
                }
            }
        }
        let earliest = doomed.first().map(|(_, ts)| *ts);
        let removed = matrix.purge_entries(&doomed)?;
        self.report.record(
            DatebackOperation::PurgeKey {
                key: QualifiedKey::new(keyspace, key),
                removed,
            },
            earliest,
        );
        Ok(removed)
    }

    /// Delete every version written by the commit at `timestamp` together
    /// with its metadata.
    pub fn purge_commit(&mut self, timestamp: Timestamp) -> Result<()> {
        self.check_timestamp(timestamp)?;
        let mut removed = 0;
        for matrix in self.store.all_matrices() {
            let doomed: Vec<(String, Timestamp)> = matrix
                .entries_at(timestamp)?
                .into_iter()
                .map(|e| (e.key, timestamp))
                .collect();
            removed += matrix.purge_entries(&doomed)?;
        }
        let had_metadata = self.store.storage.commit_metadata().purge(timestamp)?;
        if removed == 0 && !had_metadata {
            return Err(VersoError::Dateback(format!(
                "no commit at {timestamp} on branch '{}'",
                self.store.branch
            )));
        }
        self.report
            .record(DatebackOperation::PurgeCommit { timestamp }, Some(timestamp));
        Ok(())
    }

    /// Delete all commits within `[lower, upper]`. Returns their timestamps.
    /// `upper` is clamped to now, so `Timestamp::MAX` means "everything from
    /// `lower` on".
    pub fn purge_commits_in_range(&mut self, lower: Timestamp, upper: Timestamp) -> Result<Vec<Timestamp>> {
        if lower > upper {
            return Err(VersoError::InvalidArgument(format!(
                "lower bound {lower} exceeds upper bound {upper}"
            )));
        }
        self.check_timestamp(lower)?;
        let upper = upper.min(self.now);

        let metadata = self.store.storage.commit_metadata();
        let mut commits: BTreeSet<Timestamp> = metadata.timestamps_between(lower, upper)?.into_iter().collect();
        for matrix in self.store.all_matrices() {
            commits.extend(
                matrix
                    .purge_all_entries_in_time_range(lower, upper)?
                    .into_iter()
                    .map(|k| k.timestamp),
            );
        }
        for timestamp in &commits {
            metadata.purge(*timestamp)?;
        }
        let commits: Vec<Timestamp> = commits.into_iter().collect();
        let earliest = commits.first().copied();
        self.report.record(
            DatebackOperation::PurgeCommitsInRange {
                lower,
                upper,
                commits: commits.clone(),
            },
            earliest,
        );
        Ok(commits)
    }

    /// Write a single version into the past. `None` injects a tombstone.
    pub fn inject_entry(&mut self, keyspace: &str, key: &str, timestamp: Timestamp, value: Option<Value>) -> Result<()> {
        let mut entries = BTreeMap::new();
        entries.insert(QualifiedKey::new(keyspace, key), value);
        self.inject_entries(timestamp, entries, None)
    }

    /// Write several versions into the past at `timestamp`, overwriting any
    /// existing version there. Without `metadata`, a commit that did not
    /// exist yet is registered as internal.
    pub fn inject_entries(
        &mut self,
        timestamp: Timestamp,
        entries: BTreeMap<QualifiedKey, Option<Value>>,
        metadata: Option<Value>,
    ) -> Result<()> {
        self.check_timestamp(timestamp)?;
        if let Some(bad) = entries.keys().find(|k| k.keyspace.is_empty() || k.key.is_empty()) {
            return Err(VersoError::InvalidArgument(format!("empty keyspace or key in '{bad}'")));
        }

        let mut grouped: BTreeMap<&str, Vec<MatrixEntry>> = BTreeMap::new();
        for (key, value) in &entries {
            grouped
                .entry(key.keyspace.as_str())
                .or_default()
                .push(MatrixEntry::new(key.key.clone(), timestamp, self.encode(value.as_ref())?));
        }
        for (keyspace, batch) in grouped {
            self.store
                .get_or_create_matrix(keyspace, timestamp)?
                .insert_entries(&batch, true)?;
        }

        let store = self.store.storage.commit_metadata();
        match metadata {
            Some(payload) => store.put(timestamp, &serde_json::to_vec(&CommitMetadata::user(Some(payload)))?)?,
            None if store.get(timestamp)?.is_none() => {
                store.put(timestamp, &serde_json::to_vec(&CommitMetadata::internal())?)?
            }
            None => {}
        }

        self.report.record(
            DatebackOperation::InjectEntries {
                timestamp,
                keys: entries.into_keys().collect(),
            },
            Some(timestamp),
        );
        Ok(())
    }

    /// Rewrite the version of `keyspace->key` at exactly `timestamp`.
    pub fn transform_entry(
        &mut self,
        keyspace: &str,
        key: &str,
        timestamp: Timestamp,
        transform: impl FnOnce(Option<&Value>) -> Rewrite,
    ) -> Result<()> {
        self.check_timestamp(timestamp)?;
        let matrix = self.existing_matrix(keyspace)?;
        let current = self
            .version_at(matrix.as_ref(), key, timestamp)?
            .ok_or_else(|| VersoError::Dateback(format!("no version of {keyspace}->{key} at {timestamp}")))?;
        if self.rewrite(matrix.as_ref(), key, timestamp, transform(current.as_ref()))? {
            self.report.record(
                DatebackOperation::TransformEntry {
                    key: QualifiedKey::new(keyspace, key),
                    timestamp,
                },
                Some(timestamp),
            );
        }
        Ok(())
    }

    /// Rewrite every non-tombstone local version of a key. Returns how many
    /// versions changed.
    pub fn transform_values_of_key(
        &mut self,
        keyspace: &str,
        key: &str,
        transform: impl Fn(Timestamp, &Value) -> Rewrite,
    ) -> Result<usize> {
        let matrix = self.existing_matrix(keyspace)?;
        let mut rewritten = 0;
        let mut earliest = None;
        for timestamp in self.local_history(matrix.as_ref(), key)? {
            let Some(Some(value)) = self.version_at(matrix.as_ref(), key, timestamp)? else {
                continue;
            };
            if self.rewrite(matrix.as_ref(), key, timestamp, transform(timestamp, &value))? {
                rewritten += 1;
                earliest.get_or_insert(timestamp);
            }
        }
        self.report.record(
            DatebackOperation::TransformValuesOfKey {
                key: QualifiedKey::new(keyspace, key),
                rewritten,
            },
            earliest,
        );
        Ok(rewritten)
    }

    /// Rewrite every non-tombstone local version in a keyspace.
    pub fn transform_values_of_keyspace(
        &mut self,
        keyspace: &str,
        transform: impl Fn(&str, Timestamp, &Value) -> Rewrite,
    ) -> Result<usize> {
        let matrix = self.existing_matrix(keyspace)?;
        let mut rewritten = 0;
        let mut earliest: Option<Timestamp> = None;
        for version in matrix.modifications_between(0, Timestamp::MAX)? {
            let Some(Some(value)) = self.version_at(matrix.as_ref(), &version.key, version.timestamp)? else {
                continue;
            };
            let rewrite = transform(&version.key, version.timestamp, &value);
            if self.rewrite(matrix.as_ref(), &version.key, version.timestamp, rewrite)? {
                rewritten += 1;
                earliest = Some(earliest.map_or(version.timestamp, |e| e.min(version.timestamp)));
            }
        }
        self.report.record(
            DatebackOperation::TransformValuesOfKeyspace {
                keyspace: keyspace.to_string(),
                rewritten,
            },
            earliest,
        );
        Ok(rewritten)
    }

    /// Replace the full key/value set of the commit at `timestamp` with what
    /// `transform` returns. Keys it drops are purged, keys it adds are
    /// injected and changed values are overwritten.
    pub fn transform_commit(
        &mut self,
        timestamp: Timestamp,
        transform: impl FnOnce(BTreeMap<QualifiedKey, Option<Value>>) -> BTreeMap<QualifiedKey, Option<Value>>,
    ) -> Result<()> {
        self.check_timestamp(timestamp)?;
        let mut before = BTreeMap::new();
        for matrix in self.store.all_matrices() {
            for entry in matrix.entries_at(timestamp)? {
                let value = self.decode(&entry.value)?;
                before.insert(QualifiedKey::new(matrix.keyspace(), entry.key), value);
            }
        }
        if before.is_empty() && self.store.storage.commit_metadata().get(timestamp)?.is_none() {
            return Err(VersoError::Dateback(format!(
                "no commit at {timestamp} on branch '{}'",
                self.store.branch
            )));
        }

        let after = transform(before.clone());
        for key in before.keys().filter(|k| !after.contains_key(*k)) {
            if let Some(matrix) = self.store.matrix(&key.keyspace) {
                matrix.purge_entries(&[(key.key.clone(), timestamp)])?;
            }
        }
        for (key, value) in &after {
            if before.get(key) == Some(value) {
                continue;
            }
            let bytes = self.encode(value.as_ref())?;
            self.store
                .get_or_create_matrix(&key.keyspace, timestamp)?
                .insert_entries(&[MatrixEntry::new(key.key.clone(), timestamp, bytes)], true)?;
        }

        self.report
            .record(DatebackOperation::TransformCommit { timestamp }, Some(timestamp));
        Ok(())
    }

    /// Replace the user payload of an existing commit.
    pub fn update_commit_metadata(&mut self, timestamp: Timestamp, payload: Option<Value>) -> Result<()> {
        self.check_timestamp(timestamp)?;
        let store = self.store.storage.commit_metadata();
        let bytes = store.get(timestamp)?.ok_or_else(|| {
            VersoError::Dateback(format!(
                "no commit at {timestamp} on branch '{}'",
                self.store.branch
            ))
        })?;
        let mut record: CommitMetadata = serde_json::from_slice(&bytes)?;
        record.payload = payload;
        store.put(timestamp, &serde_json::to_vec(&record)?)?;
        self.report
            .record(DatebackOperation::UpdateCommitMetadata { timestamp }, None);
        Ok(())
    }
}
