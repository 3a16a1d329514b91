use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{BranchMetadata, BranchStorage, CommitMetadataStore, StorageBackend};
use crate::error::Result;
use crate::matrix::{check_append_order, order_timestamps, point_in_time, TemporalDataMatrix};
use crate::types::{
    GetResult, KeySetModifications, MatrixEntry, Order, TemporalKey, Timestamp, WalToken,
};

/// Volatile backend keeping everything in ordered maps.
///
/// Branch storages live as long as the backend does, so a new database opened
/// on the same backend sees the previous instance's data. That makes it the
/// backend of choice for simulating restarts.
#[derive(Default)]
pub struct InMemoryBackend {
    branches: RwLock<BTreeMap<String, BranchMetadata>>,
    storages: Mutex<HashMap<String, Arc<InMemoryBranchStorage>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for InMemoryBackend {
    fn load_branches(&self) -> Result<Vec<BranchMetadata>> {
        Ok(self.branches.read().values().cloned().collect())
    }

    fn save_branch(&self, metadata: &BranchMetadata) -> Result<()> {
        self.branches
            .write()
            .insert(metadata.name.clone(), metadata.clone());
        Ok(())
    }

    fn delete_branch(&self, name: &str) -> Result<()> {
        self.branches.write().remove(name);
        self.storages.lock().remove(name);
        Ok(())
    }

    fn open_branch_storage(&self, branch: &str) -> Result<Arc<dyn BranchStorage>> {
        let storage = self
            .storages
            .lock()
            .entry(branch.to_string())
            .or_default()
            .clone();
        Ok(storage)
    }
}

#[derive(Default)]
struct InMemoryBranchStorage {
    matrices: RwLock<BTreeMap<String, Arc<InMemoryMatrix>>>,
    now: Mutex<Timestamp>,
    wal: Mutex<Option<WalToken>>,
    metadata: InMemoryCommitMetadata,
}

impl BranchStorage for InMemoryBranchStorage {
    fn create_matrix(
        &self,
        keyspace: &str,
        creation_timestamp: Timestamp,
    ) -> Result<Arc<dyn TemporalDataMatrix>> {
        let matrix = self
            .matrices
            .write()
            .entry(keyspace.to_string())
            .or_insert_with(|| Arc::new(InMemoryMatrix::new(keyspace, creation_timestamp)))
            .clone();
        Ok(matrix)
    }

    fn load_matrices(&self) -> Result<Vec<Arc<dyn TemporalDataMatrix>>> {
        Ok(self
            .matrices
            .read()
            .values()
            .map(|m| m.clone() as Arc<dyn TemporalDataMatrix>)
            .collect())
    }

    fn drop_matrix(&self, keyspace: &str) -> Result<()> {
        self.matrices.write().remove(keyspace);
        Ok(())
    }

    fn now(&self) -> Result<Timestamp> {
        Ok(*self.now.lock())
    }

    fn set_now(&self, timestamp: Timestamp) -> Result<()> {
        *self.now.lock() = timestamp;
        Ok(())
    }

    fn write_wal_token(&self, token: &WalToken) -> Result<()> {
        *self.wal.lock() = Some(token.clone());
        Ok(())
    }

    fn read_wal_token(&self) -> Result<Option<WalToken>> {
        Ok(self.wal.lock().clone())
    }

    fn clear_wal_token(&self) -> Result<()> {
        *self.wal.lock() = None;
        Ok(())
    }

    fn commit_metadata(&self) -> &dyn CommitMetadataStore {
        &self.metadata
    }
}

#[derive(Default)]
struct InMemoryCommitMetadata {
    entries: RwLock<BTreeMap<Timestamp, Vec<u8>>>,
}

impl CommitMetadataStore for InMemoryCommitMetadata {
    fn put(&self, timestamp: Timestamp, metadata: &[u8]) -> Result<()> {
        self.entries.write().insert(timestamp, metadata.to_vec());
        Ok(())
    }

    fn get(&self, timestamp: Timestamp) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(&timestamp).cloned())
    }

    fn timestamps_between(&self, lower: Timestamp, upper: Timestamp) -> Result<Vec<Timestamp>> {
        if lower > upper {
            return Ok(Vec::new());
        }
        Ok(self.entries.read().range(lower..=upper).map(|(t, _)| *t).collect())
    }

    fn rollback(&self, timestamp: Timestamp) -> Result<()> {
        self.entries.write().retain(|t, _| *t <= timestamp);
        Ok(())
    }

    fn purge(&self, timestamp: Timestamp) -> Result<bool> {
        Ok(self.entries.write().remove(&timestamp).is_some())
    }
}

/// [`TemporalDataMatrix`] over `key -> (timestamp -> bytes)` maps.
pub struct InMemoryMatrix {
    keyspace: String,
    creation_timestamp: Timestamp,
    versions: RwLock<BTreeMap<String, BTreeMap<Timestamp, Vec<u8>>>>,
}

impl InMemoryMatrix {
    pub fn new(keyspace: impl Into<String>, creation_timestamp: Timestamp) -> Self {
        Self {
            keyspace: keyspace.into(),
            creation_timestamp,
            versions: RwLock::new(BTreeMap::new()),
        }
    }
}

impl TemporalDataMatrix for InMemoryMatrix {
    fn keyspace(&self) -> &str {
        &self.keyspace
    }

    fn creation_timestamp(&self) -> Timestamp {
        self.creation_timestamp
    }

    fn get(&self, timestamp: Timestamp, key: &str) -> Result<GetResult<Vec<u8>>> {
        let versions = self.versions.read();
        let Some(history) = versions.get(key) else {
            return Ok(point_in_time(None, None));
        };
        let floor = history
            .range(..=timestamp)
            .next_back()
            .map(|(t, v)| (*t, v.clone()));
        let ceiling = history
            .range((Bound::Excluded(timestamp), Bound::Unbounded))
            .next()
            .map(|(t, _)| *t);
        Ok(point_in_time(floor, ceiling))
    }

    fn history(
        &self,
        key: &str,
        lower: Timestamp,
        upper: Timestamp,
        order: Order,
    ) -> Result<Vec<Timestamp>> {
        if lower > upper {
            return Ok(Vec::new());
        }
        let versions = self.versions.read();
        let stamps = versions
            .get(key)
            .map(|h| h.range(lower..=upper).map(|(t, _)| *t).collect())
            .unwrap_or_default();
        Ok(order_timestamps(stamps, order))
    }

    fn key_set_modifications(&self, timestamp: Timestamp) -> Result<KeySetModifications> {
        let versions = self.versions.read();
        let mut mods = KeySetModifications::default();
        for (key, history) in versions.iter() {
            if let Some((_, value)) = history.range(..=timestamp).next_back() {
                if value.is_empty() {
                    mods.removals.insert(key.clone());
                } else {
                    mods.additions.insert(key.clone());
                }
            }
        }
        Ok(mods)
    }

    fn modifications_between(&self, lower: Timestamp, upper: Timestamp) -> Result<Vec<TemporalKey>> {
        if lower > upper {
            return Ok(Vec::new());
        }
        let versions = self.versions.read();
        let mut out: Vec<TemporalKey> = versions
            .iter()
            .flat_map(|(key, history)| {
                history
                    .range(lower..=upper)
                    .map(move |(t, _)| TemporalKey::new(*t, self.keyspace.clone(), key.clone()))
            })
            .collect();
        out.sort();
        Ok(out)
    }

    fn entries_at(&self, timestamp: Timestamp) -> Result<Vec<MatrixEntry>> {
        let versions = self.versions.read();
        Ok(versions
            .iter()
            .filter_map(|(key, history)| {
                history
                    .get(&timestamp)
                    .map(|v| MatrixEntry::new(key.clone(), timestamp, v.clone()))
            })
            .collect())
    }

    fn insert_entries(&self, entries: &[MatrixEntry], force: bool) -> Result<()> {
        let mut versions = self.versions.write();
        if !force {
            for entry in entries {
                let latest = versions
                    .get(&entry.key)
                    .and_then(|h| h.keys().next_back().copied());
                check_append_order(&self.keyspace, latest, entry)?;
            }
        }
        for entry in entries {
            versions
                .entry(entry.key.clone())
                .or_default()
                .insert(entry.timestamp, entry.value.clone());
        }
        Ok(())
    }

    fn rollback(&self, timestamp: Timestamp) -> Result<usize> {
        let mut versions = self.versions.write();
        let mut removed = 0;
        for history in versions.values_mut() {
            let before = history.len();
            history.retain(|t, _| *t <= timestamp);
            removed += before - history.len();
        }
        versions.retain(|_, h| !h.is_empty());
        Ok(removed)
    }

    fn purge_entries(&self, entries: &[(String, Timestamp)]) -> Result<usize> {
        let mut versions = self.versions.write();
        let mut removed = 0;
        for (key, timestamp) in entries {
            if let Some(history) = versions.get_mut(key) {
                if history.remove(timestamp).is_some() {
                    removed += 1;
                }
                if history.is_empty() {
                    versions.remove(key);
                }
            }
        }
        Ok(removed)
    }

    fn purge_all_entries_in_time_range(
        &self,
        lower: Timestamp,
        upper: Timestamp,
    ) -> Result<Vec<TemporalKey>> {
        let purged = self.modifications_between(lower, upper)?;
        let targets: Vec<(String, Timestamp)> =
            purged.iter().map(|k| (k.key.clone(), k.timestamp)).collect();
        self.purge_entries(&targets)?;
        Ok(purged)
    }

    fn entry_count(&self) -> Result<u64> {
        Ok(self.versions.read().values().map(|h| h.len() as u64).sum())
    }
}
