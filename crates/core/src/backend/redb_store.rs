use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};

use super::{BranchMetadata, BranchStorage, CommitMetadataStore, StorageBackend};
use crate::error::{Result, VersoError};
use crate::matrix::{check_append_order, order_timestamps, point_in_time, TemporalDataMatrix};
use crate::types::{
    GetResult, KeySetModifications, MatrixEntry, Order, TemporalKey, Timestamp, WalToken,
};

// ---------------------------------------------------------------------------
// Table layout
// ---------------------------------------------------------------------------

/// branch name -> BranchMetadata (JSON)
const BRANCHES: TableDefinition<&str, &str> = TableDefinition::new("branches");

/// branch name -> stored now
const NOW: TableDefinition<&str, u64> = TableDefinition::new("now");

/// branch name -> pending WalToken (JSON)
const WAL: TableDefinition<&str, &str> = TableDefinition::new("wal");

/// (branch, commit timestamp) -> encoded CommitMetadata
const COMMIT_METADATA: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("commit_metadata");

/// (branch, keyspace) -> keyspace creation timestamp
const KEYSPACES: TableDefinition<(&str, &str), u64> = TableDefinition::new("keyspaces");

/// (branch, keyspace) -> number of stored versions
const ENTRY_COUNTS: TableDefinition<(&str, &str), u64> = TableDefinition::new("entry_counts");

/// (branch, keyspace, key, timestamp) -> value bytes, empty for tombstones
const MATRIX: TableDefinition<(&str, &str, &str, u64), &[u8]> = TableDefinition::new("matrix");

/// (branch, keyspace, timestamp, key), the matrix rows in commit order
const MATRIX_BY_TIME: TableDefinition<(&str, &str, u64, &str), ()> =
    TableDefinition::new("matrix_by_time");

type MatrixKey = (&'static str, &'static str, &'static str, u64);
type TimeKey = (&'static str, &'static str, u64, &'static str);

/// Durable backend storing every branch in a single redb database file.
///
/// All branches share the same tables with keys prefixed by the branch name,
/// so deleting a branch is a prefix removal in each table. Every matrix row
/// is written twice, once per key and once per timestamp, so that both
/// point-in-time reads and per-commit scans are range lookups.
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open or create a database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        Self::init(db)
    }

    /// A redb database backed by memory. Data is lost when the backend is dropped.
    pub fn in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(BRANCHES)?;
            write_txn.open_table(NOW)?;
            write_txn.open_table(WAL)?;
            write_txn.open_table(COMMIT_METADATA)?;
            write_txn.open_table(KEYSPACES)?;
            write_txn.open_table(ENTRY_COUNTS)?;
            write_txn.open_table(MATRIX)?;
            write_txn.open_table(MATRIX_BY_TIME)?;
            write_txn.commit()?;
        }
        Ok(Self { db: Arc::new(db) })
    }
}

impl StorageBackend for RedbBackend {
    fn load_branches(&self) -> Result<Vec<BranchMetadata>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BRANCHES)?;
        let mut branches = Vec::new();
        for entry in table.iter()? {
            let (_name, json) = entry?;
            branches.push(serde_json::from_str(json.value())?);
        }
        Ok(branches)
    }

    fn save_branch(&self, metadata: &BranchMetadata) -> Result<()> {
        let json = serde_json::to_string(metadata)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(BRANCHES)?;
            table.insert(metadata.name.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_branch(&self, name: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut branches = write_txn.open_table(BRANCHES)?;
            branches.remove(name)?;
            let mut now = write_txn.open_table(NOW)?;
            now.remove(name)?;
            let mut wal = write_txn.open_table(WAL)?;
            wal.remove(name)?;

            let mut metadata = write_txn.open_table(COMMIT_METADATA)?;
            let mut stamps = Vec::new();
            for entry in metadata.range((name, 0u64)..=(name, u64::MAX))? {
                let (key, _) = entry?;
                stamps.push(key.value().1);
            }
            for ts in stamps {
                metadata.remove((name, ts))?;
            }
        }
        let names = {
            let keyspaces = write_txn.open_table(KEYSPACES)?;
            let mut names = Vec::new();
            for entry in keyspaces.range((name, "")..)? {
                let (key, _) = entry?;
                let (branch, keyspace) = key.value();
                if branch != name {
                    break;
                }
                names.push(keyspace.to_string());
            }
            names
        };
        for keyspace in &names {
            remove_keyspace(&write_txn, name, keyspace)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn open_branch_storage(&self, branch: &str) -> Result<Arc<dyn BranchStorage>> {
        Ok(Arc::new(RedbBranchStorage {
            db: Arc::clone(&self.db),
            branch: branch.to_string(),
            metadata: RedbCommitMetadata {
                db: Arc::clone(&self.db),
                branch: branch.to_string(),
            },
        }))
    }
}

struct RedbBranchStorage {
    db: Arc<Database>,
    branch: String,
    metadata: RedbCommitMetadata,
}

impl RedbBranchStorage {
    fn matrix(&self, keyspace: &str, creation_timestamp: Timestamp) -> Arc<dyn TemporalDataMatrix> {
        Arc::new(RedbMatrix {
            db: Arc::clone(&self.db),
            branch: self.branch.clone(),
            keyspace: keyspace.to_string(),
            creation_timestamp,
        })
    }
}

impl BranchStorage for RedbBranchStorage {
    fn create_matrix(
        &self,
        keyspace: &str,
        creation_timestamp: Timestamp,
    ) -> Result<Arc<dyn TemporalDataMatrix>> {
        let write_txn = self.db.begin_write()?;
        let creation = {
            let mut table = write_txn.open_table(KEYSPACES)?;
            let existing = table
                .get((self.branch.as_str(), keyspace))?
                .map(|guard| guard.value());
            match existing {
                Some(existing) => existing,
                None => {
                    table.insert((self.branch.as_str(), keyspace), creation_timestamp)?;
                    creation_timestamp
                }
            }
        };
        write_txn.commit()?;
        Ok(self.matrix(keyspace, creation))
    }

    fn load_matrices(&self) -> Result<Vec<Arc<dyn TemporalDataMatrix>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KEYSPACES)?;
        let mut matrices = Vec::new();
        for entry in table.range((self.branch.as_str(), "")..)? {
            let (key, creation) = entry?;
            let (branch, keyspace) = key.value();
            if branch != self.branch {
                break;
            }
            matrices.push(self.matrix(keyspace, creation.value()));
        }
        Ok(matrices)
    }

    fn drop_matrix(&self, keyspace: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        remove_keyspace(&write_txn, &self.branch, keyspace)?;
        write_txn.commit()?;
        Ok(())
    }

    fn now(&self) -> Result<Timestamp> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(NOW)?;
        Ok(table
            .get(self.branch.as_str())?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }

    fn set_now(&self, timestamp: Timestamp) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(NOW)?;
            table.insert(self.branch.as_str(), timestamp)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn write_wal_token(&self, token: &WalToken) -> Result<()> {
        let json = serde_json::to_string(token)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(WAL)?;
            table.insert(self.branch.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn read_wal_token(&self) -> Result<Option<WalToken>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WAL)?;
        let json: Option<String> = table
            .get(self.branch.as_str())?
            .map(|guard| guard.value().to_string());
        json.map(|j| serde_json::from_str(&j).map_err(VersoError::from))
            .transpose()
    }

    fn clear_wal_token(&self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(WAL)?;
            table.remove(self.branch.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn commit_metadata(&self) -> &dyn CommitMetadataStore {
        &self.metadata
    }
}

struct RedbCommitMetadata {
    db: Arc<Database>,
    branch: String,
}

impl RedbCommitMetadata {
    fn stamps_in(&self, lower: Timestamp, upper: Timestamp) -> Result<Vec<Timestamp>> {
        if lower > upper {
            return Ok(Vec::new());
        }
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COMMIT_METADATA)?;
        let branch = self.branch.as_str();
        let mut stamps = Vec::new();
        for entry in table.range((branch, lower)..=(branch, upper))? {
            let (key, _) = entry?;
            stamps.push(key.value().1);
        }
        Ok(stamps)
    }
}

impl CommitMetadataStore for RedbCommitMetadata {
    fn put(&self, timestamp: Timestamp, metadata: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(COMMIT_METADATA)?;
            table.insert((self.branch.as_str(), timestamp), metadata)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, timestamp: Timestamp) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COMMIT_METADATA)?;
        Ok(table
            .get((self.branch.as_str(), timestamp))?
            .map(|guard| guard.value().to_vec()))
    }

    fn timestamps_between(&self, lower: Timestamp, upper: Timestamp) -> Result<Vec<Timestamp>> {
        self.stamps_in(lower, upper)
    }

    fn rollback(&self, timestamp: Timestamp) -> Result<()> {
        if timestamp == Timestamp::MAX {
            return Ok(());
        }
        let doomed = self.stamps_in(timestamp + 1, Timestamp::MAX)?;
        if doomed.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(COMMIT_METADATA)?;
            for ts in doomed {
                table.remove((self.branch.as_str(), ts))?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn purge(&self, timestamp: Timestamp) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(COMMIT_METADATA)?;
            let removed = table.remove((self.branch.as_str(), timestamp))?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }
}

/// Delete a keyspace of `branch`: its registry row, its count and every
/// version in both matrix tables.
fn remove_keyspace(write_txn: &WriteTransaction, branch: &str, keyspace: &str) -> Result<()> {
    let mut by_time = write_txn.open_table(MATRIX_BY_TIME)?;
    let mut rows = Vec::new();
    for entry in by_time.range((branch, keyspace, 0u64, "")..)? {
        let (key, _) = entry?;
        let (b, ks, ts, k) = key.value();
        if b != branch || ks != keyspace {
            break;
        }
        rows.push((ts, k.to_string()));
    }
    let mut matrix = write_txn.open_table(MATRIX)?;
    for (ts, key) in &rows {
        by_time.remove((branch, keyspace, *ts, key.as_str()))?;
        matrix.remove((branch, keyspace, key.as_str(), *ts))?;
    }
    let mut counts = write_txn.open_table(ENTRY_COUNTS)?;
    counts.remove((branch, keyspace))?;
    let mut keyspaces = write_txn.open_table(KEYSPACES)?;
    keyspaces.remove((branch, keyspace))?;
    Ok(())
}

/// One keyspace of one branch, stored as a key range of the shared matrix tables.
struct RedbMatrix {
    db: Arc<Database>,
    branch: String,
    keyspace: String,
    creation_timestamp: Timestamp,
}

impl RedbMatrix {
    fn key_stamps<T>(&self, table: &T, key: &str, lower: Timestamp, upper: Timestamp) -> Result<Vec<Timestamp>>
    where
        T: ReadableTable<MatrixKey, &'static [u8]>,
    {
        let (branch, keyspace) = (self.branch.as_str(), self.keyspace.as_str());
        let mut stamps = Vec::new();
        for entry in table.range((branch, keyspace, key, lower)..=(branch, keyspace, key, upper))? {
            let (k, _) = entry?;
            stamps.push(k.value().3);
        }
        Ok(stamps)
    }

    fn latest_stamp<T>(&self, table: &T, key: &str) -> Result<Option<Timestamp>>
    where
        T: ReadableTable<MatrixKey, &'static [u8]>,
    {
        let (branch, keyspace) = (self.branch.as_str(), self.keyspace.as_str());
        match table
            .range((branch, keyspace, key, 0u64)..=(branch, keyspace, key, u64::MAX))?
            .next_back()
        {
            Some(entry) => Ok(Some(entry?.0.value().3)),
            None => Ok(None),
        }
    }

    /// `(timestamp, key)` of every version within `[lower, upper]`, in
    /// timestamp order.
    fn stamped_keys<T>(&self, table: &T, lower: Timestamp, upper: Timestamp) -> Result<Vec<(Timestamp, String)>>
    where
        T: ReadableTable<TimeKey, ()>,
    {
        let (branch, keyspace) = (self.branch.as_str(), self.keyspace.as_str());
        let mut out = Vec::new();
        if lower > upper {
            return Ok(out);
        }
        for entry in table.range((branch, keyspace, lower, "")..)? {
            let (key, _) = entry?;
            let (b, ks, ts, k) = key.value();
            if b != branch || ks != keyspace || ts > upper {
                break;
            }
            out.push((ts, k.to_string()));
        }
        Ok(out)
    }

    fn read_stamped_keys(&self, lower: Timestamp, upper: Timestamp) -> Result<Vec<(Timestamp, String)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MATRIX_BY_TIME)?;
        self.stamped_keys(&table, lower, upper)
    }

    fn update_count(&self, write_txn: &WriteTransaction, added: u64, removed: u64) -> Result<()> {
        if added == removed {
            return Ok(());
        }
        let slot = (self.branch.as_str(), self.keyspace.as_str());
        let mut counts = write_txn.open_table(ENTRY_COUNTS)?;
        let current = counts.get(slot)?.map(|guard| guard.value()).unwrap_or(0);
        counts.insert(slot, (current + added).saturating_sub(removed))?;
        Ok(())
    }

    fn remove_rows(&self, rows: &[(String, Timestamp)]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let (branch, keyspace) = (self.branch.as_str(), self.keyspace.as_str());
        let write_txn = self.db.begin_write()?;
        let mut removed = 0;
        {
            let mut table = write_txn.open_table(MATRIX)?;
            let mut by_time = write_txn.open_table(MATRIX_BY_TIME)?;
            for (key, ts) in rows {
                let existed = table.remove((branch, keyspace, key.as_str(), *ts))?.is_some();
                if existed {
                    by_time.remove((branch, keyspace, *ts, key.as_str()))?;
                    removed += 1;
                }
            }
        }
        self.update_count(&write_txn, 0, removed as u64)?;
        write_txn.commit()?;
        Ok(removed)
    }
}

impl TemporalDataMatrix for RedbMatrix {
    fn keyspace(&self) -> &str {
        &self.keyspace
    }

    fn creation_timestamp(&self) -> Timestamp {
        self.creation_timestamp
    }

    fn get(&self, timestamp: Timestamp, key: &str) -> Result<GetResult<Vec<u8>>> {
        let (branch, keyspace) = (self.branch.as_str(), self.keyspace.as_str());
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MATRIX)?;

        let floor = match table
            .range((branch, keyspace, key, 0u64)..=(branch, keyspace, key, timestamp))?
            .next_back()
        {
            Some(entry) => {
                let (k, v) = entry?;
                Some((k.value().3, v.value().to_vec()))
            }
            None => None,
        };
        let ceiling = if timestamp == Timestamp::MAX {
            None
        } else {
            match table
                .range((branch, keyspace, key, timestamp + 1)..=(branch, keyspace, key, u64::MAX))?
                .next()
            {
                Some(entry) => Some(entry?.0.value().3),
                None => None,
            }
        };
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
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MATRIX)?;
        let stamps = self.key_stamps(&table, key, lower, upper)?;
        Ok(order_timestamps(stamps, order))
    }

    fn key_set_modifications(&self, timestamp: Timestamp) -> Result<KeySetModifications> {
        let (branch, keyspace) = (self.branch.as_str(), self.keyspace.as_str());
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MATRIX)?;
        let mut mods = KeySetModifications::default();

        // Hop from key to key: `key + "\0"` is the smallest string after `key`.
        let mut cursor = String::new();
        loop {
            let key = match table.range((branch, keyspace, cursor.as_str(), 0u64)..)?.next() {
                Some(entry) => {
                    let (k, _) = entry?;
                    let (b, ks, key, _) = k.value();
                    if b != branch || ks != keyspace {
                        break;
                    }
                    key.to_string()
                }
                None => break,
            };
            if let Some(entry) = table
                .range((branch, keyspace, key.as_str(), 0u64)..=(branch, keyspace, key.as_str(), timestamp))?
                .next_back()
            {
                let (_, value) = entry?;
                if value.value().is_empty() {
                    mods.removals.insert(key.clone());
                } else {
                    mods.additions.insert(key.clone());
                }
            }
            cursor = key;
            cursor.push('\0');
        }
        Ok(mods)
    }

    fn modifications_between(&self, lower: Timestamp, upper: Timestamp) -> Result<Vec<TemporalKey>> {
        Ok(self
            .read_stamped_keys(lower, upper)?
            .into_iter()
            .map(|(ts, key)| TemporalKey::new(ts, self.keyspace.clone(), key))
            .collect())
    }

    fn entries_at(&self, timestamp: Timestamp) -> Result<Vec<MatrixEntry>> {
        let (branch, keyspace) = (self.branch.as_str(), self.keyspace.as_str());
        let read_txn = self.db.begin_read()?;
        let by_time = read_txn.open_table(MATRIX_BY_TIME)?;
        let table = read_txn.open_table(MATRIX)?;
        let mut entries = Vec::new();
        for (ts, key) in self.stamped_keys(&by_time, timestamp, timestamp)? {
            let value = match table.get((branch, keyspace, key.as_str(), ts))? {
                Some(guard) => guard.value().to_vec(),
                None => continue,
            };
            entries.push(MatrixEntry::new(key, ts, value));
        }
        Ok(entries)
    }

    fn insert_entries(&self, entries: &[MatrixEntry], force: bool) -> Result<()> {
        let (branch, keyspace) = (self.branch.as_str(), self.keyspace.as_str());
        let write_txn = self.db.begin_write()?;
        let mut added = 0;
        {
            let mut table = write_txn.open_table(MATRIX)?;
            let mut by_time = write_txn.open_table(MATRIX_BY_TIME)?;
            for entry in entries {
                if !force {
                    let latest = self.latest_stamp(&table, &entry.key)?;
                    check_append_order(keyspace, latest, entry)?;
                }
                let replaced = table
                    .insert(
                        (branch, keyspace, entry.key.as_str(), entry.timestamp),
                        entry.value.as_slice(),
                    )?
                    .is_some();
                if !replaced {
                    by_time.insert((branch, keyspace, entry.timestamp, entry.key.as_str()), ())?;
                    added += 1;
                }
            }
        }
        self.update_count(&write_txn, added, 0)?;
        write_txn.commit()?;
        Ok(())
    }

    fn rollback(&self, timestamp: Timestamp) -> Result<usize> {
        if timestamp == Timestamp::MAX {
            return Ok(0);
        }
        let doomed: Vec<(String, Timestamp)> = self
            .read_stamped_keys(timestamp + 1, Timestamp::MAX)?
            .into_iter()
            .map(|(ts, key)| (key, ts))
            .collect();
        self.remove_rows(&doomed)
    }

    fn purge_entries(&self, entries: &[(String, Timestamp)]) -> Result<usize> {
        self.remove_rows(entries)
    }

    fn purge_all_entries_in_time_range(
        &self,
        lower: Timestamp,
        upper: Timestamp,
    ) -> Result<Vec<TemporalKey>> {
        let purged = self.modifications_between(lower, upper)?;
        let rows: Vec<(String, Timestamp)> =
            purged.iter().map(|k| (k.key.clone(), k.timestamp)).collect();
        self.remove_rows(&rows)?;
        Ok(purged)
    }

    fn entry_count(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRY_COUNTS)?;
        Ok(table
            .get((self.branch.as_str(), self.keyspace.as_str()))?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }
}
