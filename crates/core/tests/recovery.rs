mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tempfile::tempdir;
use verso::{
    BranchStorage, InMemoryBackend, IndexEntry, JsonCodec, MatrixEntry, Order, QualifiedKey,
    RedbBackend, SecondaryIndexManager, StorageBackend, TemporalDataMatrix, Timestamp, ValueCodec,
    Verso, VersoConfig, WalToken, DEFAULT_KEYSPACE, MASTER_BRANCH,
};

use common::config;

/// Leave `storage` looking like a commit at `timestamp` died halfway: the
/// token is written and one version has reached the matrix, but now and the
/// commit metadata were never updated.
fn simulate_interrupted_commit(storage: &dyn BranchStorage, now_before: u64, timestamp: u64) {
    storage
        .write_wal_token(&WalToken {
            branch: MASTER_BRANCH.to_string(),
            now_before_commit: now_before,
            commit_timestamp: timestamp,
        })
        .unwrap();
    let matrix = storage
        .load_matrices()
        .unwrap()
        .into_iter()
        .find(|m| m.keyspace() == DEFAULT_KEYSPACE)
        .unwrap();
    let bytes = JsonCodec.serialize(&json!("half-written")).unwrap();
    matrix
        .insert_entries(&[MatrixEntry::new("k", timestamp, bytes)], false)
        .unwrap();
    let fresh = storage.create_matrix("orphaned", timestamp).unwrap();
    let bytes = JsonCodec.serialize(&json!(1)).unwrap();
    fresh
        .insert_entries(&[MatrixEntry::new("x", timestamp, bytes)], false)
        .unwrap();
}

#[test]
fn reopening_rolls_back_an_interrupted_commit() {
    let backend = Arc::new(InMemoryBackend::new());
    {
        let db = Verso::with_backend(backend.clone(), config()).unwrap();
        let mut tx = db.tx().unwrap();
        tx.put(DEFAULT_KEYSPACE, "k", "committed").unwrap();
        assert_eq!(tx.commit().unwrap(), Some(1));
    }

    let storage = backend.open_branch_storage(MASTER_BRANCH).unwrap();
    simulate_interrupted_commit(storage.as_ref(), 1, 2);

    let db = Verso::with_backend(backend.clone(), config()).unwrap();
    assert_eq!(storage.read_wal_token().unwrap(), None);

    let tx = db.tx().unwrap();
    assert_eq!(tx.timestamp(), 1);
    assert_eq!(tx.get(DEFAULT_KEYSPACE, "k").unwrap(), Some(json!("committed")));
    assert_eq!(tx.history(DEFAULT_KEYSPACE, "k", Order::Ascending).unwrap(), vec![1]);
    assert!(tx.key_set("orphaned").unwrap().is_empty());

    let mut next = db.tx().unwrap();
    next.put(DEFAULT_KEYSPACE, "k", "next").unwrap();
    assert_eq!(next.commit().unwrap(), Some(2));
    let after = db.tx().unwrap();
    assert_eq!(after.history(DEFAULT_KEYSPACE, "k", Order::Ascending).unwrap(), vec![1, 2]);
    // The keyspace created by the interrupted commit is gone, even though
    // its creation timestamp has now been handed out again.
    assert!(!after.keyspaces().unwrap().contains("orphaned"));
    assert!(storage
        .load_matrices()
        .unwrap()
        .iter()
        .all(|m| m.keyspace() != "orphaned"));
}

#[test]
fn stale_token_found_at_commit_time_is_recovered_first() {
    let backend = Arc::new(InMemoryBackend::new());
    let db = Verso::with_backend(backend.clone(), config()).unwrap();
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", "committed").unwrap();
    tx.commit().unwrap();

    // Another process died mid-commit without this instance noticing.
    let storage = backend.open_branch_storage(MASTER_BRANCH).unwrap();
    simulate_interrupted_commit(storage.as_ref(), 1, 5);

    tx.put(DEFAULT_KEYSPACE, "other", 1).unwrap();
    assert_eq!(tx.commit().unwrap(), Some(2));
    assert_eq!(storage.read_wal_token().unwrap(), None);
    let now = db.tx().unwrap();
    assert_eq!(now.get(DEFAULT_KEYSPACE, "k").unwrap(), Some(json!("committed")));
    assert_eq!(now.history(DEFAULT_KEYSPACE, "k", Order::Ascending).unwrap(), vec![1]);
    assert!(!now.keyspaces().unwrap().contains("orphaned"));
}

#[test]
fn branches_survive_a_restart() {
    let backend = Arc::new(InMemoryBackend::new());
    {
        let db = Verso::with_backend(backend.clone(), config()).unwrap();
        let mut tx = db.tx().unwrap();
        tx.put(DEFAULT_KEYSPACE, "k", 1).unwrap();
        tx.commit().unwrap();
        db.branch_manager().create_branch("feature").unwrap();
        db.branch_manager()
            .create_branch_from("feature", "child", 1)
            .unwrap();
        let mut child = db.tx_on("child").unwrap();
        child.put(DEFAULT_KEYSPACE, "k", 2).unwrap();
        child.commit().unwrap();
    }

    let db = Verso::with_backend(backend, config()).unwrap();
    let manager = db.branch_manager();
    assert!(manager.exists("feature"));
    let child = manager.branch("child").unwrap();
    assert_eq!(child.parent_name(), Some("feature"));
    assert_eq!(child.branching_timestamp(), 1);
    assert_eq!(db.tx_on("child").unwrap().get(DEFAULT_KEYSPACE, "k").unwrap(), Some(json!(2)));
    assert_eq!(db.tx_on("feature").unwrap().get(DEFAULT_KEYSPACE, "k").unwrap(), Some(json!(1)));
}

#[test]
fn redb_file_keeps_history_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ledger.verso");
    {
        let db = Verso::open_with_config(&path, config()).unwrap();
        let mut tx = db.tx().unwrap();
        tx.put(DEFAULT_KEYSPACE, "alice", 100).unwrap();
        tx.commit_with_metadata("opening balance").unwrap();
        tx.put(DEFAULT_KEYSPACE, "alice", 80).unwrap();
        tx.commit().unwrap();
        db.branch_manager().create_branch("audit").unwrap();
    }

    let db = Verso::open_with_config(&path, config()).unwrap();
    let now = db.tx().unwrap();
    assert_eq!(now.timestamp(), 2);
    assert_eq!(now.get_as::<i64>(DEFAULT_KEYSPACE, "alice").unwrap(), Some(80));
    assert_eq!(now.history(DEFAULT_KEYSPACE, "alice", Order::Descending).unwrap(), vec![2, 1]);
    assert_eq!(now.commit_metadata(1).unwrap(), Some(json!("opening balance")));
    assert_eq!(db.tx_at(1).unwrap().get_as::<i64>(DEFAULT_KEYSPACE, "alice").unwrap(), Some(100));
    assert_eq!(
        db.tx_on("audit").unwrap().get_as::<i64>(DEFAULT_KEYSPACE, "alice").unwrap(),
        Some(80)
    );
}

#[test]
fn redb_file_recovers_an_interrupted_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("crash.verso");
    {
        let db = Verso::open_with_config(&path, config()).unwrap();
        let mut tx = db.tx().unwrap();
        tx.put(DEFAULT_KEYSPACE, "k", "committed").unwrap();
        tx.commit().unwrap();
    }
    {
        let backend = RedbBackend::open(&path).unwrap();
        let storage = backend.open_branch_storage(MASTER_BRANCH).unwrap();
        simulate_interrupted_commit(storage.as_ref(), 1, 2);
    }

    let db = Verso::open_with_config(&path, config()).unwrap();
    let mut tx = db.tx().unwrap();
    assert_eq!(tx.timestamp(), 1);
    assert_eq!(tx.get(DEFAULT_KEYSPACE, "k").unwrap(), Some(json!("committed")));
    assert_eq!(tx.history(DEFAULT_KEYSPACE, "k", Order::Ascending).unwrap(), vec![1]);

    tx.put(DEFAULT_KEYSPACE, "k", "next").unwrap();
    assert_eq!(tx.commit().unwrap(), Some(2));
    assert_eq!(tx.keyspaces().unwrap(), BTreeSet::from([DEFAULT_KEYSPACE.to_string()]));
}

#[test]
fn default_configuration_opens_in_memory() {
    let db = Verso::open_in_memory().unwrap();
    assert!(db.config().duplicate_version_elimination);
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", 1).unwrap();
    // Wall-clock timestamps are well past the logical ones used elsewhere.
    assert!(tx.commit().unwrap().unwrap() > 1_000_000);

    let from_env = VersoConfig::from_lookup(&Default::default(), |_| None).unwrap();
    assert!(from_env.cache.is_some());
}

#[derive(Default)]
struct RollbackLog {
    calls: Mutex<Vec<(String, Timestamp, Option<BTreeSet<QualifiedKey>>)>>,
}

impl SecondaryIndexManager for RollbackLog {
    fn index(&self, _entries: &[IndexEntry]) -> verso::Result<()> {
        Ok(())
    }

    fn rollback(
        &self,
        branch: &str,
        timestamp: Timestamp,
        keys: Option<&BTreeSet<QualifiedKey>>,
    ) -> verso::Result<()> {
        self.calls.lock().push((branch.to_string(), timestamp, keys.cloned()));
        Ok(())
    }

    fn clear_query_cache(&self) {}
}

#[test]
fn recovery_assumes_the_index_was_touched() {
    let backend = Arc::new(InMemoryBackend::new());
    {
        let db = Verso::with_backend(backend.clone(), config()).unwrap();
        let mut tx = db.tx().unwrap();
        tx.put(DEFAULT_KEYSPACE, "k", "committed").unwrap();
        tx.commit().unwrap();
    }
    let storage = backend.open_branch_storage(MASTER_BRANCH).unwrap();
    simulate_interrupted_commit(storage.as_ref(), 1, 2);

    let index = Arc::new(RollbackLog::default());
    let db = Verso::with_backend(backend, config().with_secondary_index(index.clone())).unwrap();
    assert_eq!(
        index.calls.lock().as_slice(),
        &[(MASTER_BRANCH.to_string(), 1, None)]
    );
    assert_eq!(db.tx().unwrap().timestamp(), 1);
}
