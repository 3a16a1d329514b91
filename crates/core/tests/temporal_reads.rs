mod common;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::json;
use verso::{Order, Period, TemporalKey, VersoError, DEFAULT_KEYSPACE};

use common::{config, open_db, open_db_with};

fn keys(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn reads_see_the_version_valid_at_their_timestamp() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "alice", 100).unwrap();
    let t1 = tx.commit().unwrap().unwrap();
    tx.put(DEFAULT_KEYSPACE, "alice", 80).unwrap();
    let t2 = tx.commit().unwrap().unwrap();
    assert_eq!((t1, t2), (1, 2));

    let then = db.tx_at(t1).unwrap();
    assert_eq!(then.get_as::<i64>(DEFAULT_KEYSPACE, "alice").unwrap(), Some(100));
    let now = db.tx().unwrap();
    assert_eq!(now.get_as::<i64>(DEFAULT_KEYSPACE, "alice").unwrap(), Some(80));
    let before = db.tx_at(0).unwrap();
    assert_eq!(before.get(DEFAULT_KEYSPACE, "alice").unwrap(), None);

    assert_eq!(
        now.history(DEFAULT_KEYSPACE, "alice", Order::Descending).unwrap(),
        vec![t2, t1]
    );
    assert_eq!(
        then.history(DEFAULT_KEYSPACE, "alice", Order::Ascending).unwrap(),
        vec![t1]
    );
}

#[test]
fn commit_advances_transaction_timestamp() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    assert_eq!(tx.timestamp(), 0);
    tx.put(DEFAULT_KEYSPACE, "k", "v").unwrap();
    let t = tx.commit().unwrap().unwrap();
    assert_eq!(tx.timestamp(), t);
    assert!(!tx.has_changes());
    assert_eq!(tx.get(DEFAULT_KEYSPACE, "k").unwrap(), Some(json!("v")));
    assert_eq!(db.branch_manager().master().unwrap().now().unwrap(), t);
}

#[test]
fn pending_writes_are_not_visible_before_commit() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", 1).unwrap();
    assert_eq!(tx.get(DEFAULT_KEYSPACE, "k").unwrap(), None);
    assert_eq!(tx.pending_changes().len(), 1);
}

#[test]
fn empty_commit_is_a_no_op() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    assert_eq!(tx.commit().unwrap(), None);
    assert_eq!(db.branch_manager().master().unwrap().now().unwrap(), 0);
}

#[test]
fn removal_writes_a_tombstone() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", 1).unwrap();
    let t1 = tx.commit().unwrap().unwrap();
    tx.remove(DEFAULT_KEYSPACE, "k").unwrap();
    let t2 = tx.commit().unwrap().unwrap();

    let now = db.tx().unwrap();
    assert!(!now.exists(DEFAULT_KEYSPACE, "k").unwrap());
    assert!(now.key_set(DEFAULT_KEYSPACE).unwrap().is_empty());
    // The tombstone is a version of its own.
    assert_eq!(
        now.history(DEFAULT_KEYSPACE, "k", Order::Ascending).unwrap(),
        vec![t1, t2]
    );
    assert_eq!(now.last_modification_timestamp(DEFAULT_KEYSPACE, "k").unwrap(), Some(t2));
    assert!(db.tx_at(t1).unwrap().exists(DEFAULT_KEYSPACE, "k").unwrap());
}

#[test]
fn validity_period_spans_until_next_version() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", "a").unwrap();
    let t1 = tx.commit().unwrap().unwrap();
    tx.put(DEFAULT_KEYSPACE, "other", "x").unwrap();
    tx.commit().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", "b").unwrap();
    let t3 = tx.commit().unwrap().unwrap();

    let old = db.tx_at(t1 + 1).unwrap().get_with_period(DEFAULT_KEYSPACE, "k").unwrap();
    assert!(old.is_hit());
    assert_eq!(old.period(), Period::new(t1, t3));

    let current = db.tx().unwrap().get_with_period(DEFAULT_KEYSPACE, "k").unwrap();
    assert_eq!(current.period().lower(), t3);
    assert!(current.period().is_open_ended());
}

#[test]
fn duplicate_versions_are_eliminated() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", "same").unwrap();
    let t1 = tx.commit().unwrap().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", "same").unwrap();
    let t2 = tx.commit().unwrap().unwrap();
    assert!(t2 > t1);

    let now = db.tx().unwrap();
    assert_eq!(now.history(DEFAULT_KEYSPACE, "k", Order::Ascending).unwrap(), vec![t1]);
    // The commit itself is still recorded.
    assert_eq!(now.count_commits_between(0, t2).unwrap(), 2);
}

#[test]
fn duplicates_are_kept_when_elimination_is_off() {
    let db = open_db_with(config().with_duplicate_version_elimination(false));
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", "same").unwrap();
    let t1 = tx.commit().unwrap().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", "same").unwrap();
    let t2 = tx.commit().unwrap().unwrap();

    let now = db.tx().unwrap();
    assert_eq!(now.history(DEFAULT_KEYSPACE, "k", Order::Ascending).unwrap(), vec![t1, t2]);
}

#[test]
fn keyspaces_appear_with_their_first_commit() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    tx.put("users", "u1", json!({"name": "ada"})).unwrap();
    let t1 = tx.commit().unwrap().unwrap();
    tx.put("orders", "o1", 3).unwrap();
    tx.put("users", "u2", json!({"name": "alan"})).unwrap();
    let t2 = tx.commit().unwrap().unwrap();

    assert_eq!(db.tx_at(t1).unwrap().keyspaces().unwrap(), keys(&["users"]));
    let now = db.tx().unwrap();
    assert_eq!(now.keyspaces().unwrap(), keys(&["orders", "users"]));
    assert_eq!(now.key_set("users").unwrap(), keys(&["u1", "u2"]));
    assert_eq!(db.tx_at(t1).unwrap().key_set("users").unwrap(), keys(&["u1"]));
    assert!(now.key_set("missing").unwrap().is_empty());

    assert_eq!(now.changed_keys_at_commit(t2, "users").unwrap(), keys(&["u2"]));
    assert_eq!(now.changed_keys_at_commit(t2, "orders").unwrap(), keys(&["o1"]));
    assert!(now.changed_keys_at_commit(t1, "orders").unwrap().is_empty());
}

#[test]
fn modifications_between_lists_versions_in_time_order() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "b", 1).unwrap();
    let t1 = tx.commit().unwrap().unwrap();
    tx.put(DEFAULT_KEYSPACE, "a", 1).unwrap();
    let t2 = tx.commit().unwrap().unwrap();
    tx.put(DEFAULT_KEYSPACE, "b", 2).unwrap();
    let t3 = tx.commit().unwrap().unwrap();

    let now = db.tx().unwrap();
    assert_eq!(
        now.modifications_between(DEFAULT_KEYSPACE, t1, t3).unwrap(),
        vec![
            TemporalKey::new(t1, DEFAULT_KEYSPACE, "b"),
            TemporalKey::new(t2, DEFAULT_KEYSPACE, "a"),
            TemporalKey::new(t3, DEFAULT_KEYSPACE, "b"),
        ]
    );
    assert_eq!(
        now.modifications_between(DEFAULT_KEYSPACE, t2, t2).unwrap(),
        vec![TemporalKey::new(t2, DEFAULT_KEYSPACE, "a")]
    );
    // Bounded by the transaction timestamp.
    assert_eq!(
        db.tx_at(t1).unwrap().modifications_between(DEFAULT_KEYSPACE, 0, t3).unwrap().len(),
        1
    );
}

#[test]
fn commit_metadata_is_recorded_per_commit() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", 1).unwrap();
    let t1 = tx.commit_with_metadata(json!({"author": "ada"})).unwrap().unwrap();
    tx.put(DEFAULT_KEYSPACE, "k", 2).unwrap();
    let t2 = tx.commit().unwrap().unwrap();

    let now = db.tx().unwrap();
    assert_eq!(now.commit_metadata(t1).unwrap(), Some(json!({"author": "ada"})));
    assert_eq!(now.commit_metadata(t2).unwrap(), None);
    assert_eq!(
        now.commit_timestamps_between(0, t2, Order::Descending).unwrap(),
        vec![t2, t1]
    );
    assert_eq!(
        now.commit_metadata_between(0, t2, Order::Ascending).unwrap(),
        vec![(t1, Some(json!({"author": "ada"}))), (t2, None)]
    );
    // Commits after the transaction timestamp are invisible.
    assert_eq!(db.tx_at(t1).unwrap().commit_metadata(t2).unwrap(), None);
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Account {
    owner: String,
    balance: i64,
}

#[test]
fn typed_values_round_trip_through_serde() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    let account = Account {
        owner: "ada".into(),
        balance: 42,
    };
    tx.put("accounts", "a-1", &account).unwrap();
    tx.commit().unwrap();

    let read: Option<Account> = db.tx().unwrap().get_as("accounts", "a-1").unwrap();
    assert_eq!(read, Some(account));
}

#[test]
fn invalid_arguments_are_rejected() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    assert!(matches!(tx.put("", "k", 1), Err(VersoError::InvalidArgument(_))));
    assert!(matches!(tx.put(DEFAULT_KEYSPACE, "", 1), Err(VersoError::InvalidArgument(_))));
    assert!(matches!(
        tx.history_between(DEFAULT_KEYSPACE, "k", 5, 1, Order::Ascending),
        Err(VersoError::InvalidArgument(_))
    ));

    let err = db.tx_at(10).unwrap_err();
    assert!(matches!(
        err,
        VersoError::InvalidTransactionTimestamp { requested: 10, now: 0, .. }
    ));
    assert!(matches!(db.tx_on("nope"), Err(VersoError::BranchNotFound(_))));
}

#[test]
fn example_history_and_key_set() {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "a", 1).unwrap();
    tx.put(DEFAULT_KEYSPACE, "b", 2).unwrap();
    let t1 = tx.commit().unwrap().unwrap();
    tx.put(DEFAULT_KEYSPACE, "a", 3).unwrap();
    let t2 = tx.commit().unwrap().unwrap();

    let now = db.tx().unwrap();
    assert_eq!(now.history(DEFAULT_KEYSPACE, "a", Order::Descending).unwrap(), vec![t2, t1]);
    assert_eq!(db.tx_at(t2 - 1).unwrap().get(DEFAULT_KEYSPACE, "a").unwrap(), Some(json!(1)));
    assert_eq!(db.tx_at(t2).unwrap().get(DEFAULT_KEYSPACE, "a").unwrap(), Some(json!(3)));
    assert_eq!(db.tx_at(t1).unwrap().key_set(DEFAULT_KEYSPACE).unwrap(), keys(&["a", "b"]));
}
