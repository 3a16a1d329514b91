mod common;

use std::collections::BTreeSet;

use serde_json::json;
use verso::{Order, TemporalKey, VersoError, DEFAULT_KEYSPACE, MASTER_BRANCH};

use common::open_db;

/// master: a=1 at 1, b=1 at 2.
fn seeded() -> verso::Verso {
    let db = open_db();
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "a", 1).unwrap();
    tx.commit().unwrap();
    tx.put(DEFAULT_KEYSPACE, "b", 1).unwrap();
    tx.commit().unwrap();
    db
}

fn names(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn branch_inherits_origin_up_to_branching_timestamp() {
    let db = seeded();
    let feature = db.branch_manager().create_branch("feature").unwrap();
    assert_eq!(feature.branching_timestamp(), 2);
    assert_eq!(feature.parent_name(), Some(MASTER_BRANCH));
    assert_eq!(feature.now().unwrap(), 2);

    let mut on_feature = db.tx_on("feature").unwrap();
    assert_eq!(on_feature.get(DEFAULT_KEYSPACE, "a").unwrap(), Some(json!(1)));
    on_feature.put(DEFAULT_KEYSPACE, "a", 2).unwrap();
    assert_eq!(on_feature.commit().unwrap(), Some(3));

    let mut on_master = db.tx().unwrap();
    on_master.put(DEFAULT_KEYSPACE, "b", 2).unwrap();
    assert_eq!(on_master.commit().unwrap(), Some(3));

    // Each side sees only its own changes after the split.
    let feature_now = db.tx_on("feature").unwrap();
    assert_eq!(feature_now.get(DEFAULT_KEYSPACE, "a").unwrap(), Some(json!(2)));
    assert_eq!(feature_now.get(DEFAULT_KEYSPACE, "b").unwrap(), Some(json!(1)));
    let master_now = db.tx().unwrap();
    assert_eq!(master_now.get(DEFAULT_KEYSPACE, "a").unwrap(), Some(json!(1)));
    assert_eq!(master_now.get(DEFAULT_KEYSPACE, "b").unwrap(), Some(json!(2)));

    assert_eq!(
        feature_now.history(DEFAULT_KEYSPACE, "a", Order::Ascending).unwrap(),
        vec![1, 3]
    );
    assert_eq!(
        feature_now.history(DEFAULT_KEYSPACE, "a", Order::Descending).unwrap(),
        vec![3, 1]
    );
    assert_eq!(
        feature_now.history(DEFAULT_KEYSPACE, "b", Order::Ascending).unwrap(),
        vec![2]
    );
}

#[test]
fn inherited_value_stays_valid_until_a_local_write() {
    let db = seeded();
    db.branch_manager().create_branch("feature").unwrap();
    let mut on_master = db.tx().unwrap();
    on_master.put(DEFAULT_KEYSPACE, "b", 2).unwrap();
    on_master.commit().unwrap();

    let result = db
        .tx_on("feature")
        .unwrap()
        .get_with_period(DEFAULT_KEYSPACE, "b")
        .unwrap();
    assert_eq!(result.value(), Some(&json!(1)));
    assert_eq!(result.period().lower(), 2);
    assert!(result.period().is_open_ended());
}

#[test]
fn branch_from_the_past_ignores_later_origin_commits() {
    let db = seeded();
    let past = db
        .branch_manager()
        .create_branch_from(MASTER_BRANCH, "past", 1)
        .unwrap();
    assert_eq!(past.now().unwrap(), 1);

    let tx = db.tx_on("past").unwrap();
    assert_eq!(tx.get(DEFAULT_KEYSPACE, "a").unwrap(), Some(json!(1)));
    assert_eq!(tx.get(DEFAULT_KEYSPACE, "b").unwrap(), None);
    assert_eq!(tx.key_set(DEFAULT_KEYSPACE).unwrap(), names(&["a"]));
    assert_eq!(tx.commit_timestamps_between(0, 10, Order::Ascending).unwrap(), vec![1]);
}

#[test]
fn nested_branches_delegate_through_every_ancestor() {
    let db = seeded();
    let manager = db.branch_manager();
    manager.create_branch("feature").unwrap();
    let mut tx = db.tx_on("feature").unwrap();
    tx.put(DEFAULT_KEYSPACE, "c", "feature").unwrap();
    tx.commit_with_metadata("on feature").unwrap();

    manager.create_branch_from("feature", "child", 3).unwrap();
    let mut child = db.tx_on("child").unwrap();
    assert_eq!(child.get(DEFAULT_KEYSPACE, "a").unwrap(), Some(json!(1)));
    assert_eq!(child.get(DEFAULT_KEYSPACE, "c").unwrap(), Some(json!("feature")));
    assert_eq!(child.key_set(DEFAULT_KEYSPACE).unwrap(), names(&["a", "b", "c"]));
    assert_eq!(child.commit_metadata(3).unwrap(), Some(json!("on feature")));

    child.remove(DEFAULT_KEYSPACE, "a").unwrap();
    let t = child.commit().unwrap().unwrap();
    assert_eq!(t, 4);
    assert_eq!(child.key_set(DEFAULT_KEYSPACE).unwrap(), names(&["b", "c"]));
    assert_eq!(
        child.commit_timestamps_between(0, t, Order::Ascending).unwrap(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(
        child.changed_keys_at_commit(3, DEFAULT_KEYSPACE).unwrap(),
        names(&["c"])
    );
    assert_eq!(
        db.tx_on("feature").unwrap().key_set(DEFAULT_KEYSPACE).unwrap(),
        names(&["a", "b", "c"])
    );

    let children: Vec<String> = manager
        .child_branches("feature")
        .unwrap()
        .iter()
        .map(|b| b.name().to_string())
        .collect();
    assert_eq!(children, vec!["child".to_string()]);
}

#[test]
fn keyspace_created_on_branch_is_local() {
    let db = seeded();
    db.branch_manager().create_branch("feature").unwrap();
    let mut tx = db.tx_on("feature").unwrap();
    tx.put("scratch", "x", true).unwrap();
    tx.commit().unwrap();

    assert_eq!(
        db.tx_on("feature").unwrap().keyspaces().unwrap(),
        names(&[DEFAULT_KEYSPACE, "scratch"])
    );
    assert_eq!(db.tx().unwrap().keyspaces().unwrap(), names(&[DEFAULT_KEYSPACE]));
}

#[test]
fn invalid_branch_requests_are_rejected() {
    let db = seeded();
    let manager = db.branch_manager();
    manager.create_branch("feature").unwrap();

    assert!(matches!(
        manager.create_branch("feature"),
        Err(VersoError::BranchAlreadyExists(_))
    ));
    assert!(matches!(
        manager.create_branch_from("ghost", "x", 0),
        Err(VersoError::BranchNotFound(_))
    ));
    assert!(matches!(
        manager.create_branch_from(MASTER_BRANCH, "future", 99),
        Err(VersoError::InvalidArgument(_))
    ));
    assert!(matches!(manager.create_branch(" "), Err(VersoError::InvalidArgument(_))));
    assert!(matches!(
        manager.delete_branch_recursively(MASTER_BRANCH),
        Err(VersoError::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.delete_branch_recursively("ghost"),
        Err(VersoError::BranchNotFound(_))
    ));
}

#[test]
fn recursive_deletion_removes_descendants_first() {
    let db = seeded();
    let manager = db.branch_manager();
    manager.create_branch("feature").unwrap();
    manager.create_branch_from("feature", "child", 2).unwrap();
    manager.create_branch_from("child", "grandchild", 2).unwrap();
    manager.create_branch("sibling").unwrap();

    let stale = db.tx_on("grandchild").unwrap();
    let deleted = manager.delete_branch_recursively("feature").unwrap();
    assert_eq!(deleted, vec!["grandchild", "child", "feature"]);
    assert_eq!(manager.branch_names(), names(&[MASTER_BRANCH, "sibling"]));
    assert!(!manager.exists("child"));

    assert!(matches!(
        stale.get(DEFAULT_KEYSPACE, "a"),
        Err(VersoError::BranchDeleted(_))
    ));
    assert!(stale.branch().is_deleted());
    assert!(matches!(db.tx_on("feature"), Err(VersoError::BranchNotFound(_))));

    // The name can be reused and starts from scratch.
    manager.create_branch("feature").unwrap();
    assert_eq!(
        db.tx_on("feature").unwrap().get(DEFAULT_KEYSPACE, "a").unwrap(),
        Some(json!(1))
    );
}

#[test]
fn head_statistics_compare_history_to_live_keys() {
    let db = seeded();
    let mut tx = db.tx().unwrap();
    tx.put(DEFAULT_KEYSPACE, "a", 2).unwrap();
    tx.commit().unwrap();
    tx.remove(DEFAULT_KEYSPACE, "b").unwrap();
    tx.commit().unwrap();

    let stats = db.branch_manager().master().unwrap().head_statistics().unwrap();
    assert_eq!(stats.total_entries, 4);
    assert_eq!(stats.entries_in_head, 1);
    assert!((stats.head_history_ratio() - 0.25).abs() < f64::EPSILON);
}

#[test]
fn ranges_straddling_the_branch_point_keep_their_order() {
    let db = seeded();
    db.branch_manager().create_branch("feature").unwrap();
    let mut tx = db.tx_on("feature").unwrap();
    tx.put(DEFAULT_KEYSPACE, "a", 2).unwrap();
    tx.commit().unwrap();
    tx.put(DEFAULT_KEYSPACE, "c", 1).unwrap();
    tx.commit().unwrap();

    let feature = db.tx_on("feature").unwrap();
    // Origin versions come first: they are all older than local ones.
    assert_eq!(
        feature.modifications_between(DEFAULT_KEYSPACE, 1, 4).unwrap(),
        vec![
            TemporalKey::new(1, DEFAULT_KEYSPACE, "a"),
            TemporalKey::new(2, DEFAULT_KEYSPACE, "b"),
            TemporalKey::new(3, DEFAULT_KEYSPACE, "a"),
            TemporalKey::new(4, DEFAULT_KEYSPACE, "c"),
        ]
    );
    assert_eq!(
        feature.modifications_between(DEFAULT_KEYSPACE, 2, 3).unwrap(),
        vec![
            TemporalKey::new(2, DEFAULT_KEYSPACE, "b"),
            TemporalKey::new(3, DEFAULT_KEYSPACE, "a"),
        ]
    );
    assert_eq!(
        feature.commit_timestamps_between(0, 4, Order::Descending).unwrap(),
        vec![4, 3, 2, 1]
    );
    assert_eq!(
        feature.commit_timestamps_between(2, 3, Order::Descending).unwrap(),
        vec![3, 2]
    );
    assert_eq!(
        feature.commit_timestamps_between(0, 4, Order::Ascending).unwrap(),
        vec![1, 2, 3, 4]
    );
}
