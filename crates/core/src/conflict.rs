//! Write-write conflicts between concurrent transactions and the policies
//! that resolve them.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, VersoError};
use crate::types::{ChronoIdentifier, Timestamp};

/// The version a conflicting pair of writes both descend from.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonAncestor {
    pub id: ChronoIdentifier,
    pub value: Option<Value>,
}

type AncestorResolver<'a> = Box<dyn Fn() -> Result<Option<CommonAncestor>> + 'a>;

/// A single key written by a transaction after someone else committed it.
///
/// `source` is the incoming write, `target` the version already committed.
pub struct AtomicConflict<'a> {
    transaction_timestamp: Timestamp,
    source: ChronoIdentifier,
    source_value: Option<Value>,
    target: ChronoIdentifier,
    target_value: Option<Value>,
    ancestor: AncestorResolver<'a>,
}

impl<'a> AtomicConflict<'a> {
    pub(crate) fn new(
        transaction_timestamp: Timestamp,
        source: (ChronoIdentifier, Option<Value>),
        target: (ChronoIdentifier, Option<Value>),
        ancestor: AncestorResolver<'a>,
    ) -> Self {
        Self {
            transaction_timestamp,
            source: source.0,
            source_value: source.1,
            target: target.0,
            target_value: target.1,
            ancestor,
        }
    }

    pub fn transaction_timestamp(&self) -> Timestamp {
        self.transaction_timestamp
    }

    pub fn source(&self) -> &ChronoIdentifier {
        &self.source
    }

    pub fn source_value(&self) -> Option<&Value> {
        self.source_value.as_ref()
    }

    pub fn target(&self) -> &ChronoIdentifier {
        &self.target
    }

    pub fn target_value(&self) -> Option<&Value> {
        self.target_value.as_ref()
    }

    /// Reads the key as the writing transaction saw it when it started.
    /// `None` if the key did not exist then.
    pub fn common_ancestor(&self) -> Result<Option<CommonAncestor>> {
        (self.ancestor)()
    }
}

impl std::fmt::Debug for AtomicConflict<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicConflict")
            .field("transaction_timestamp", &self.transaction_timestamp)
            .field("source", &self.source)
            .field("source_value", &self.source_value)
            .field("target", &self.target)
            .field("target_value", &self.target_value)
            .finish_non_exhaustive()
    }
}

/// Decides which value wins a conflict. `Ok(None)` resolves to a deletion.
pub trait ConflictResolutionStrategy: Send + Sync {
    fn resolve(&self, conflict: &AtomicConflict<'_>) -> Result<Option<Value>>;
}

/// Refuses to merge; the commit fails with [`VersoError::CommitConflict`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DoNotMerge;

impl ConflictResolutionStrategy for DoNotMerge {
    fn resolve(&self, conflict: &AtomicConflict<'_>) -> Result<Option<Value>> {
        Err(VersoError::CommitConflict {
            key: conflict.source().key.clone(),
            message: format!(
                "transaction started at {} but key was committed at {}",
                conflict.transaction_timestamp(),
                conflict.target().timestamp
            ),
        })
    }
}

/// The incoming write wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverwriteWithSource;

impl ConflictResolutionStrategy for OverwriteWithSource {
    fn resolve(&self, conflict: &AtomicConflict<'_>) -> Result<Option<Value>> {
        Ok(conflict.source_value().cloned())
    }
}

/// The already committed value wins; the incoming write is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverwriteWithTarget;

impl ConflictResolutionStrategy for OverwriteWithTarget {
    fn resolve(&self, conflict: &AtomicConflict<'_>) -> Result<Option<Value>> {
        Ok(conflict.target_value().cloned())
    }
}

/// Look up a built-in strategy by its configuration name.
pub fn strategy_by_name(name: &str) -> Option<Arc<dyn ConflictResolutionStrategy>> {
    match name {
        "do-not-merge" => Some(Arc::new(DoNotMerge)),
        "overwrite-with-source" => Some(Arc::new(OverwriteWithSource)),
        "overwrite-with-target" => Some(Arc::new(OverwriteWithTarget)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QualifiedKey;
    use serde_json::json;

    fn conflict<'a>() -> AtomicConflict<'a> {
        let key = QualifiedKey::new("default", "k");
        AtomicConflict::new(
            10,
            (ChronoIdentifier::new("master", 10, key.clone()), Some(json!("mine"))),
            (ChronoIdentifier::new("master", 20, key.clone()), Some(json!("theirs"))),
            Box::new(move || {
                Ok(Some(CommonAncestor {
                    id: ChronoIdentifier::new("master", 5, key.clone()),
                    value: Some(json!("base")),
                }))
            }),
        )
    }

    #[test]
    fn builtin_strategies_pick_expected_side() {
        let c = conflict();
        assert_eq!(OverwriteWithSource.resolve(&c).unwrap(), Some(json!("mine")));
        assert_eq!(OverwriteWithTarget.resolve(&c).unwrap(), Some(json!("theirs")));
        let err = DoNotMerge.resolve(&c).unwrap_err();
        assert!(matches!(err, VersoError::CommitConflict { .. }));
    }

    #[test]
    fn ancestor_is_resolved_lazily() {
        let c = conflict();
        let ancestor = c.common_ancestor().unwrap().unwrap();
        assert_eq!(ancestor.id.timestamp, 5);
        assert_eq!(ancestor.value, Some(json!("base")));
    }

    #[test]
    fn strategies_resolve_by_name() {
        assert!(strategy_by_name("overwrite-with-source").is_some());
        assert!(strategy_by_name("do-not-merge").is_some());
        assert!(strategy_by_name("merge-everything").is_none());
    }
}
