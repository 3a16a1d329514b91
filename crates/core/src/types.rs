//! Coordinates, periods and result types shared by every layer.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A commit timestamp in milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// A key scoped to its keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedKey {
    pub keyspace: String,
    pub key: String,
}

impl QualifiedKey {
    pub fn new(keyspace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for QualifiedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.keyspace, self.key)
    }
}

/// One version of a key: `(timestamp, keyspace, key)`.
///
/// Ordering is by timestamp first so that collections of temporal keys sort
/// chronologically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemporalKey {
    pub timestamp: Timestamp,
    pub keyspace: String,
    pub key: String,
}

impl TemporalKey {
    pub fn new(timestamp: Timestamp, keyspace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            timestamp,
            keyspace: keyspace.into(),
            key: key.into(),
        }
    }

    pub fn qualified_key(&self) -> QualifiedKey {
        QualifiedKey::new(self.keyspace.clone(), self.key.clone())
    }
}

/// The globally unique coordinate of one entry version:
/// `(branch, timestamp, qualified key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChronoIdentifier {
    pub branch: String,
    pub timestamp: Timestamp,
    pub key: QualifiedKey,
}

impl ChronoIdentifier {
    pub fn new(branch: impl Into<String>, timestamp: Timestamp, key: QualifiedKey) -> Self {
        Self {
            branch: branch.into(),
            timestamp,
            key,
        }
    }
}

impl std::fmt::Display for ChronoIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.branch, self.timestamp, self.key)
    }
}

/// A half-open validity interval `[lower, upper)`.
///
/// An `upper` of [`Timestamp::MAX`] means the period is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    lower: Timestamp,
    upper: Timestamp,
}

impl Period {
    pub fn new(lower: Timestamp, upper: Timestamp) -> Self {
        debug_assert!(lower <= upper, "period lower bound exceeds upper bound");
        Self { lower, upper }
    }

    /// `[0, ∞)`.
    pub fn eternal() -> Self {
        Self::new(0, Timestamp::MAX)
    }

    /// `[lower, ∞)`.
    pub fn starting_at(lower: Timestamp) -> Self {
        Self::new(lower, Timestamp::MAX)
    }

    pub fn lower(&self) -> Timestamp {
        self.lower
    }

    pub fn upper(&self) -> Timestamp {
        self.upper
    }

    pub fn is_open_ended(&self) -> bool {
        self.upper == Timestamp::MAX
    }

    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.lower <= timestamp && timestamp < self.upper
    }

    pub fn with_upper(self, upper: Timestamp) -> Self {
        Self::new(self.lower, upper)
    }
}

/// Iteration order for history-style queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Order {
    Ascending,
    Descending,
}

/// Result of a point-in-time read.
///
/// `hit` is true whenever a version (possibly a tombstone) was found; a
/// tombstone hit carries `value: None`.
#[derive(Debug, Clone, PartialEq)]
pub struct GetResult<V> {
    value: Option<V>,
    period: Period,
    hit: bool,
}

impl<V> GetResult<V> {
    pub fn hit(value: Option<V>, period: Period) -> Self {
        Self {
            value,
            period,
            hit: true,
        }
    }

    pub fn miss(period: Period) -> Self {
        Self {
            value: None,
            period,
            hit: false,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.hit
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn with_period(mut self, period: Period) -> Self {
        self.period = period;
        self
    }

    pub fn try_map<U, E>(self, f: impl FnOnce(V) -> Result<Option<U>, E>) -> Result<GetResult<U>, E> {
        let value = match self.value {
            Some(v) => f(v)?,
            None => None,
        };
        Ok(GetResult {
            value,
            period: self.period,
            hit: self.hit,
        })
    }
}

/// The delta that turns an empty key set into the key set of one matrix at a
/// given timestamp. A branch applies it on top of its origin's key set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySetModifications {
    pub additions: BTreeSet<String>,
    pub removals: BTreeSet<String>,
}

impl KeySetModifications {
    pub fn apply_to(&self, keys: &mut BTreeSet<String>) {
        for removed in &self.removals {
            keys.remove(removed);
        }
        keys.extend(self.additions.iter().cloned());
    }
}

/// One physical version inside a matrix. An empty `value` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixEntry {
    pub key: String,
    pub timestamp: Timestamp,
    pub value: Vec<u8>,
}

impl MatrixEntry {
    pub fn new(key: impl Into<String>, timestamp: Timestamp, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            timestamp,
            value,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }
}

/// Durable marker written before a commit mutates any matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalToken {
    pub branch: String,
    pub now_before_commit: Timestamp,
    pub commit_timestamp: Timestamp,
}

/// What the commit metadata store keeps per commit timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMetadata {
    /// User-supplied payload, if any.
    pub payload: Option<Value>,
    /// `true` for commits the engine registered on its own (dateback injection).
    pub internal: bool,
}

impl CommitMetadata {
    pub fn user(payload: Option<Value>) -> Self {
        Self {
            payload,
            internal: false,
        }
    }

    pub fn internal() -> Self {
        Self {
            payload: None,
            internal: true,
        }
    }
}

/// Process-unique transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(u64);

impl TxId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Size of a branch's stored history versus its live head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchHeadStatistics {
    /// Number of versions stored locally, tombstones included.
    pub total_entries: u64,
    /// Number of keys alive at the branch's now, inherited keys included.
    pub entries_in_head: u64,
}

impl BranchHeadStatistics {
    /// `entries_in_head / total_entries`, or `1.0` for an empty branch.
    pub fn head_history_ratio(&self) -> f64 {
        if self.total_entries == 0 {
            1.0
        } else {
            self.entries_in_head as f64 / self.total_entries as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_is_half_open() {
        let p = Period::new(10, 20);
        assert!(!p.contains(9));
        assert!(p.contains(10));
        assert!(p.contains(19));
        assert!(!p.contains(20));
        assert!(!p.is_open_ended());
        assert!(Period::starting_at(5).is_open_ended());
    }

    #[test]
    fn temporal_keys_sort_by_timestamp_first() {
        let mut keys = vec![
            TemporalKey::new(30, "a", "x"),
            TemporalKey::new(10, "z", "z"),
            TemporalKey::new(20, "b", "a"),
        ];
        keys.sort();
        let stamps: Vec<u64> = keys.iter().map(|k| k.timestamp).collect();
        assert_eq!(stamps, vec![10, 20, 30]);
    }

    #[test]
    fn key_set_modifications_apply_removals_then_additions() {
        let mut base: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let mods = KeySetModifications {
            additions: ["c".to_string()].into_iter().collect(),
            removals: ["a".to_string()].into_iter().collect(),
        };
        mods.apply_to(&mut base);
        let keys: Vec<&str> = base.iter().map(String::as_str).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn tx_ids_are_unique() {
        let a = TxId::next();
        let b = TxId::next();
        assert_ne!(a, b);
    }
}
