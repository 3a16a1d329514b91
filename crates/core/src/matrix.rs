//! The temporal data matrix: versioned storage for one keyspace of one branch.
//!
//! Conceptually an append-only multimap `key -> (timestamp, bytes)`, where an
//! empty byte value is a tombstone. Only rollback, purge and forced inserts
//! (dateback, recovery) touch versions out of append order.

use crate::error::{Result, VersoError};
use crate::types::{
    GetResult, KeySetModifications, MatrixEntry, Order, Period, TemporalKey, Timestamp,
};

pub trait TemporalDataMatrix: Send + Sync {
    fn keyspace(&self) -> &str;

    fn creation_timestamp(&self) -> Timestamp;

    /// The version visible at `timestamp` and the period it holds for.
    fn get(&self, timestamp: Timestamp, key: &str) -> Result<GetResult<Vec<u8>>>;

    /// Timestamps of all versions of `key` within `[lower, upper]`.
    fn history(
        &self,
        key: &str,
        lower: Timestamp,
        upper: Timestamp,
        order: Order,
    ) -> Result<Vec<Timestamp>>;

    fn key_set_modifications(&self, timestamp: Timestamp) -> Result<KeySetModifications>;

    /// Every version within `[lower, upper]`, ascending by timestamp.
    fn modifications_between(&self, lower: Timestamp, upper: Timestamp) -> Result<Vec<TemporalKey>>;

    /// Versions recorded exactly at `timestamp`.
    fn entries_at(&self, timestamp: Timestamp) -> Result<Vec<MatrixEntry>>;

    /// Without `force`, an entry older than the newest version of its key is
    /// rejected. Equal timestamps overwrite.
    fn insert_entries(&self, entries: &[MatrixEntry], force: bool) -> Result<()>;

    /// Discard every version newer than `timestamp`. Returns how many were removed.
    fn rollback(&self, timestamp: Timestamp) -> Result<usize>;

    fn purge_entries(&self, entries: &[(String, Timestamp)]) -> Result<usize>;

    /// Remove all versions within `[lower, upper]`, returning what was removed.
    fn purge_all_entries_in_time_range(
        &self,
        lower: Timestamp,
        upper: Timestamp,
    ) -> Result<Vec<TemporalKey>>;

    /// Number of stored versions, tombstones included.
    fn entry_count(&self) -> Result<u64>;
}

/// Build a point-in-time result from the newest version at or before the
/// query time (`floor`) and the first version after it (`ceiling`).
pub(crate) fn point_in_time(
    floor: Option<(Timestamp, Vec<u8>)>,
    ceiling: Option<Timestamp>,
) -> GetResult<Vec<u8>> {
    let upper = ceiling.unwrap_or(Timestamp::MAX);
    match floor {
        Some((timestamp, bytes)) => {
            let value = (!bytes.is_empty()).then_some(bytes);
            GetResult::hit(value, Period::new(timestamp, upper))
        }
        None => GetResult::miss(Period::new(0, upper)),
    }
}

pub(crate) fn check_append_order(
    keyspace: &str,
    latest: Option<Timestamp>,
    entry: &MatrixEntry,
) -> Result<()> {
    match latest {
        Some(latest) if latest > entry.timestamp => Err(VersoError::InvalidArgument(format!(
            "cannot insert {keyspace}->{} at {}: a newer version exists at {latest}",
            entry.key, entry.timestamp
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn order_timestamps(mut timestamps: Vec<Timestamp>, order: Order) -> Vec<Timestamp> {
    timestamps.sort_unstable();
    if order == Order::Descending {
        timestamps.reverse();
    }
    timestamps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_in_time_hit_and_miss() {
        let hit = point_in_time(Some((10, b"x".to_vec())), Some(20));
        assert!(hit.is_hit());
        assert_eq!(hit.period(), Period::new(10, 20));

        let tombstone = point_in_time(Some((10, Vec::new())), None);
        assert!(tombstone.is_hit());
        assert_eq!(tombstone.value(), None);
        assert!(tombstone.period().is_open_ended());

        let miss = point_in_time(None, Some(5));
        assert!(!miss.is_hit());
        assert_eq!(miss.period(), Period::new(0, 5));
    }

    #[test]
    fn append_order_allows_equal_timestamps() {
        let entry = MatrixEntry::new("k", 10, b"v".to_vec());
        assert!(check_append_order("ks", Some(10), &entry).is_ok());
        assert!(check_append_order("ks", None, &entry).is_ok());
        assert!(check_append_order("ks", Some(11), &entry).is_err());
    }
}
