//! Per-commit aggregation of the writes that survived analysis.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::codec::{encode_entry, ValueCodec};
use crate::error::Result;
use crate::index::IndexEntry;
use crate::types::{ChronoIdentifier, MatrixEntry, QualifiedKey, Timestamp};

#[derive(Debug, Default)]
pub(crate) struct ChangeSet {
    entries: BTreeMap<QualifiedKey, Option<Value>>,
    index_entries: Vec<IndexEntry>,
}

impl ChangeSet {
    pub(crate) fn add(&mut self, id: ChronoIdentifier, old_value: Option<Value>, new_value: Option<Value>) {
        self.entries.insert(id.key.clone(), new_value.clone());
        self.index_entries.push(IndexEntry {
            id,
            old_value,
            new_value,
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> &BTreeMap<QualifiedKey, Option<Value>> {
        &self.entries
    }

    pub(crate) fn index_entries(&self) -> &[IndexEntry] {
        &self.index_entries
    }

    pub(crate) fn keys(&self) -> BTreeSet<QualifiedKey> {
        self.entries.keys().cloned().collect()
    }

    /// Encoded matrix entries at `timestamp`, grouped by keyspace.
    pub(crate) fn matrix_entries(
        &self,
        codec: &dyn ValueCodec,
        timestamp: Timestamp,
    ) -> Result<BTreeMap<String, Vec<MatrixEntry>>> {
        let mut grouped: BTreeMap<String, Vec<MatrixEntry>> = BTreeMap::new();
        for (key, value) in &self.entries {
            let bytes = encode_entry(codec, value.as_ref())?;
            grouped
                .entry(key.keyspace.clone())
                .or_default()
                .push(MatrixEntry::new(key.key.clone(), timestamp, bytes));
        }
        Ok(grouped)
    }
}
