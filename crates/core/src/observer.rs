//! Commit lifecycle hooks.

use crate::error::Result;
use crate::types::Timestamp;

/// The phases a commit passes through, in order. `RolledBack` is reached
/// only after a failure once the WAL token has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommitPhase {
    LockAcquired,
    TimestampAssigned,
    MetadataFiltered,
    ChangeSetAnalyzed,
    WalWritten,
    PrimaryIndexUpdated,
    SecondaryIndexUpdated,
    MetadataStored,
    CacheUpdated,
    NowAdvanced,
    WalCleared,
    RolledBack,
}

impl CommitPhase {
    /// Whether a failure in this phase requires compensating rollback.
    pub fn requires_rollback(self) -> bool {
        self >= CommitPhase::WalWritten && self != CommitPhase::RolledBack
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommitEvent<'a> {
    pub branch: &'a str,
    pub timestamp: Timestamp,
    pub phase: CommitPhase,
    /// True while applying one step of an incremental commit.
    pub incremental: bool,
}

/// Observes commit phases. Returning an error aborts the commit; after the
/// WAL token is written that means a full rollback.
pub trait CommitObserver: Send + Sync {
    fn on_phase(&self, event: &CommitEvent<'_>) -> Result<()>;
}
