//! Verso: an embedded bitemporal, branch-aware key-value store.
//!
//! Every key keeps its full version history indexed by commit timestamp.
//! Branches form a tree: a branch inherits its parent's history up to a
//! fixed branching timestamp and records its own commits from there on.
//!
//! A [`Transaction`] reads the committed state of one branch as of its
//! timestamp and buffers writes until [`Transaction::commit`]. Commits are
//! all-or-nothing: a write-ahead token is persisted before anything is
//! mutated, and a commit interrupted by a crash is rolled back the next time
//! the database is opened.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use verso::{Order, Verso, DEFAULT_KEYSPACE};
//!
//! let db = Verso::open("ledger.verso").unwrap();
//!
//! let mut tx = db.tx().unwrap();
//! tx.put(DEFAULT_KEYSPACE, "alice", 100).unwrap();
//! let t1 = tx.commit().unwrap().unwrap();
//!
//! tx.put(DEFAULT_KEYSPACE, "alice", 80).unwrap();
//! let t2 = tx.commit().unwrap().unwrap();
//!
//! // Point-in-time read
//! let then = db.tx_at(t1).unwrap();
//! assert_eq!(then.get_as::<i64>(DEFAULT_KEYSPACE, "alice").unwrap(), Some(100));
//!
//! // History, newest first
//! let now = db.tx().unwrap();
//! assert_eq!(now.history(DEFAULT_KEYSPACE, "alice", Order::Descending).unwrap(), vec![t2, t1]);
//!
//! // Branch off and diverge
//! db.branch_manager().create_branch("what-if").unwrap();
//! let mut what_if = db.tx_on("what-if").unwrap();
//! what_if.put(DEFAULT_KEYSPACE, "alice", 0).unwrap();
//! what_if.commit().unwrap();
//! ```

mod backend;
mod branch;
mod branch_manager;
mod cache;
mod change_set;
mod clock;
mod codec;
mod config;
mod conflict;
mod database;
mod error;
mod index;
mod matrix;
mod metadata_filter;
mod observer;
mod store;
mod transaction;
mod types;

pub use backend::{
    BranchMetadata, BranchStorage, CommitMetadataStore, InMemoryBackend, InMemoryMatrix,
    RedbBackend, StorageBackend,
};
pub use branch::{Branch, MASTER_BRANCH};
pub use branch_manager::BranchManager;
pub use cache::{CacheStats, LruValueCache, ValueCache};
pub use clock::{wall_clock_millis, CommitClock, TimestampPolicy};
pub use codec::{JsonCodec, ValueCodec};
pub use config::{
    VersoConfig, DEFAULT_CACHE_MAX_ENTRIES, ENV_CACHE_MAX_ENTRIES, ENV_COMMIT_METADATA_FILTER,
    ENV_COMMIT_WAIT_MS, ENV_CONFLICT_RESOLUTION, ENV_DUPLICATE_VERSION_ELIMINATION,
};
pub use conflict::{
    strategy_by_name, AtomicConflict, CommonAncestor, ConflictResolutionStrategy, DoNotMerge,
    OverwriteWithSource, OverwriteWithTarget,
};
pub use database::Verso;
pub use error::{Result, VersoError};
pub use index::{IndexEntry, SecondaryIndexManager};
pub use matrix::TemporalDataMatrix;
pub use metadata_filter::{CommitMetadataFilter, FilterConstructor, FilterRegistry, RequireMetadata};
pub use observer::{CommitEvent, CommitObserver, CommitPhase};
pub use store::dateback::{Dateback, DatebackOperation, DatebackReport, Rewrite};
pub use transaction::{Transaction, DEFAULT_KEYSPACE};
pub use types::{
    BranchHeadStatistics, ChronoIdentifier, CommitMetadata, GetResult, KeySetModifications,
    MatrixEntry, Order, Period, QualifiedKey, TemporalKey, Timestamp, TxId, WalToken,
};

/// Environment variable holding the `tracing` filter used by [`init_logging`].
pub const ENV_LOG: &str = "VERSO_LOG";

/// Install a global `tracing` subscriber writing to stderr.
///
/// The filter comes from `VERSO_LOG` (for example `VERSO_LOG=verso=debug`)
/// and defaults to `info`. Call it once, early, from the host binary; the
/// library itself never installs a subscriber.
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
