use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::backend::{BranchMetadata, InMemoryBackend, RedbBackend, StorageBackend};
use crate::branch::{Branch, MASTER_BRANCH};
use crate::branch_manager::BranchManager;
use crate::clock::CommitClock;
use crate::config::VersoConfig;
use crate::error::{Result, VersoError};
use crate::store::dateback::{Dateback, DatebackReport};
use crate::store::TemporalKeyValueStore;
use crate::transaction::Transaction;
use crate::types::Timestamp;

/// State shared by every branch store of one database.
pub(crate) struct Shared {
    pub(crate) config: VersoConfig,
    pub(crate) clock: CommitClock,
    /// Read for commits and reads, write for branch deletion and dateback.
    pub(crate) db_lock: RwLock<()>,
}

/// An open database.
///
/// ```rust,no_run
/// use verso::{Verso, DEFAULT_KEYSPACE};
///
/// let db = Verso::open("inventory.verso").unwrap();
/// let mut tx = db.tx().unwrap();
/// tx.put(DEFAULT_KEYSPACE, "apples", 12).unwrap();
/// let t1 = tx.commit().unwrap().unwrap();
///
/// let then = db.tx_at(t1).unwrap();
/// assert_eq!(then.get(DEFAULT_KEYSPACE, "apples").unwrap(), Some(12.into()));
/// ```
pub struct Verso {
    pub(crate) shared: Arc<Shared>,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) branches: RwLock<BTreeMap<String, Arc<Branch>>>,
}

impl Verso {
    /// Open or create a database file backed by redb.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, VersoConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: VersoConfig) -> Result<Self> {
        let backend = RedbBackend::open(path)?;
        Self::with_backend(Arc::new(backend), config)
    }

    /// A volatile database. Data is lost when the instance is dropped.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_backend(Arc::new(InMemoryBackend::new()), VersoConfig::default())
    }

    /// Open a database on any backend. Branches are rebuilt parent-first and
    /// every branch store repairs an interrupted commit before this returns.
    pub fn with_backend(backend: Arc<dyn StorageBackend>, config: VersoConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            clock: config.commit_clock(),
            config,
            db_lock: RwLock::new(()),
        });

        let mut pending = backend.load_branches()?;
        if !pending.iter().any(|b| b.name == MASTER_BRANCH) {
            let master = BranchMetadata::new(MASTER_BRANCH, None, 0);
            backend.save_branch(&master)?;
            pending.push(master);
        }

        let mut branches: BTreeMap<String, Arc<Branch>> = BTreeMap::new();
        while !pending.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|b| match &b.parent {
                None => true,
                Some(parent) => branches.contains_key(parent),
            });
            if ready.is_empty() {
                let orphans: Vec<String> = blocked.into_iter().map(|b| b.name).collect();
                return Err(VersoError::Internal(format!(
                    "branches without a loadable parent: {}",
                    orphans.join(", ")
                )));
            }
            for metadata in ready {
                let origin = metadata.parent.as_ref().and_then(|p| branches.get(p)).cloned();
                let branch = open_branch(&backend, &shared, metadata, origin)?;
                branches.insert(branch.name().to_string(), Arc::new(branch));
            }
            pending = blocked;
        }
        info!(branches = branches.len(), "database opened");

        Ok(Self {
            shared,
            backend,
            branches: RwLock::new(branches),
        })
    }

    pub fn config(&self) -> &VersoConfig {
        &self.shared.config
    }

    pub fn branch_manager(&self) -> BranchManager<'_> {
        BranchManager::new(self)
    }

    pub(crate) fn branch_named(&self, name: &str) -> Result<Arc<Branch>> {
        self.branches
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VersoError::BranchNotFound(name.to_string()))
    }

    /// A transaction on master at its current now.
    pub fn tx(&self) -> Result<Transaction> {
        self.tx_on(MASTER_BRANCH)
    }

    /// A transaction on `branch` at its current now.
    pub fn tx_on(&self, branch: &str) -> Result<Transaction> {
        let branch = self.branch_named(branch)?;
        let now = branch.now()?;
        Ok(Transaction::new(branch, now))
    }

    /// A transaction on master at `timestamp`.
    pub fn tx_at(&self, timestamp: Timestamp) -> Result<Transaction> {
        self.tx_on_at(MASTER_BRANCH, timestamp)
    }

    /// A transaction on `branch` at `timestamp`, which must not lie after
    /// the branch's now.
    pub fn tx_on_at(&self, branch: &str, timestamp: Timestamp) -> Result<Transaction> {
        let branch = self.branch_named(branch)?;
        let now = branch.now()?;
        if timestamp > now {
            return Err(VersoError::InvalidTransactionTimestamp {
                branch: branch.name().to_string(),
                requested: timestamp,
                now,
            });
        }
        Ok(Transaction::new(branch, timestamp))
    }

    /// Rewrite committed history of `branch` under exclusive access to the
    /// whole database. See [`Dateback`] for the available operations.
    pub fn dateback<F>(&self, branch: &str, f: F) -> Result<DatebackReport>
    where
        F: FnOnce(&mut Dateback<'_>) -> Result<()>,
    {
        self.branch_named(branch)?.store().dateback(f)
    }
}

fn open_branch(
    backend: &Arc<dyn StorageBackend>,
    shared: &Arc<Shared>,
    metadata: BranchMetadata,
    origin: Option<Arc<Branch>>,
) -> Result<Branch> {
    let storage = backend.open_branch_storage(&metadata.name)?;
    let store = TemporalKeyValueStore::open(
        metadata.name.clone(),
        origin.as_ref().map(|o| Arc::clone(o.store())),
        metadata.branching_timestamp,
        storage,
        Arc::clone(shared),
    )?;
    debug!(branch = %metadata.name, parent = ?metadata.parent, "loaded branch");
    Ok(Branch::new(metadata, origin, store))
}

/// Persist and open a new branch. The caller registers it.
pub(crate) fn create_branch(db: &Verso, metadata: BranchMetadata, origin: Arc<Branch>) -> Result<Arc<Branch>> {
    db.backend.save_branch(&metadata)?;
    Ok(Arc::new(open_branch(&db.backend, &db.shared, metadata, Some(origin))?))
}

impl std::fmt::Debug for Verso {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verso")
            .field("branches", &self.branches.read().keys().collect::<Vec<_>>())
            .field("config", &self.shared.config)
            .finish()
    }
}
