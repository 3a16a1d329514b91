//! Database configuration.
//!
//! Every pluggable collaborator is carried here explicitly. Configuration can
//! also be read from `VERSO_*` environment variables; named components
//! (conflict strategies, metadata filters) are resolved through explicit
//! lookup tables.

use std::sync::Arc;

use crate::cache::{LruValueCache, ValueCache};
use crate::clock::{CommitClock, TimestampPolicy};
use crate::codec::{JsonCodec, ValueCodec};
use crate::conflict::{strategy_by_name, ConflictResolutionStrategy, DoNotMerge};
use crate::error::{Result, VersoError};
use crate::index::SecondaryIndexManager;
use crate::metadata_filter::{CommitMetadataFilter, FilterRegistry};
use crate::observer::CommitObserver;

pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;

pub const ENV_DUPLICATE_VERSION_ELIMINATION: &str = "VERSO_DUPLICATE_VERSION_ELIMINATION";
pub const ENV_CONFLICT_RESOLUTION: &str = "VERSO_CONFLICT_RESOLUTION";
pub const ENV_COMMIT_METADATA_FILTER: &str = "VERSO_COMMIT_METADATA_FILTER";
pub const ENV_CACHE_MAX_ENTRIES: &str = "VERSO_CACHE_MAX_ENTRIES";
pub const ENV_COMMIT_WAIT_MS: &str = "VERSO_COMMIT_WAIT_MS";

#[derive(Clone)]
pub struct VersoConfig {
    /// Skip writes whose value equals the value already visible at head.
    pub duplicate_version_elimination: bool,
    pub conflict_resolution: Arc<dyn ConflictResolutionStrategy>,
    pub commit_metadata_filter: Option<Arc<dyn CommitMetadataFilter>>,
    pub cache: Option<Arc<dyn ValueCache>>,
    pub secondary_index: Option<Arc<dyn SecondaryIndexManager>>,
    pub observer: Option<Arc<dyn CommitObserver>>,
    pub codec: Arc<dyn ValueCodec>,
    pub timestamp_policy: TimestampPolicy,
    /// Overrides the wall-clock commit clock built from `timestamp_policy`.
    pub clock: Option<CommitClock>,
}

impl Default for VersoConfig {
    fn default() -> Self {
        Self {
            duplicate_version_elimination: true,
            conflict_resolution: Arc::new(DoNotMerge),
            commit_metadata_filter: None,
            cache: default_cache(DEFAULT_CACHE_MAX_ENTRIES),
            secondary_index: None,
            observer: None,
            codec: Arc::new(JsonCodec),
            timestamp_policy: TimestampPolicy::default(),
            clock: None,
        }
    }
}

fn default_cache(capacity: usize) -> Option<Arc<dyn ValueCache>> {
    LruValueCache::with_capacity(capacity).map(|c| Arc::new(c) as Arc<dyn ValueCache>)
}

impl VersoConfig {
    /// Read configuration from the process environment, resolving filter
    /// names through the default [`FilterRegistry`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&FilterRegistry::default(), |name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup(
        registry: &FilterRegistry,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_DUPLICATE_VERSION_ELIMINATION) {
            config.duplicate_version_elimination = parse_bool(ENV_DUPLICATE_VERSION_ELIMINATION, &raw)?;
        }
        if let Some(name) = lookup(ENV_CONFLICT_RESOLUTION) {
            config.conflict_resolution = strategy_by_name(name.trim()).ok_or_else(|| {
                VersoError::Config(format!("unknown conflict resolution strategy '{name}'"))
            })?;
        }
        if let Some(name) = lookup(ENV_COMMIT_METADATA_FILTER) {
            let filter = registry.create(name.trim()).ok_or_else(|| {
                VersoError::Config(format!("unknown commit metadata filter '{name}'"))
            })?;
            config.commit_metadata_filter = Some(filter);
        }
        if let Some(raw) = lookup(ENV_CACHE_MAX_ENTRIES) {
            let capacity = parse_u64(ENV_CACHE_MAX_ENTRIES, &raw)? as usize;
            config.cache = default_cache(capacity);
        }
        if let Some(raw) = lookup(ENV_COMMIT_WAIT_MS) {
            let max_wait_ms = parse_u64(ENV_COMMIT_WAIT_MS, &raw)?;
            config.timestamp_policy = TimestampPolicy::WaitForWallClock { max_wait_ms };
        }

        Ok(config)
    }

    pub fn with_duplicate_version_elimination(mut self, enabled: bool) -> Self {
        self.duplicate_version_elimination = enabled;
        self
    }

    pub fn with_conflict_resolution(mut self, strategy: Arc<dyn ConflictResolutionStrategy>) -> Self {
        self.conflict_resolution = strategy;
        self
    }

    pub fn with_commit_metadata_filter(mut self, filter: Arc<dyn CommitMetadataFilter>) -> Self {
        self.commit_metadata_filter = Some(filter);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ValueCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn with_secondary_index(mut self, index: Arc<dyn SecondaryIndexManager>) -> Self {
        self.secondary_index = Some(index);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CommitObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_timestamp_policy(mut self, policy: TimestampPolicy) -> Self {
        self.timestamp_policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: CommitClock) -> Self {
        self.timestamp_policy = clock.policy();
        self.clock = Some(clock);
        self
    }

    /// The clock commits draw their timestamps from.
    pub(crate) fn commit_clock(&self) -> CommitClock {
        self.clock
            .clone()
            .unwrap_or_else(|| CommitClock::new(self.timestamp_policy))
    }
}

impl std::fmt::Debug for VersoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersoConfig")
            .field("duplicate_version_elimination", &self.duplicate_version_elimination)
            .field("commit_metadata_filter", &self.commit_metadata_filter.is_some())
            .field("cache", &self.cache.is_some())
            .field("secondary_index", &self.secondary_index.is_some())
            .field("observer", &self.observer.is_some())
            .field("timestamp_policy", &self.timestamp_policy)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(VersoError::Config(format!("{name}: expected a boolean, got '{other}'"))),
    }
}

fn parse_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| VersoError::Config(format!("{name}: {e}")))
}
