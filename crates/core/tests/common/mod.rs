#![allow(dead_code)]

use std::sync::Arc;

use verso::{CommitClock, InMemoryBackend, TimestampPolicy, Verso, VersoConfig};

/// A clock stuck at zero, so commit timestamps count up 1, 2, 3 ...
pub fn logical_clock() -> CommitClock {
    CommitClock::with_source(TimestampPolicy::Increment, || 0)
}

pub fn config() -> VersoConfig {
    VersoConfig::default().with_clock(logical_clock())
}

pub fn open_db() -> Verso {
    open_db_with(config())
}

pub fn open_db_with(config: VersoConfig) -> Verso {
    Verso::with_backend(Arc::new(InMemoryBackend::new()), config).unwrap()
}
