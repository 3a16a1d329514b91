//! Commit timestamp assignment.
//!
//! Commit timestamps must be strictly greater than the branch's current now.
//! The clock samples the wall clock and, when that does not move past now,
//! either increments logically or waits a bounded time for the wall clock to
//! catch up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// What to do when the wall clock has not yet moved past the branch's now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampPolicy {
    /// Use `now + 1` immediately.
    Increment,
    /// Sleep in 1 ms steps for at most `max_wait_ms`, then use `now + 1`.
    WaitForWallClock { max_wait_ms: u64 },
}

impl Default for TimestampPolicy {
    fn default() -> Self {
        TimestampPolicy::Increment
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn wall_clock_millis() -> Timestamp {
    Utc::now().timestamp_millis().max(0) as Timestamp
}

type ClockSource = Arc<dyn Fn() -> Timestamp + Send + Sync>;

#[derive(Clone)]
pub struct CommitClock {
    policy: TimestampPolicy,
    source: ClockSource,
}

impl CommitClock {
    pub fn new(policy: TimestampPolicy) -> Self {
        Self {
            policy,
            source: Arc::new(wall_clock_millis),
        }
    }

    /// A clock reading from `source` instead of the wall clock.
    pub fn with_source(
        policy: TimestampPolicy,
        source: impl Fn() -> Timestamp + Send + Sync + 'static,
    ) -> Self {
        Self {
            policy,
            source: Arc::new(source),
        }
    }

    pub fn policy(&self) -> TimestampPolicy {
        self.policy
    }

    /// Current reading of the clock source.
    pub fn current(&self) -> Timestamp {
        (self.source)()
    }

    /// A timestamp strictly greater than `now`.
    pub fn next_after(&self, now: Timestamp) -> Timestamp {
        let sampled = self.current();
        if sampled > now {
            return sampled;
        }
        if let TimestampPolicy::WaitForWallClock { max_wait_ms } = self.policy {
            let mut waited = 0;
            while waited < max_wait_ms {
                std::thread::sleep(Duration::from_millis(1));
                waited += 1;
                let sampled = self.current();
                if sampled > now {
                    return sampled;
                }
            }
        }
        now.saturating_add(1)
    }
}

impl Default for CommitClock {
    fn default() -> Self {
        Self::new(TimestampPolicy::default())
    }
}

impl std::fmt::Debug for CommitClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitClock")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
