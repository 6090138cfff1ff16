//! Deterministic time abstraction.
//!
//! Every timestamp the kernel produces flows through an injected [`Clock`].
//! Production code uses [`SystemClock`]; tests and simulations use
//! [`FixedClock`], which can be advanced or pinned to reproduce exact
//! transcripts.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::RwLock;

/// Clock interface for deterministic time handling.
///
/// Implementations must be cheap to call; freshness-sensitive operations
/// re-read `now()` instead of caching it.
pub trait Clock: Send + Sync {
    /// Current time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock using actual wall time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock for deterministic testing.
///
/// Starts at 2023-01-01T12:00:00Z unless given an explicit start time.
/// Shared handles (`Arc<FixedClock>`) observe advances immediately.
pub struct FixedClock {
    current: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new() -> Self {
        Self::starting_at(Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        FixedClock {
            current: RwLock::new(start),
        }
    }

    /// Advance the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut guard = self.current.write();
        *guard += delta;
    }

    /// Pin the clock to a specific instant.
    pub fn set_time(&self, new_time: DateTime<Utc>) {
        *self.current.write() = new_time;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read()
    }
}

/// Shared clock handle used by stateful services.
pub type SharedClock = Arc<dyn Clock>;
