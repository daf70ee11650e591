//! Clock abstraction
//!
//! Producers and consumers stamp every sync attempt, and writers stamp every
//! object they create. All of that goes through [`Clock`] so tests can run
//! against virtual time.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timestamp with millisecond resolution since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: i64) -> Self {
        Timestamp(ms)
    }

    /// Converts a wall-clock time; times before the epoch collapse to zero.
    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp(i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
            Err(_) => Timestamp::ZERO,
        }
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn to_system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.0.max(0) as u64)
    }

    /// Parses the decimal form stored in object metadata.
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<i64>().ok().map(Timestamp)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    fn now(&self) -> Timestamp;

    fn elapsed(&self, since: Timestamp) -> Duration {
        Duration::from_millis(self.now().0.saturating_sub(since.0).max(0) as u64)
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_system_time(SystemTime::now())
    }
}

/// Virtual clock for deterministic tests.
///
/// Time only moves when told to via `advance_ms()` or `set()`. Clones share
/// the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicI64>,
}

impl SimulatedClock {
    pub fn new(start_ms: i64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, time_ms: i64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.time_ms.load(Ordering::SeqCst))
    }
}

/// Default clock used when none is configured.
pub fn system_clock() -> SharedClock {
    Arc::new(ProductionClock)
}
