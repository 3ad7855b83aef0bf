//! Millisecond clocks
//!
//! The authority engine measures handoff and release phases against a
//! monotonic clock. The desired-state engine stamps documents that outlive
//! the process, so it defaults to wall time. Both go through [`Clock`] so
//! tests and simulations can drive time by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds on some clock's timeline
pub type Millis = u64;

/// Source of millisecond timestamps
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Millis;
}

/// Monotonic clock - never jumps backwards, origin is construction time
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> Millis {
        self.origin.elapsed().as_millis() as Millis
    }
}

/// Wall clock - milliseconds since the UNIX epoch
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        // A clock set before 1970 reads as zero rather than failing.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Millis)
            .unwrap_or(0)
    }
}

/// Hand-driven clock for tests and simulation
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        ManualClock {
            now: AtomicU64::new(start),
        }
    }

    /// Move time forward by `ms`
    pub fn advance(&self, ms: Millis) -> Millis {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }

    /// Jump to an absolute time
    pub fn set(&self, ms: Millis) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

/// Time elapsed between `since` and `now`, zero if `now` is earlier
#[inline]
pub fn elapsed_ms(now: Millis, since: Millis) -> Millis {
    now.saturating_sub(since)
}
