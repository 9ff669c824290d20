//! Time sources
//!
//! The kernel reads the current time in microseconds through [`Clock`].
//! [`MonotonicClock`] follows host time; [`ManualClock`] only moves when told to,
//! which keeps timer tests deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of the current system time
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary, fixed origin
    fn now_micros(&self) -> u64;
}

/// Host monotonic time, measured from construction
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
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
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Clock driven entirely by the caller
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now: AtomicU64::new(start_us),
        }
    }

    pub fn set(&self, now_us: u64) {
        self.now.store(now_us, Ordering::SeqCst);
    }

    /// Move time forward, returning the new value
    pub fn advance(&self, delta_us: u64) -> u64 {
        self.now.fetch_add(delta_us, Ordering::SeqCst) + delta_us
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
