//! Time source for retries, settling and session deadlines.
//!
//! `SystemClock` measures wall time and really sleeps. `ManualClock` is the
//! test double: sleeping advances a virtual counter instantly, so retry and
//! deadline behaviour can be asserted without waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Millisecond clock with the ability to block.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary, fixed origin.
    fn now_ms(&self) -> u64;

    fn sleep_ms(&self, ms: u64);
}

/// Production clock backed by `Instant` and `std::thread::sleep`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: u64) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

/// Virtual clock. Records every sleep it was asked for.
pub struct ManualClock {
    now: AtomicU64,
    sleeps: Mutex<Vec<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            now: AtomicU64::new(0),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Move time forward without recording a sleep (e.g. slow remote calls).
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn sleeps(&self) -> Vec<u64> {
        match self.sleeps.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u64) {
        match self.sleeps.lock() {
            Ok(mut s) => s.push(ms),
            Err(poisoned) => poisoned.into_inner().push(ms),
        }
        self.advance(ms);
    }
}
