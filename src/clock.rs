//! Lamport logical clock and Berkeley physical-clock offset.
//!
//! Grounded on `examples/original_source/reference/reference.py`
//! (`increment_clock`/`update_clock`) and the mutex-guarded counters in the
//! teacher's `src/state/tracker.rs`.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide Lamport clock. `tick` advances on local events, `merge`
/// advances on receive to preserve happens-before ordering.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: Mutex<u64>,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(0),
        }
    }

    /// Advance the clock for a local event and return the new value.
    pub fn tick(&self) -> u64 {
        let mut guard = self.value.lock().expect("lamport clock poisoned");
        *guard += 1;
        *guard
    }

    /// Merge a received timestamp in, per `L <- max(L, received) + 1`.
    pub fn merge(&self, received: u64) -> u64 {
        let mut guard = self.value.lock().expect("lamport clock poisoned");
        *guard = guard.max(&received) + 1;
        *guard
    }

    pub fn current(&self) -> u64 {
        *self.value.lock().expect("lamport clock poisoned")
    }
}

/// Berkeley-adjusted physical clock: wall time plus an additive offset,
/// corrected periodically by the elected leader (SPEC_FULL.md §4.4).
#[derive(Debug, Default)]
pub struct PhysicalClock {
    offset_millis: Mutex<i64>,
}

impl PhysicalClock {
    pub fn new() -> Self {
        Self {
            offset_millis: Mutex::new(0),
        }
    }

    /// Current adjusted time as milliseconds since the Unix epoch.
    pub fn now_millis(&self) -> i64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis() as i64;
        wall + *self.offset_millis.lock().expect("physical clock poisoned")
    }

    /// Apply an additive correction (signed milliseconds) from a Berkeley round.
    pub fn adjust(&self, delta_millis: i64) {
        let mut guard = self.offset_millis.lock().expect("physical clock poisoned");
        *guard += delta_millis;
    }

    pub fn offset_millis(&self) -> i64 {
        *self.offset_millis.lock().expect("physical clock poisoned")
    }
}
