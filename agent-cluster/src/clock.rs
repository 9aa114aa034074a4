//! Time source used by the coordinator.

use std::fmt;
use std::time::Instant;

/// Monotonic time source.
///
/// The coordinator never calls `Instant::now()` directly, so heartbeat
/// staleness can be driven by a manual clock in tests.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current monotonic time
    fn now(&self) -> Instant;
}

/// Clock backed by `Instant::now()`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
