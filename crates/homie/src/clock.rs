use std::time::{Duration, Instant};

use time::OffsetDateTime;

/// Time source for the controller: a monotonic clock for interval math and a
/// wall clock for reporting.
pub trait Clock: Send + Sync {
    /// Elapsed time since the clock was created.
    fn monotonic(&self) -> Duration;
    fn wall(&self) -> OffsetDateTime;
}

pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }

    fn wall(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
