//! Injectable time source for window and TTL arithmetic

use std::time::{Duration, Instant};
use parking_lot::Mutex;

/// Monotonic time source shared by the rate limiter and the cache.
pub trait Clock: Send + Sync
{   fn now(&self) -> Instant;
}

/// Wall clock backed by `Instant::now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock
{   fn now(&self) -> Instant
    {   Instant::now()
    }
}

/// Clock that only moves when told to. Used by tests.
#[derive(Debug)]
pub struct ManualClock
{   origin: Instant
  , offset: Mutex<Duration>
}

impl ManualClock
{   pub fn new() -> Self
    {   ManualClock
        {   origin: Instant::now()
          , offset: Mutex::new(Duration::ZERO)
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration)
    {   *self.offset.lock() += by;
    }

    /// Time elapsed since construction.
    pub fn elapsed(&self) -> Duration
    {   *self.offset.lock()
    }
}

impl Default for ManualClock
{   fn default() -> Self
    {   ManualClock::new()
    }
}

impl Clock for ManualClock
{   fn now(&self) -> Instant
    {   self.origin + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests
{   use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced()
    {   let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(61));
        assert_eq!(clock.now() - start, Duration::from_secs(61));
        assert_eq!(clock.elapsed(), Duration::from_secs(61));
    }
}
