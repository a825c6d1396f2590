//! Caller-side retry policy.
//!
//! The orchestrator never retries on its own; callers that want backoff
//! ask the policy how long to wait before trying again.

use std::time::Duration;
use log::debug;

/// Exponential backoff honouring retry-after hints
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy
{   pub max_retries: usize
  , pub backoff_multiplier: f32
  , pub initial_backoff: Duration
  , pub max_backoff: Duration
}

impl RetryPolicy
{   /// Create a new retry policy
    pub fn new(
      max_retries: usize
    , backoff_multiplier: f32
    , initial_backoff_ms: u64
    ) -> Self
    {   RetryPolicy
        {   max_retries
          , backoff_multiplier
          , initial_backoff: Duration::from_millis(
              initial_backoff_ms
            )
          , max_backoff: Duration::from_secs(60)
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self
    {   self.max_backoff = max_backoff;
        self
    }

    /// Calculate backoff duration for attempt number
    pub fn backoff_for_attempt(
      &self
    , attempt: usize
    ) -> Duration
    {   debug!("Calculating backoff for attempt {}", attempt);
        let multiplier
          = self.backoff_multiplier.powi(attempt as i32);
        let millis = self.initial_backoff.as_millis() as f32
          * multiplier;
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    /// Delay before retry number `attempt` (0-based), or `None` when the
    /// error is not retryable or the attempts are used up.
    pub fn delay_for(
      &self
    , error: &crate::error::Error
    , attempt: usize
    ) -> Option<Duration>
    {   if attempt >= self.max_retries || !error.is_retryable()
        {   return None;
        }
        let backoff = self.backoff_for_attempt(attempt);
        Some(match error.retry_after()
        {   Some(hint) => hint.max(backoff)
          , None => backoff
        })
    }
}

impl Default for RetryPolicy
{   fn default() -> Self
    {   RetryPolicy::new(3, 2.0, 100)
    }
}
