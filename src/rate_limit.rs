//! Sliding-window admission per provider.
//!
//! The limiter never sleeps. A denied call gets
//! `Error::RateLimitExceeded` with the time until the next slot opens and
//! the caller decides whether to wait.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Budget for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig
{   pub max_requests_per_window: u32
  , pub max_tokens_per_window: u64
  , pub window_secs: u64
}

impl RateLimitConfig
{   pub fn window(&self) -> Duration
    {   Duration::from_secs(self.window_secs)
    }

    /// Conservative defaults per provider
    pub fn default_for(provider: crate::Provider) -> Self
    {   match provider
        {   crate::Provider::OpenAi => RateLimitConfig
            {   max_requests_per_window: 60
              , max_tokens_per_window: 90_000
              , window_secs: 60
            }
          , crate::Provider::Anthropic => RateLimitConfig
            {   max_requests_per_window: 50
              , max_tokens_per_window: 40_000
              , window_secs: 60
            }
        }
    }
}

/// Remaining budget in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus
{   pub requests_remaining: u32
  , pub tokens_remaining: u64
}

/// Admitted calls inside the trailing window. Length never exceeds
/// `max_requests_per_window`.
#[derive(Debug, Default)]
struct RateWindow
{   entries: VecDeque<(Instant, u64)>
  , tokens_in_window: u64
}

impl RateWindow
{   fn purge(&mut self, now: Instant, window: Duration)
    {   while let Some((at, tokens)) = self.entries.front().copied()
        {   if now.saturating_duration_since(at) < window
            {   break;
            }
            self.entries.pop_front();
            self.tokens_in_window -= tokens;
        }
    }
}

struct ProviderBudget
{   config: RateLimitConfig
  , window: Mutex<RateWindow>
}

/// Per-provider request and token budgets. Each provider has its own lock.
pub struct RateLimiter
{   clock: Arc<dyn crate::clock::Clock>
  , budgets: HashMap<crate::Provider, ProviderBudget>
}

impl RateLimiter
{   pub fn new(
      clock: Arc<dyn crate::clock::Clock>
    , configs: HashMap<crate::Provider, RateLimitConfig>
    ) -> Self
    {   let budgets = crate::Provider::ALL
          .iter()
          .map(|provider| {
            let config = configs.get(provider).copied()
              .unwrap_or_else(|| RateLimitConfig::default_for(*provider));
            (*provider, ProviderBudget
            {   config
              , window: Mutex::new(RateWindow::default())
            })
          })
          .collect();
        RateLimiter
        {   clock
          , budgets
        }
    }

    fn budget(&self, provider: crate::Provider) -> &ProviderBudget
    {   // every provider is populated in `new`
        &self.budgets[&provider]
    }

    pub fn config(&self, provider: crate::Provider) -> RateLimitConfig
    {   self.budget(provider).config
    }

    /// Admit one call costing `estimated_tokens`, or say how long to wait.
    pub fn admit(
      &self
    , provider: crate::Provider
    , estimated_tokens: u64
    ) -> Result<(), crate::error::Error>
    {   let budget = self.budget(provider);
        let config = budget.config;
        let span = config.window();

        if estimated_tokens > config.max_tokens_per_window
        {   warn!(
              "{} call of ~{} tokens exceeds the {} token window",
              provider, estimated_tokens, config.max_tokens_per_window
            );
            return Err(crate::error::Error::Validation(format!(
              "request needs ~{} tokens, {} allows {} per window",
              estimated_tokens, provider, config.max_tokens_per_window
            )));
        }

        let now = self.clock.now();
        let mut window = budget.window.lock();
        window.purge(now, span);

        let requests_ok = (window.entries.len() as u64)
          < config.max_requests_per_window as u64;
        let tokens_ok = window.tokens_in_window + estimated_tokens
          <= config.max_tokens_per_window;

        if requests_ok && tokens_ok
        {   window.entries.push_back((now, estimated_tokens));
            window.tokens_in_window += estimated_tokens;
            debug!(
              "Admitted {} call: {} requests, {} tokens in window",
              provider, window.entries.len(), window.tokens_in_window
            );
            return Ok(());
        }

        let retry_after = retry_after(
          &window, &config, estimated_tokens, now, requests_ok
        );
        warn!(
          "Denied {} call, next slot in {:?}",
          provider, retry_after
        );
        Err(crate::error::Error::RateLimitExceeded
        {   provider
          , retry_after
        })
    }

    pub fn status(&self, provider: crate::Provider) -> RateLimitStatus
    {   let budget = self.budget(provider);
        let config = budget.config;
        let mut window = budget.window.lock();
        window.purge(self.clock.now(), config.window());
        RateLimitStatus
        {   requests_remaining: config.max_requests_per_window
              .saturating_sub(window.entries.len() as u32)
          , tokens_remaining: config.max_tokens_per_window
              .saturating_sub(window.tokens_in_window)
        }
    }

    /// Forget all admitted calls.
    pub fn reset(&self)
    {   debug!("Resetting rate limiter");
        for budget in self.budgets.values()
        {   *budget.window.lock() = RateWindow::default();
        }
    }
}

/// Earliest moment both the request and the token budget would fit.
fn retry_after(
  window: &RateWindow
, config: &RateLimitConfig
, estimated_tokens: u64
, now: Instant
, requests_ok: bool
) -> Duration
{   let span = config.window();
    let expiry = |at: Instant| (at + span).saturating_duration_since(now);

    let mut wait = Duration::ZERO;
    if !requests_ok
    {   // oldest entries must age out until one slot is free
        let excess = window.entries.len()
          + 1
          - config.max_requests_per_window as usize;
        if let Some((at, _)) = window.entries.get(excess - 1)
        {   wait = wait.max(expiry(*at));
        }
    }

    let mut tokens = window.tokens_in_window;
    for (at, cost) in &window.entries
    {   if tokens + estimated_tokens <= config.max_tokens_per_window
        {   break;
        }
        tokens -= cost;
        wait = wait.max(expiry(*at));
    }
    wait
}
