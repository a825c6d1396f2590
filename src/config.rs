//! Configuration for providers, cache and rate limits

use std::path::Path;
use std::time::Duration;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitConfig;

/// Provider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig
{   /// Which provider this block configures
    pub provider: crate::Provider
  , /// API base URL (if custom)
    #[serde(default)]
    pub api_base: Option<String>
  , /// Model used when a request leaves `model` empty
    pub default_model: String
  , /// HTTP timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>
  , /// Local admission budget
    pub rate_limit: RateLimitConfig
}

impl ProviderConfig
{   pub fn default_for(provider: crate::Provider) -> Self
    {   let default_model = match provider
        {   crate::Provider::OpenAi => "gpt-4o-mini"
          , crate::Provider::Anthropic => "claude-3-5-haiku-20241022"
        };
        ProviderConfig
        {   provider
          , api_base: None
          , default_model: default_model.to_string()
          , timeout_secs: None
          , rate_limit: RateLimitConfig::default_for(provider)
        }
    }

    pub fn timeout(&self) -> Option<Duration>
    {   self.timeout_secs.map(Duration::from_secs)
    }
}

/// Response cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig
{   /// Serve identical requests from memory
    pub enabled: bool
  , /// Entry lifetime in seconds
    pub ttl_secs: u64
  , /// LRU bound
    pub max_entries: usize
}

impl CacheConfig
{   pub fn ttl(&self) -> Duration
    {   Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig
{   fn default() -> Self
    {   CacheConfig
        {   enabled: true
          , ttl_secs: 300
          , max_entries: 500
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig
{   /// Provider used when a request does not name one
    pub default_provider: crate::Provider
  , /// Temperature for conversation and template calls
    pub default_temperature: f32
  , /// Max tokens for conversation and template calls
    pub default_max_tokens: u32
  , /// Abandon non-streaming provider calls after this long
    pub request_timeout_secs: Option<u64>
  , pub cache: CacheConfig
  , /// Provider configurations; missing providers use defaults
    pub providers: Vec<ProviderConfig>
}

impl Default for OrchestratorConfig
{   fn default() -> Self
    {   OrchestratorConfig
        {   default_provider: crate::Provider::OpenAi
          , default_temperature: 0.7
          , default_max_tokens: 1024
          , request_timeout_secs: Some(60)
          , cache: CacheConfig::default()
          , providers: crate::Provider::ALL
              .iter()
              .map(|p| ProviderConfig::default_for(*p))
              .collect()
        }
    }
}

impl OrchestratorConfig
{   pub fn from_json_str(
      json: &str
    ) -> Result<Self, crate::error::Error>
    {   let config: OrchestratorConfig = serde_json::from_str(json)
          .map_err(|e| {
            crate::error::Error::InvalidConfiguration(e.to_string())
          })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(
      path: impl AsRef<Path>
    ) -> Result<Self, crate::error::Error>
    {   let path = path.as_ref();
        debug!("Loading configuration from: {}", path.display());
        let json = std::fs::read_to_string(path).map_err(|e| {
          crate::error::Error::InvalidConfiguration(format!(
            "{}: {}", path.display(), e
          ))
        })?;
        OrchestratorConfig::from_json_str(&json)
    }

    /// Configuration for one provider, falling back to its defaults.
    pub fn provider(&self, provider: crate::Provider) -> ProviderConfig
    {   self.providers
          .iter()
          .find(|p| p.provider == provider)
          .cloned()
          .unwrap_or_else(|| ProviderConfig::default_for(provider))
    }

    pub fn request_timeout(&self) -> Option<Duration>
    {   self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), crate::error::Error>
    {   use crate::error::Error::InvalidConfiguration;

        if !(0.0..=2.0).contains(&self.default_temperature)
        {   return Err(InvalidConfiguration(format!(
              "default_temperature {} outside [0, 2]",
              self.default_temperature
            )));
        }
        if self.default_max_tokens == 0
        {   return Err(InvalidConfiguration(
              "default_max_tokens must be positive".to_string()
            ));
        }
        if self.request_timeout_secs == Some(0)
        {   return Err(InvalidConfiguration(
              "request_timeout_secs must be positive".to_string()
            ));
        }
        if self.cache.max_entries == 0
        {   return Err(InvalidConfiguration(
              "cache.max_entries must be positive".to_string()
            ));
        }
        for (i, provider) in self.providers.iter().enumerate()
        {   if self.providers[..i]
              .iter()
              .any(|p| p.provider == provider.provider)
            {   return Err(InvalidConfiguration(format!(
                  "{} configured twice",
                  provider.provider
                )));
            }
            if provider.default_model.trim().is_empty()
            {   return Err(InvalidConfiguration(format!(
                  "{} default_model is empty",
                  provider.provider
                )));
            }
            let limit = &provider.rate_limit;
            if limit.window_secs == 0
              || limit.max_requests_per_window == 0
              || limit.max_tokens_per_window == 0
            {   return Err(InvalidConfiguration(format!(
                  "{} rate limit must be positive",
                  provider.provider
                )));
            }
        }
        Ok(())
    }
}
