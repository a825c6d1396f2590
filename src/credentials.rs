//! API key lookup. Keys are fetched on demand and never logged.

use std::collections::HashMap;
use log::debug;
use parking_lot::RwLock;

/// Supplies a per-provider API key on demand.
pub trait CredentialProvider: Send + Sync
{   fn api_key(&self, provider: crate::Provider) -> Option<String>;
}

/// In-memory keys, replaceable at runtime.
#[derive(Default)]
pub struct StaticCredentials
{   keys: RwLock<HashMap<crate::Provider, String>>
}

impl StaticCredentials
{   pub fn new() -> Self
    {   StaticCredentials::default()
    }

    /// Builder-style insert
    pub fn with_key(
      self
    , provider: crate::Provider
    , key: impl Into<String>
    ) -> Self
    {   self.set_key(provider, key);
        self
    }

    pub fn set_key(
      &self
    , provider: crate::Provider
    , key: impl Into<String>
    )
    {   debug!("Setting API key for: {}", provider);
        self.keys.write().insert(provider, key.into());
    }

    pub fn remove_key(&self, provider: crate::Provider)
    {   debug!("Removing API key for: {}", provider);
        self.keys.write().remove(&provider);
    }
}

impl CredentialProvider for StaticCredentials
{   fn api_key(&self, provider: crate::Provider) -> Option<String>
    {   self.keys.read().get(&provider).cloned()
    }
}

/// Reads `OPENAI_API_KEY` / `ANTHROPIC_API_KEY` at call time.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl EnvCredentials
{   pub fn variable(provider: crate::Provider) -> &'static str
    {   match provider
        {   crate::Provider::OpenAi => "OPENAI_API_KEY"
          , crate::Provider::Anthropic => "ANTHROPIC_API_KEY"
        }
    }
}

impl CredentialProvider for EnvCredentials
{   fn api_key(&self, provider: crate::Provider) -> Option<String>
    {   std::env::var(EnvCredentials::variable(provider))
          .ok()
          .filter(|key| !key.trim().is_empty())
    }
}
