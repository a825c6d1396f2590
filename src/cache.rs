//! Fingerprinted response cache with lazy TTL expiry and an LRU bound

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, trace};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex SHA-256 over the cache-relevant request fields
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint
{   pub fn as_str(&self) -> &str
    {   &self.0
    }
}

impl std::fmt::Display for Fingerprint
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>)
      -> std::fmt::Result
    {   f.write_str(&self.0)
    }
}

#[derive(Serialize)]
struct FingerprintInput<'a>
{   provider: crate::Provider
  , model: &'a str
  , temperature_bits: u32
  , max_tokens: u32
  , messages: &'a [crate::Message]
}

/// Stable over `(provider, model, temperature, max_tokens, messages)`.
pub fn fingerprint(
  request: &crate::AiRequest
, provider: crate::Provider
) -> Fingerprint
{   let input = FingerprintInput
    {   provider
      , model: &request.model
      , temperature_bits: request.temperature.to_bits()
      , max_tokens: request.max_tokens
      , messages: &request.messages
    };
    let mut hasher = Sha256::new();
    // plain data: serialization cannot fail
    let serialized = serde_json::to_vec(&input).unwrap_or_default();
    hasher.update(&serialized);
    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// A cached response. Replaced, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry
{   pub key: Fingerprint
  , pub value: crate::AiResponse
  , pub created_at: Instant
  , pub ttl: Duration
}

impl CacheEntry
{   fn is_expired(&self, now: Instant) -> bool
    {   now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// Shared by concurrent callers; last writer wins per fingerprint.
pub struct ResponseCache
{   clock: Arc<dyn crate::clock::Clock>
  , entries: Mutex<LruCache<Fingerprint, CacheEntry>>
}

impl ResponseCache
{   pub fn new(
      clock: Arc<dyn crate::clock::Clock>
    , max_entries: NonZeroUsize
    ) -> Self
    {   debug!("Creating ResponseCache with {} slots", max_entries);
        ResponseCache
        {   clock
          , entries: Mutex::new(LruCache::new(max_entries))
        }
    }

    /// Hit refreshes recency; an expired entry is removed and reported as
    /// a miss.
    pub fn get(&self, key: &Fingerprint) -> Option<crate::AiResponse>
    {   let now = self.clock.now();
        let mut entries = self.entries.lock();
        let expired = entries.peek(key)?.is_expired(now);
        if expired
        {   trace!("Cache entry expired: {}", key);
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn put(
      &self
    , key: Fingerprint
    , value: crate::AiResponse
    , ttl: Duration
    )
    {   let entry = CacheEntry
        {   key: key.clone()
          , value
          , created_at: self.clock.now()
          , ttl
        };
        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key, entry)
        {   trace!("Cache slot reclaimed: {}", evicted);
        }
    }

    pub fn clear(&self)
    {   debug!("Clearing response cache");
        self.entries.lock().clear();
    }

    /// Drop every expired entry, returning how many went.
    pub fn purge_expired(&self) -> usize
    {   let now = self.clock.now();
        let mut entries = self.entries.lock();
        let expired: Vec<Fingerprint> = entries
          .iter()
          .filter(|(_, entry)| entry.is_expired(now))
          .map(|(key, _)| key.clone())
          .collect();
        for key in &expired
        {   entries.pop(key);
        }
        debug!("Purged {} expired cache entries", expired.len());
        expired.len()
    }

    pub fn len(&self) -> usize
    {   self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool
    {   self.len() == 0
    }
}
