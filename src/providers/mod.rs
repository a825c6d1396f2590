//! LLM provider implementations

pub mod anthropic;
pub mod openai;
pub(crate) mod sse_decoder;

use std::time::Duration;
use async_trait::async_trait;
use log::warn;
use tokio_util::sync::CancellationToken;

// Re-export for convenience
pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;
pub(crate) use sse_decoder::{SseDecoder, SseEvent};

/// One remote backend: wire mapping, error translation and pricing.
#[async_trait]
pub trait ProviderClient: Send + Sync
{   fn provider(&self) -> crate::Provider;

    /// Static model table, including prices.
    fn models(&self) -> &[crate::ModelInfo];

    fn model_info(&self, model: &str) -> Option<&crate::ModelInfo>
    {   self.models().iter().find(|m| m.name == model)
    }

    /// Reject requests this provider cannot serve, before any cost.
    fn validate(
      &self
    , request: &crate::AiRequest
    ) -> Result<(), crate::error::Error>
    {   let info = self.model_info(&request.model)
          .ok_or_else(|| crate::error::Error::Validation(format!(
            "unknown {} model: {}",
            self.provider(),
            request.model
          )))?;
        request.validate(info)
    }

    async fn call(
      &self
    , request: &crate::AiRequest
    ) -> Result<crate::AiResponse, crate::error::Error>;

    /// Forward each text delta to `chunks` in arrival order until the
    /// stream ends or `cancel` fires.
    async fn call_stream(
      &self
    , request: &crate::AiRequest
    , chunks: crate::ChunkSender
    , cancel: CancellationToken
    ) -> Result<crate::StreamOutcome, crate::error::Error>;
}

/// Translate a non-2xx status into the shared taxonomy.
pub(crate) fn error_for_status(
  provider: crate::Provider
, status: u16
, retry_after: Option<Duration>
, message: String
) -> crate::error::Error
{   use crate::error::Error;

    warn!("{} returned {}: {}", provider, status, message);
    match status
    {   401 | 403 => Error::Authentication { provider, message }
      , 429 => Error::RemoteRateLimitExceeded
        {   provider
          , retry_after
          , message
        }
      , 500..=599 => Error::ProviderServer
        {   provider
          , status
          , message
        }
      , _ => Error::ProviderClient
        {   provider
          , status
          , message
        }
    }
}

/// Fetch the API key or fail with `MissingApiKey`.
pub(crate) fn require_key(
  credentials: &dyn crate::credentials::CredentialProvider
, provider: crate::Provider
) -> Result<String, crate::error::Error>
{   credentials.api_key(provider).ok_or_else(|| {
      warn!("No API key for: {}", provider);
      crate::error::Error::MissingApiKey(provider)
    })
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn endpoint(base: &str, path: &str) -> String
{   format!(
      "{}/{}",
      base.trim_end_matches('/'),
      path.trim_start_matches('/')
    )
}
