use std::time::Duration;

/// Errors raised while rendering a prompt template
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError
{   /// A declared variable was not supplied
    #[error("missing template variable: {0}")]
    MissingVariable(String)
  , /// No template registered under this name
    #[error("unknown template: {0}")]
    UnknownTemplate(String)
}

/// Custom error type for orchestrator operations
/// Implements Clone for sending through channels
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error
{   /// Malformed request, rejected before any network or budget cost
    #[error("invalid request: {0}")]
    Validation(String)
  , /// Local rate-limit budget exhausted
    #[error(
      "local rate limit exceeded for {provider}, retry after {retry_after:?}"
    )]
    RateLimitExceeded
    {   provider: crate::Provider
      , retry_after: Duration
    }
  , /// The provider answered 429
    #[error("{provider} rate limit exceeded: {message}")]
    RemoteRateLimitExceeded
    {   provider: crate::Provider
      , retry_after: Option<Duration>
      , message: String
    }
  , /// Credentials were rejected
    #[error("{provider} authentication failed: {message}")]
    Authentication
    {   provider: crate::Provider
      , message: String
    }
  , /// No API key available for a provider
    #[error("missing API key for {0}")]
    MissingApiKey(crate::Provider)
  , /// 5xx from the provider
    #[error("{provider} server error {status}: {message}")]
    ProviderServer
    {   provider: crate::Provider
      , status: u16
      , message: String
    }
  , /// Non-auth, non-429 4xx from the provider
    #[error("{provider} client error {status}: {message}")]
    ProviderClient
    {   provider: crate::Provider
      , status: u16
      , message: String
    }
  , /// Connection failure or broken transport
    #[error("network error: {0}")]
    Network(String)
  , /// Request abandoned after the configured timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration)
  , #[error(transparent)]
    Template(#[from] TemplateError)
  , /// Unexpected provider response shape
    #[error("failed to decode {provider} response: {message}")]
    Decoding
    {   provider: crate::Provider
      , message: String
    }
  , /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String)
  , /// Backend task is gone
    #[error("backend disconnected")]
    BackendClosed
}

impl Error
{   /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool
    {   match self
        {   Error::RateLimitExceeded { .. }
          | Error::RemoteRateLimitExceeded { .. }
          | Error::ProviderServer { .. }
          | Error::Network(_)
          | Error::Timeout(_) => true
          , Error::ProviderClient { status, .. } => *status == 408
          , _ => false
        }
    }

    /// Retry-after hint carried by rate-limit errors.
    pub fn retry_after(&self) -> Option<Duration>
    {   match self
        {   Error::RateLimitExceeded { retry_after, .. } => {
              Some(*retry_after)
            }
          , Error::RemoteRateLimitExceeded { retry_after, .. } => {
              *retry_after
            }
          , _ => None
        }
    }
}
