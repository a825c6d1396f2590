pub mod error;
pub mod config;
pub mod clock;
pub mod credentials;
pub mod transport;
pub mod providers;
pub mod request;
pub mod rate_limit;
pub mod cache;
pub mod template;
pub mod manager;
pub mod retry;
pub mod client;
use serde::{Deserialize, Serialize};

/*

ai-orchestrator: one request syntax over a GPT-style provider and an
Anthropic-style provider, with the cross-cutting pieces the raw APIs
leave to the caller.

src/
├── lib.rs          # Shared types and the channel API
├── error.rs        # Error taxonomy
├── config.rs       # Orchestrator, cache and provider configuration
├── clock.rs        # Injectable time source
├── credentials.rs  # API key lookup
├── transport.rs    # HTTP request / byte stream capability
├── providers/      # Wire mapping per provider
│   ├── mod.rs
│   ├── sse_decoder.rs
│   ├── openai.rs
│   └── anthropic.rs
├── request.rs      # Messages, requests, responses, usage
├── rate_limit.rs   # Sliding-window admission
├── cache.rs        # Fingerprinted response cache
├── template.rs     # Prompt templates
├── manager.rs      # The pipeline
├── retry.rs        # Caller-side backoff
└── client.rs       # Channel-driven backend task

*/

pub use cache::ResponseCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestratorConfig;
pub use credentials::{CredentialProvider, EnvCredentials, StaticCredentials};
pub use error::{Error, TemplateError};
pub use manager::{AiManager, AiManagerBuilder};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use request::{
  AiRequest, AiResponse, Message, Role, StreamOutcome, Usage
};
pub use template::{PromptTemplate, TemplateEngine};
pub use client::AiBackend;

/// ORCHESTRATOR API INTERFACE:

pub type ChunkSender = tokio::sync::mpsc::UnboundedSender<String>;

pub type ResponseReply = Result<crate::AiResponse, crate::error::Error>;
pub type ResponseReplySender
  = tokio::sync::mpsc::UnboundedSender<ResponseReply>;

// ===== SendMessage =====

pub struct SendMessageArgs
{   pub text: String
  , pub provider: Option<crate::Provider>
  , pub temperature: f32
  , pub max_tokens: u32
  , pub reply: ResponseReplySender
}

// ===== ContinueConversation =====

pub struct ContinueConversationArgs
{   pub history: Vec<crate::Message>
  , pub user_message: String
  , pub provider: Option<crate::Provider>
  , pub reply: ResponseReplySender
}

// ===== ExecuteTemplate =====

pub struct ExecuteTemplateArgs
{   pub template: String
  , pub variables: std::collections::HashMap<String, String>
  , pub provider: Option<crate::Provider>
  , pub reply: ResponseReplySender
}

// ===== StreamMessage =====

pub type StreamReply
  = Result<crate::StreamOutcome, crate::error::Error>;
pub type StreamReplySender
  = tokio::sync::mpsc::UnboundedSender<StreamReply>;

pub struct StreamMessageArgs
{   pub text: String
  , pub provider: Option<crate::Provider>
  , pub chunks: ChunkSender
  , pub cancel: tokio_util::sync::CancellationToken
  , pub reply: StreamReplySender
}

// ===== SetDefaultProvider =====

pub type UnitReply = Result<(), crate::error::Error>;
pub type UnitReplySender
  = tokio::sync::mpsc::UnboundedSender<UnitReply>;

pub struct SetDefaultProviderArgs
{   pub provider: crate::Provider
  , pub reply: UnitReplySender
}

// ===== ClearCache =====

pub struct ClearCacheArgs
{   pub reply: UnitReplySender
}

// ===== GetModelLists =====

pub type GetModelListsReply
  = Result<Vec<crate::ModelInfo>, crate::error::Error>;
pub type GetModelListsReplySender
  = tokio::sync::mpsc::UnboundedSender<GetModelListsReply>;

pub struct GetModelListsArgs
{   pub reply: GetModelListsReplySender
}

// ===== KillProcess =====

pub struct KillProcessArgs
{   pub reply: UnitReplySender
}

// ===== BackendHand (sender side) =====

pub struct BackendHand
{   pub send_message_tx
      : tokio::sync::mpsc::UnboundedSender<SendMessageArgs>
  , pub continue_conversation_tx
      : tokio::sync::mpsc::UnboundedSender<ContinueConversationArgs>
  , pub execute_template_tx
      : tokio::sync::mpsc::UnboundedSender<ExecuteTemplateArgs>
  , pub stream_message_tx
      : tokio::sync::mpsc::UnboundedSender<StreamMessageArgs>
  , pub set_default_provider_tx
      : tokio::sync::mpsc::UnboundedSender<SetDefaultProviderArgs>
  , pub clear_cache_tx
      : tokio::sync::mpsc::UnboundedSender<ClearCacheArgs>
  , pub get_model_lists_tx
      : tokio::sync::mpsc::UnboundedSender<GetModelListsArgs>
  , pub kill_process_tx
      : tokio::sync::mpsc::UnboundedSender<KillProcessArgs>
}

// ===== BackendFoot (receiver side) =====

pub struct BackendFoot
{   pub send_message_rx
      : tokio::sync::mpsc::UnboundedReceiver<SendMessageArgs>
  , pub continue_conversation_rx
      : tokio::sync::mpsc::UnboundedReceiver<ContinueConversationArgs>
  , pub execute_template_rx
      : tokio::sync::mpsc::UnboundedReceiver<ExecuteTemplateArgs>
  , pub stream_message_rx
      : tokio::sync::mpsc::UnboundedReceiver<StreamMessageArgs>
  , pub set_default_provider_rx
      : tokio::sync::mpsc::UnboundedReceiver<SetDefaultProviderArgs>
  , pub clear_cache_rx
      : tokio::sync::mpsc::UnboundedReceiver<ClearCacheArgs>
  , pub get_model_lists_rx
      : tokio::sync::mpsc::UnboundedReceiver<GetModelListsArgs>
  , pub kill_process_rx
      : tokio::sync::mpsc::UnboundedReceiver<KillProcessArgs>
}

/// ORCHESTRATOR STRUCTURES:

/// The remote text-generation backends unified by this crate.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize
)]
#[serde(rename_all = "lowercase")]
pub enum Provider
{
  /// OpenAI-style chat completions (GPT models)
  OpenAi
  ,
  /// Anthropic-style messages API (Claude models)
  Anthropic
}

impl Provider
{   pub const ALL: [Provider; 2]
      = [Provider::OpenAi, Provider::Anthropic];

    pub fn as_str(&self) -> &'static str
    {   match self
        {   Provider::OpenAi => "openai"
          , Provider::Anthropic => "anthropic"
        }
    }
}

impl std::fmt::Display for Provider
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>)
      -> std::fmt::Result
    {   f.write_str(self.as_str())
    }
}

/// Information about a model's limits and prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo
{   /// Wire name (e.g., "gpt-4o-mini", "claude-3-5-haiku-20241022")
    pub name: String
  , /// Provider of the model
    pub provider: crate::Provider
  , /// Maximum context window (in tokens)
    pub max_context_tokens: u32
  , /// Maximum tokens the model can generate in response
    pub max_output_tokens: u32
  , /// Highest sampling temperature the provider accepts
    pub max_temperature: f32
  , /// Whether the model supports streaming responses
    pub supports_streaming: bool
  , /// Cost per 1M input tokens (in USD)
    pub cost_per_million_input_tokens: f64
  , /// Cost per 1M output tokens (in USD)
    pub cost_per_million_output_tokens: f64
}

impl ModelInfo
{   /// USD cost of a call with the given token counts.
    pub fn cost(
      &self
    , prompt_tokens: u32
    , completion_tokens: u32
    ) -> f64
    {   (prompt_tokens as f64 * self.cost_per_million_input_tokens
          + completion_tokens as f64
            * self.cost_per_million_output_tokens)
          / 1_000_000.0
    }
}
