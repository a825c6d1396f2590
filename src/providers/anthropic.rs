use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::SseDecoder;
use crate::transport::{HttpRequest, HttpTransport};

pub const ANTHROPIC_API_BASE: &str
  = "https://api.anthropic.com/v1";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

// ===== Message Types =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage
{   pub role: String
  , pub content: String
}

#[derive(Debug, Clone, Serialize)]
pub struct AnthropicRequest
{   pub model: String
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>
  , pub messages: Vec<AnthropicMessage>
  , pub max_tokens: u32
  , pub temperature: f32
  , pub stream: bool
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicResponse
{   #[serde(default)]
    pub model: Option<String>
  , pub content: Vec<ContentBlock>
  , #[serde(default)]
    pub stop_reason: Option<String>
  , #[serde(default)]
    pub usage: Option<AnthropicUsage>
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock
{   #[serde(rename = "type")]
    pub block_type: String
  , #[serde(default)]
    pub text: Option<String>
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AnthropicUsage
{   #[serde(default)]
    pub input_tokens: Option<u32>
  , #[serde(default)]
    pub output_tokens: Option<u32>
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicErrorResponse
{   pub error: AnthropicErrorBody
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicErrorBody
{   #[serde(rename = "type")]
    pub error_type: String
  , pub message: String
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageStart
{   #[serde(default)]
    pub usage: AnthropicUsage
}

/// Events of the messages streaming API
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent
{   MessageStart
    {   message: MessageStart
    }
  , ContentBlockDelta
    {   delta: BlockDelta
    }
  , MessageDelta
    {   #[serde(default)]
        usage: AnthropicUsage
    }
  , MessageStop
  , Error
    {   error: AnthropicErrorBody
    }
  , #[serde(other)]
    Other
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta
{   TextDelta
    {   text: String
    }
  , #[serde(other)]
    Other
}

fn error_message(body: &str) -> String
{   serde_json::from_str::<AnthropicErrorResponse>(body)
      .map(|e| e.error.message)
      .unwrap_or_else(|_| body.trim().to_string())
}

fn decoding_error(message: impl Into<String>) -> crate::error::Error
{   let message = message.into();
    error!("Anthropic decoding error: {}", message);
    crate::error::Error::Decoding
    {   provider: crate::Provider::Anthropic
      , message
    }
}

// ===== Anthropic Client =====

/// Anthropic messages API client
pub struct AnthropicClient
{   transport: Arc<dyn HttpTransport>
  , credentials: Arc<dyn crate::credentials::CredentialProvider>
  , api_base: String
  , timeout: Option<Duration>
  , models: Vec<crate::ModelInfo>
}

impl AnthropicClient
{   pub fn new(
      transport: Arc<dyn HttpTransport>
    , credentials: Arc<dyn crate::credentials::CredentialProvider>
    ) -> Self
    {   debug!("Creating AnthropicClient");
        AnthropicClient
        {   transport
          , credentials
          , api_base: ANTHROPIC_API_BASE.to_string()
          , timeout: None
          , models: default_models()
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self
    {   self.api_base = api_base.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self
    {   self.timeout = timeout;
        self
    }

    pub fn with_models(mut self, models: Vec<crate::ModelInfo>) -> Self
    {   self.models = models;
        self
    }

    fn model(
      &self
    , name: &str
    ) -> Result<&crate::ModelInfo, crate::error::Error>
    {   crate::providers::ProviderClient::model_info(self, name)
          .ok_or_else(|| crate::error::Error::Validation(format!(
            "unknown anthropic model: {}", name
          )))
    }

    /// System turns move to the top-level `system` field; the rest keep
    /// their order.
    fn build_payload(
      &self
    , request: &crate::AiRequest
    , stream: bool
    ) -> AnthropicRequest
    {   let system: Vec<&str> = request.messages
          .iter()
          .filter(|m| m.role == crate::Role::System)
          .map(|m| m.content.as_str())
          .collect();

        AnthropicRequest
        {   model: request.model.clone()
          , system: (!system.is_empty()).then(|| system.join("\n\n"))
          , messages: request.messages
              .iter()
              .filter(|m| m.role != crate::Role::System)
              .map(|m| AnthropicMessage
              {   role: m.role.as_str().to_string()
                , content: m.content.clone()
              })
              .collect()
          , max_tokens: request.max_tokens
          , temperature: request.temperature
          , stream
        }
    }

    fn http_request(
      &self
    , payload: &AnthropicRequest
    ) -> Result<HttpRequest, crate::error::Error>
    {   let api_key = super::require_key(
          self.credentials.as_ref(),
          crate::Provider::Anthropic
        )?;
        let body = serde_json::to_value(payload).map_err(|e| {
          crate::error::Error::Validation(e.to_string())
        })?;
        Ok(HttpRequest
        {   url: super::endpoint(&self.api_base, "messages")
          , headers: vec![
              ("x-api-key".to_string(), api_key)
            , ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string())
            , ("content-type".to_string(), "application/json".to_string())
            ]
          , body
          , timeout: self.timeout
        })
    }

    fn parse_response(
      &self
    , request: &crate::AiRequest
    , body: &str
    ) -> Result<crate::AiResponse, crate::error::Error>
    {   let response: AnthropicResponse = serde_json::from_str(body)
          .map_err(|e| decoding_error(e.to_string()))?;

        let texts: Vec<String> = response.content
          .into_iter()
          .filter(|block| block.block_type == "text")
          .filter_map(|block| block.text)
          .collect();
        if texts.is_empty()
        {   return Err(decoding_error("no text content in response"));
        }
        let content = texts.concat();

        let info = self.model(&request.model)?;
        let reported = response.usage.unwrap_or_default();
        let prompt_tokens = reported.input_tokens
          .unwrap_or_else(|| request.estimated_prompt_tokens());
        let completion_tokens = reported.output_tokens
          .unwrap_or_else(|| crate::request::estimate_tokens(&content));

        trace!("Anthropic stop reason: {:?}", response.stop_reason);
        Ok(crate::AiResponse
        {   usage: crate::Usage::priced(
              prompt_tokens, completion_tokens, info
            )
          , content
          , provider: crate::Provider::Anthropic
          , model: response.model
              .unwrap_or_else(|| request.model.clone())
        })
    }
}

#[async_trait]
impl crate::providers::ProviderClient for AnthropicClient
{   fn provider(&self) -> crate::Provider
    {   crate::Provider::Anthropic
    }

    fn models(&self) -> &[crate::ModelInfo]
    {   &self.models
    }

    fn validate(
      &self
    , request: &crate::AiRequest
    ) -> Result<(), crate::error::Error>
    {   let info = self.model(&request.model)?;
        request.validate(info)?;
        if request.messages.iter().all(|m| m.role == crate::Role::System)
        {   return Err(crate::error::Error::Validation(
              "anthropic requests need at least one user turn".to_string()
            ));
        }
        Ok(())
    }

    async fn call(
      &self
    , request: &crate::AiRequest
    ) -> Result<crate::AiResponse, crate::error::Error>
    {   debug!("Anthropic call for: {}", request.model);
        let payload = self.build_payload(request, false);
        trace!("Anthropic request: {} messages", payload.messages.len());

        let response = self.transport
          .post_json(self.http_request(&payload)?)
          .await?;

        if !response.is_success()
        {   return Err(super::error_for_status(
              crate::Provider::Anthropic,
              response.status,
              response.retry_after,
              error_message(&response.body)
            ));
        }

        self.parse_response(request, &response.body)
    }

    async fn call_stream(
      &self
    , request: &crate::AiRequest
    , chunks: crate::ChunkSender
    , cancel: CancellationToken
    ) -> Result<crate::StreamOutcome, crate::error::Error>
    {   debug!("Anthropic stream for: {}", request.model);
        let info = self.model(&request.model)?.clone();
        let payload = self.build_payload(request, true);

        let http = self.http_request(&payload)?;
        let response = tokio::select!
        { biased;
          _ = cancel.cancelled() => {
            debug!("Anthropic stream cancelled before headers");
            return Ok(crate::StreamOutcome::Cancelled);
          }
        , response = self.transport.post_stream(http) => response?
        };

        if !response.is_success()
        {   let status = response.status;
            let retry_after = response.retry_after;
            let body = response.collect_body().await;
            return Err(super::error_for_status(
              crate::Provider::Anthropic,
              status,
              retry_after,
              error_message(&body)
            ));
        }

        let mut body = response.body;
        let mut decoder = SseDecoder::new();
        let mut content = String::new();
        let mut prompt_tokens: Option<u32> = None;
        let mut completion_tokens: Option<u32> = None;

        'read: loop
        { let bytes = tokio::select!
          { biased;
            _ = cancel.cancelled() => {
              debug!("Anthropic stream cancelled");
              return Ok(crate::StreamOutcome::Cancelled);
            }
          , next = body.next() => next
          };

          let (events, ended) = match bytes
          {   Some(Ok(bytes)) => (decoder.push(&bytes), false)
            , Some(Err(e)) => return Err(e)
            , None => (decoder.finish().into_iter().collect(), true)
          };

          for event in &events
          {   let parsed: StreamEvent = serde_json::from_str(&event.data)
                .map_err(|e| decoding_error(e.to_string()))?;
              match parsed
              {   StreamEvent::MessageStart { message } => {
                    prompt_tokens = message.usage.input_tokens;
                  }
                , StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::TextDelta { text }
                  } => {
                    if cancel.is_cancelled()
                      || chunks.send(text.clone()).is_err()
                    {   debug!("Anthropic stream receiver gone");
                        return Ok(crate::StreamOutcome::Cancelled);
                    }
                    content.push_str(&text);
                  }
                , StreamEvent::ContentBlockDelta { .. } => {}
                , StreamEvent::MessageDelta { usage } => {
                    if usage.output_tokens.is_some()
                    {   completion_tokens = usage.output_tokens;
                    }
                  }
                , StreamEvent::MessageStop => break 'read
                , StreamEvent::Error { error } => {
                    warn!("Anthropic stream error: {}", error.message);
                    return Err(match error.error_type.as_str()
                    {   "overloaded_error" | "api_error" => {
                          crate::error::Error::ProviderServer
                          {   provider: crate::Provider::Anthropic
                            , status: 529
                            , message: error.message
                          }
                        }
                      , "rate_limit_error" => {
                          crate::error::Error::RemoteRateLimitExceeded
                          {   provider: crate::Provider::Anthropic
                            , retry_after: None
                            , message: error.message
                          }
                        }
                      , _ => decoding_error(error.message)
                    });
                  }
                , StreamEvent::Other => {}
              }
          }

          // body closed without message_stop
          if ended
          {   return Err(decoding_error("stream ended before completion"));
          }
        }

        let usage = match (prompt_tokens, completion_tokens)
        {   (Some(prompt), Some(completion)) => {
              crate::Usage::priced(prompt, completion, &info)
            }
          , _ => crate::Usage::default()
        };

        trace!("Anthropic stream finished, {} chars", content.len());
        Ok(crate::StreamOutcome::Completed(crate::AiResponse
        {   content
          , provider: crate::Provider::Anthropic
          , model: request.model.clone()
          , usage
        }))
    }
}

fn model_info(
  name: &str
, max_output_tokens: u32
, input_cost: f64
, output_cost: f64
) -> crate::ModelInfo
{   crate::ModelInfo
    {   name: name.to_string()
      , provider: crate::Provider::Anthropic
      , max_context_tokens: 200_000
      , max_output_tokens
      , max_temperature: 1.0
      , supports_streaming: true
      , cost_per_million_input_tokens: input_cost
      , cost_per_million_output_tokens: output_cost
    }
}

/// Static price table for Anthropic models
pub fn default_models() -> Vec<crate::ModelInfo>
{   vec![
      model_info("claude-3-5-sonnet-20241022", 8_192, 3.00, 15.00)
    , model_info("claude-3-5-haiku-20241022", 8_192, 0.80, 4.00)
    , model_info("claude-3-opus-20240229", 4_096, 15.00, 75.00)
    ]
}
