use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{SseDecoder, SseEvent};
use crate::transport::{HttpRequest, HttpTransport};

pub const OPENAI_API_BASE: &str
  = "https://api.openai.com/v1";

// ===== Message Types =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage
{   pub role: String
  , pub content: String
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamOptions
{   pub include_usage: bool
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiChatRequest
{   pub model: String
  , pub messages: Vec<ChatMessage>
  , pub max_tokens: u32
  , pub temperature: f32
  , pub stream: bool
  , #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChatResponse
{   #[serde(default)]
    pub model: Option<String>
  , pub choices: Vec<Choice>
  , #[serde(default)]
    pub usage: Option<OpenAiUsage>
}

#[derive(Debug, Clone, Deserialize)]
pub struct Choice
{   pub message: ChatMessage
  , #[serde(default)]
    pub finish_reason: Option<String>
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OpenAiUsage
{   pub prompt_tokens: u32
  , pub completion_tokens: u32
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiStreamChunk
{   #[serde(default)]
    pub choices: Vec<StreamChoice>
  , #[serde(default)]
    pub usage: Option<OpenAiUsage>
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice
{   pub delta: Delta
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta
{   #[serde(default)]
    pub content: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiErrorResponse
{   pub error: OpenAiErrorBody
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiErrorBody
{   pub message: String
  , #[serde(default, rename = "type")]
    pub error_type: Option<String>
}

/// Pull the human-readable message out of an error body.
fn error_message(body: &str) -> String
{   serde_json::from_str::<OpenAiErrorResponse>(body)
      .map(|e| e.error.message)
      .unwrap_or_else(|_| body.trim().to_string())
}

// ===== OpenAI Client =====

/// GPT-style chat completions client
pub struct OpenAiClient
{   transport: Arc<dyn HttpTransport>
  , credentials: Arc<dyn crate::credentials::CredentialProvider>
  , api_base: String
  , timeout: Option<Duration>
  , models: Vec<crate::ModelInfo>
}

impl OpenAiClient
{   pub fn new(
      transport: Arc<dyn HttpTransport>
    , credentials: Arc<dyn crate::credentials::CredentialProvider>
    ) -> Self
    {   debug!("Creating OpenAiClient");
        OpenAiClient
        {   transport
          , credentials
          , api_base: OPENAI_API_BASE.to_string()
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
            "unknown openai model: {}", name
          )))
    }

    fn build_payload(
      &self
    , request: &crate::AiRequest
    , stream: bool
    ) -> OpenAiChatRequest
    {   OpenAiChatRequest
        {   model: request.model.clone()
          , messages: request.messages
              .iter()
              .map(|m| ChatMessage
              {   role: m.role.as_str().to_string()
                , content: m.content.clone()
              })
              .collect()
          , max_tokens: request.max_tokens
          , temperature: request.temperature
          , stream
          , stream_options: stream.then_some(StreamOptions
            {   include_usage: true
            })
        }
    }

    fn http_request(
      &self
    , payload: &OpenAiChatRequest
    ) -> Result<HttpRequest, crate::error::Error>
    {   let api_key = super::require_key(
          self.credentials.as_ref(),
          crate::Provider::OpenAi
        )?;
        let body = serde_json::to_value(payload).map_err(|e| {
          crate::error::Error::Validation(e.to_string())
        })?;
        Ok(HttpRequest
        {   url: super::endpoint(&self.api_base, "chat/completions")
          , headers: vec![
              ("Authorization".to_string(), format!("Bearer {}", api_key))
            , ("Content-Type".to_string(), "application/json".to_string())
            ]
          , body
          , timeout: self.timeout
        })
    }

    /// Turn a successful body into the normalized response.
    fn parse_response(
      &self
    , request: &crate::AiRequest
    , body: &str
    ) -> Result<crate::AiResponse, crate::error::Error>
    {   let chat_response: OpenAiChatResponse
          = serde_json::from_str(body).map_err(|e| {
            error!("Parse error: {}", e);
            crate::error::Error::Decoding
            {   provider: crate::Provider::OpenAi
              , message: e.to_string()
            }
          })?;

        let content = chat_response.choices
          .first()
          .map(|c| c.message.content.clone())
          .ok_or_else(|| {
            error!("No choices in response");
            crate::error::Error::Decoding
            {   provider: crate::Provider::OpenAi
              , message: "response contained no choices".to_string()
            }
          })?;

        let info = self.model(&request.model)?;
        let usage = match chat_response.usage
        {   Some(u) => crate::Usage::priced(
              u.prompt_tokens, u.completion_tokens, info
            )
          , None => {
              debug!("No usage reported, estimating");
              crate::Usage::priced(
                request.estimated_prompt_tokens(),
                crate::request::estimate_tokens(&content),
                info
              )
            }
        };

        Ok(crate::AiResponse
        {   content
          , provider: crate::Provider::OpenAi
          , model: chat_response.model
              .unwrap_or_else(|| request.model.clone())
          , usage
        })
    }
}

/// What one SSE event means for the stream state.
enum StreamStep
{   Delta(String)
  , Usage(OpenAiUsage)
  , Done
  , Skip
}

fn decode_event(
  event: &SseEvent
) -> Result<Vec<StreamStep>, crate::error::Error>
{   if event.data.trim() == "[DONE]"
    {   return Ok(vec![StreamStep::Done]);
    }
    let chunk: OpenAiStreamChunk
      = serde_json::from_str(&event.data).map_err(|e| {
        error!("Stream parse error: {}", e);
        crate::error::Error::Decoding
        {   provider: crate::Provider::OpenAi
          , message: e.to_string()
        }
      })?;
    let mut steps = Vec::new();
    for choice in chunk.choices
    {   match choice.delta.content
        {   Some(text) if !text.is_empty() => {
              steps.push(StreamStep::Delta(text))
            }
          , _ => steps.push(StreamStep::Skip)
        }
    }
    if let Some(usage) = chunk.usage
    {   steps.push(StreamStep::Usage(usage));
    }
    Ok(steps)
}

#[async_trait]
impl crate::providers::ProviderClient for OpenAiClient
{   fn provider(&self) -> crate::Provider
    {   crate::Provider::OpenAi
    }

    fn models(&self) -> &[crate::ModelInfo]
    {   &self.models
    }

    async fn call(
      &self
    , request: &crate::AiRequest
    ) -> Result<crate::AiResponse, crate::error::Error>
    {   debug!("OpenAI call for: {}", request.model);
        let payload = self.build_payload(request, false);
        trace!("OpenAI request: {} messages", payload.messages.len());

        let response = self.transport
          .post_json(self.http_request(&payload)?)
          .await?;

        if !response.is_success()
        {   return Err(super::error_for_status(
              crate::Provider::OpenAi,
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
    {   debug!("OpenAI stream for: {}", request.model);
        let info = self.model(&request.model)?.clone();
        let payload = self.build_payload(request, true);

        let http = self.http_request(&payload)?;
        let response = tokio::select!
        { biased;
          _ = cancel.cancelled() => {
            debug!("OpenAI stream cancelled before headers");
            return Ok(crate::StreamOutcome::Cancelled);
          }
        , response = self.transport.post_stream(http) => response?
        };

        if !response.is_success()
        {   let status = response.status;
            let retry_after = response.retry_after;
            let body = response.collect_body().await;
            return Err(super::error_for_status(
              crate::Provider::OpenAi,
              status,
              retry_after,
              error_message(&body)
            ));
        }

        let mut body = response.body;
        let mut decoder = SseDecoder::new();
        let mut content = String::new();
        let mut usage = crate::Usage::default();
        let mut finished = false;

        'read: loop
        { let bytes = tokio::select!
          { biased;
            _ = cancel.cancelled() => {
              debug!("OpenAI stream cancelled");
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
          {   for step in decode_event(event)?
              {   match step
                  {   StreamStep::Delta(text) => {
                        if cancel.is_cancelled()
                          || chunks.send(text.clone()).is_err()
                        {   debug!("OpenAI stream receiver gone");
                            return Ok(crate::StreamOutcome::Cancelled);
                        }
                        content.push_str(&text);
                      }
                    , StreamStep::Usage(u) => {
                        usage = crate::Usage::priced(
                          u.prompt_tokens, u.completion_tokens, &info
                        );
                      }
                    , StreamStep::Done => {
                        finished = true;
                        break 'read;
                      }
                    , StreamStep::Skip => {}
                  }
              }
          }

          if ended
          {   break 'read;
          }
        }

        if !finished
        {   warn!("OpenAI stream closed without [DONE]");
            return Err(crate::error::Error::Decoding
            {   provider: crate::Provider::OpenAi
              , message: "stream ended before completion".to_string()
            });
        }

        trace!("OpenAI stream finished, {} chars", content.len());
        Ok(crate::StreamOutcome::Completed(crate::AiResponse
        {   content
          , provider: crate::Provider::OpenAi
          , model: request.model.clone()
          , usage
        }))
    }
}

fn model_info(
  name: &str
, max_context_tokens: u32
, max_output_tokens: u32
, input_cost: f64
, output_cost: f64
) -> crate::ModelInfo
{   crate::ModelInfo
    {   name: name.to_string()
      , provider: crate::Provider::OpenAi
      , max_context_tokens
      , max_output_tokens
      , max_temperature: 2.0
      , supports_streaming: true
      , cost_per_million_input_tokens: input_cost
      , cost_per_million_output_tokens: output_cost
    }
}

/// Static price table for OpenAI models
pub fn default_models() -> Vec<crate::ModelInfo>
{   vec![
      model_info("gpt-4o", 128_000, 16_384, 2.50, 10.00)
    , model_info("gpt-4o-mini", 128_000, 16_384, 0.15, 0.60)
    , model_info("gpt-4-turbo", 128_000, 4_096, 10.00, 30.00)
    , model_info("gpt-3.5-turbo", 16_385, 4_096, 0.50, 1.50)
    ]
}
