//! Unified request and response types

use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role
{   System
  , User
  , Assistant
}

impl Role
{   pub fn as_str(&self) -> &'static str
    {   match self
        {   Role::System => "system"
          , Role::User => "user"
          , Role::Assistant => "assistant"
        }
    }
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message
{   pub role: Role
  , pub content: String
}

impl Message
{   pub fn new(role: Role, content: impl Into<String>) -> Self
    {   Message
        {   role
          , content: content.into()
        }
    }

    pub fn system(content: impl Into<String>) -> Self
    {   Message::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self
    {   Message::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self
    {   Message::new(Role::Assistant, content)
    }
}

/// Unified generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiRequest
{   /// Ordered conversation, never empty
    pub messages: Vec<Message>
  , /// Provider to use; `None` means the manager's default
    pub provider: Option<crate::Provider>
  , /// Model name; empty means the provider's default model
    pub model: String
  , /// Sampling temperature in [0, 2]
    pub temperature: f32
  , /// Max tokens to generate
    pub max_tokens: u32
  , /// Deliver the response incrementally
    pub stream: bool
}

impl AiRequest
{   pub fn new(messages: Vec<Message>) -> Self
    {   AiRequest
        {   messages
          , provider: None
          , model: String::new()
          , temperature: 0.7
          , max_tokens: 1024
          , stream: false
        }
    }

    pub fn with_provider(mut self, provider: crate::Provider) -> Self
    {   self.provider = Some(provider);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self
    {   self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self
    {   self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self
    {   self.max_tokens = max_tokens;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self
    {   self.stream = stream;
        self
    }

    /// Approximate prompt size, used for admission and context checks.
    pub fn estimated_prompt_tokens(&self) -> u32
    {   self.messages
          .iter()
          .map(|m| estimate_tokens(&m.content))
          .sum()
    }

    /// Check the request against the limits of the model serving it.
    pub fn validate(
      &self
    , model: &crate::ModelInfo
    ) -> Result<(), crate::error::Error>
    {   use crate::error::Error;

        if self.messages.is_empty()
        {   return Err(Error::Validation(
              "messages must not be empty".to_string()
            ));
        }
        if !self.temperature.is_finite()
          || !(0.0..=2.0).contains(&self.temperature)
        {   return Err(Error::Validation(format!(
              "temperature {} outside [0, 2]",
              self.temperature
            )));
        }
        if self.temperature > model.max_temperature
        {   return Err(Error::Validation(format!(
              "temperature {} exceeds {} limit of {}",
              self.temperature, model.name, model.max_temperature
            )));
        }
        if self.max_tokens == 0
        {   return Err(Error::Validation(
              "max_tokens must be positive".to_string()
            ));
        }
        if self.max_tokens > model.max_output_tokens
        {   return Err(Error::Validation(format!(
              "max_tokens {} exceeds {} output limit of {}",
              self.max_tokens, model.name, model.max_output_tokens
            )));
        }
        let needed = self.estimated_prompt_tokens() as u64
          + self.max_tokens as u64;
        if needed > model.max_context_tokens as u64
        {   return Err(Error::Validation(format!(
              "request needs ~{} tokens, {} context window is {}",
              needed, model.name, model.max_context_tokens
            )));
        }
        if self.stream && !model.supports_streaming
        {   return Err(Error::Validation(format!(
              "{} does not support streaming",
              model.name
            )));
        }
        Ok(())
    }
}

/// Token counts and cost of one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage
{   pub prompt_tokens: u32
  , pub completion_tokens: u32
  , pub total_tokens: u32
  , /// USD
    pub cost: f64
}

impl Usage
{   /// Usage priced against a model's price table.
    pub fn priced(
      prompt_tokens: u32
    , completion_tokens: u32
    , model: &crate::ModelInfo
    ) -> Self
    {   Usage
        {   prompt_tokens
          , completion_tokens
          , total_tokens: prompt_tokens.saturating_add(completion_tokens)
          , cost: model.cost(prompt_tokens, completion_tokens)
        }
    }
}

/// Normalized response, whichever provider served it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse
{   /// Generated text
    pub content: String
  , /// Provider that generated it
    pub provider: crate::Provider
  , /// Model that generated it
    pub model: String
  , pub usage: Usage
}

/// How a streaming call ended
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome
{   /// All chunks delivered; `content` is their concatenation.
    /// Usage is zeroed when the provider did not report it.
    Completed(AiResponse)
  , /// Caller cancelled; no chunks were delivered afterwards
    Cancelled
}

impl StreamOutcome
{   pub fn is_cancelled(&self) -> bool
    {   matches!(self, StreamOutcome::Cancelled)
    }
}

/// Character/4 heuristic, rounded up.
pub fn estimate_tokens(text: &str) -> u32
{   let chars = text.chars().count() as u32;
    (chars + 3) / 4
}
