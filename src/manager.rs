//! The request pipeline.
//!
//! `Received -> CacheCheck -> (hit: Returned) | (miss: RateLimitCheck ->
//! (denied: error) | (admitted: ProviderCall -> CacheStore -> Returned))`
//!
//! Only the limiter window and the cache map are locked, and never across
//! the network call.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::cache::{fingerprint, ResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::credentials::{CredentialProvider, EnvCredentials};
use crate::error::Error;
use crate::providers::{AnthropicClient, OpenAiClient, ProviderClient};
use crate::rate_limit::RateLimiter;
use crate::template::{PromptTemplate, TemplateEngine};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::{AiRequest, AiResponse, Message, Provider, StreamOutcome};

/// Running totals for one provider
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProviderUsage
{   /// Calls that reached the provider and succeeded
    pub requests: u64
  , pub cache_hits: u64
  , pub prompt_tokens: u64
  , pub completion_tokens: u64
  , /// USD
    pub cost: f64
}

/// Usage per provider since construction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageReport
{   pub providers: HashMap<Provider, ProviderUsage>
}

impl UsageReport
{   pub fn provider(&self, provider: Provider) -> ProviderUsage
    {   self.providers.get(&provider).copied().unwrap_or_default()
    }

    pub fn total_cost(&self) -> f64
    {   self.providers.values().map(|u| u.cost).sum()
    }
}

/// Builds an [`AiManager`]; anything left unset gets its production default.
pub struct AiManagerBuilder
{   config: OrchestratorConfig
  , clock: Option<Arc<dyn Clock>>
  , credentials: Option<Arc<dyn CredentialProvider>>
  , transport: Option<Arc<dyn HttpTransport>>
  , openai: Option<Arc<dyn ProviderClient>>
  , anthropic: Option<Arc<dyn ProviderClient>>
  , templates: Option<TemplateEngine>
}

impl AiManagerBuilder
{   pub fn new(config: OrchestratorConfig) -> Self
    {   AiManagerBuilder
        {   config
          , clock: None
          , credentials: None
          , transport: None
          , openai: None
          , anthropic: None
          , templates: None
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self
    {   self.clock = Some(clock);
        self
    }

    pub fn credentials(
      mut self
    , credentials: Arc<dyn CredentialProvider>
    ) -> Self
    {   self.credentials = Some(credentials);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self
    {   self.transport = Some(transport);
        self
    }

    /// Replace the client for `client.provider()`.
    pub fn provider_client(mut self, client: Arc<dyn ProviderClient>) -> Self
    {   match client.provider()
        {   Provider::OpenAi => self.openai = Some(client)
          , Provider::Anthropic => self.anthropic = Some(client)
        }
        self
    }

    pub fn templates(mut self, templates: TemplateEngine) -> Self
    {   self.templates = Some(templates);
        self
    }

    pub fn build(self) -> Result<AiManager, Error>
    {   self.config.validate()?;
        let config = self.config;

        let clock = self.clock
          .unwrap_or_else(|| Arc::new(SystemClock));
        let credentials = self.credentials
          .unwrap_or_else(|| Arc::new(EnvCredentials));
        let transport = self.transport
          .unwrap_or_else(|| Arc::new(ReqwestTransport::new()));

        let openai = match self.openai
        {   Some(client) => client
          , None => {
              let settings = config.provider(Provider::OpenAi);
              let mut client = OpenAiClient::new(
                transport.clone(), credentials.clone()
              ).with_timeout(settings.timeout());
              if let Some(base) = settings.api_base
              {   client = client.with_api_base(base);
              }
              Arc::new(client) as Arc<dyn ProviderClient>
            }
        };
        let anthropic = match self.anthropic
        {   Some(client) => client
          , None => {
              let settings = config.provider(Provider::Anthropic);
              let mut client = AnthropicClient::new(
                transport.clone(), credentials.clone()
              ).with_timeout(settings.timeout());
              if let Some(base) = settings.api_base
              {   client = client.with_api_base(base);
              }
              Arc::new(client) as Arc<dyn ProviderClient>
            }
        };

        let max_entries = NonZeroUsize::new(config.cache.max_entries)
          .ok_or_else(|| Error::InvalidConfiguration(
            "cache.max_entries must be positive".to_string()
          ))?;
        let limits = Provider::ALL
          .iter()
          .map(|p| (*p, config.provider(*p).rate_limit))
          .collect();

        info!(
          "AiManager ready, default provider: {}",
          config.default_provider
        );
        Ok(AiManager
        {   openai
          , anthropic
          , cache: ResponseCache::new(clock.clone(), max_entries)
          , limiter: RateLimiter::new(clock, limits)
          , templates: self.templates
              .unwrap_or_else(TemplateEngine::with_defaults)
          , default_provider: RwLock::new(config.default_provider)
          , usage: Mutex::new(HashMap::new())
          , config
        })
    }
}

/// Orchestrator over both providers
pub struct AiManager
{   openai: Arc<dyn ProviderClient>
  , anthropic: Arc<dyn ProviderClient>
  , cache: ResponseCache
  , limiter: RateLimiter
  , templates: TemplateEngine
  , default_provider: RwLock<Provider>
  , usage: Mutex<HashMap<Provider, ProviderUsage>>
  , config: OrchestratorConfig
}

impl AiManager
{   pub fn builder(config: OrchestratorConfig) -> AiManagerBuilder
    {   AiManagerBuilder::new(config)
    }

    /// Production wiring: reqwest transport and system clock.
    pub fn new(
      config: OrchestratorConfig
    , credentials: Arc<dyn CredentialProvider>
    ) -> Result<Self, Error>
    {   AiManagerBuilder::new(config)
          .credentials(credentials)
          .build()
    }

    fn client(&self, provider: Provider) -> &dyn ProviderClient
    {   match provider
        {   Provider::OpenAi => self.openai.as_ref()
          , Provider::Anthropic => self.anthropic.as_ref()
        }
    }

    pub fn default_provider(&self) -> Provider
    {   *self.default_provider.read()
    }

    pub fn set_default_provider(&self, provider: Provider)
    {   debug!("Default provider set to: {}", provider);
        *self.default_provider.write() = provider;
    }

    pub fn config(&self) -> &OrchestratorConfig
    {   &self.config
    }

    pub fn templates(&self) -> &TemplateEngine
    {   &self.templates
    }

    pub fn rate_limiter(&self) -> &RateLimiter
    {   &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache
    {   &self.cache
    }

    /// Every model both providers can serve
    pub fn models(&self) -> Vec<crate::ModelInfo>
    {   Provider::ALL
          .iter()
          .flat_map(|p| self.client(*p).models().to_vec())
          .collect()
    }

    /// Fill in provider and model, then validate. No budget is spent.
    fn resolve(
      &self
    , mut request: AiRequest
    ) -> Result<(AiRequest, Provider), Error>
    {   let provider = request.provider
          .unwrap_or_else(|| self.default_provider());
        request.provider = Some(provider);
        if request.model.trim().is_empty()
        {   request.model = self.config.provider(provider).default_model;
        }
        self.client(provider).validate(&request).map_err(|e| {
          warn!("Rejected {} request: {}", provider, e);
          e
        })?;
        Ok((request, provider))
    }

    /// Run one request through the pipeline. `stream: true` requests are
    /// aggregated into a single response and never cached.
    pub async fn send(&self, request: AiRequest) -> Result<AiResponse, Error>
    {   let (request, provider) = self.resolve(request)?;

        if request.stream
        {   return self.aggregate_stream(request, provider).await;
        }

        let key = fingerprint(&request, provider);
        if self.config.cache.enabled
        {   if let Some(hit) = self.cache.get(&key)
            {   debug!("Cache hit for {} ({})", provider, key);
                self.usage.lock().entry(provider).or_default().cache_hits
                  += 1;
                return Ok(hit);
            }
            debug!("Cache miss for {} ({})", provider, key);
        }

        let estimated = request.estimated_prompt_tokens() as u64
          + request.max_tokens as u64;
        self.limiter.admit(provider, estimated)?;

        let response = self.dispatch(&request, provider).await?;
        self.record(provider, &response);

        if self.config.cache.enabled
        {   self.cache.put(key, response.clone(), self.config.cache.ttl());
        }
        Ok(response)
    }

    async fn dispatch(
      &self
    , request: &AiRequest
    , provider: Provider
    ) -> Result<AiResponse, Error>
    {   let call = self.client(provider).call(request);
        match self.config.request_timeout()
        {   Some(limit) => {
              tokio::time::timeout(limit, call).await.map_err(|_| {
                // admitted budget stays spent
                warn!("{} call timed out after {:?}", provider, limit);
                Error::Timeout(limit)
              })?
            }
          , None => call.await
        }
    }

    async fn aggregate_stream(
      &self
    , request: AiRequest
    , provider: Provider
    ) -> Result<AiResponse, Error>
    {   let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        // chunks are already accumulated by the client; discard as they come
        let drain = async {
          let mut discarded = 0usize;
          while rx.recv().await.is_some()
          {   discarded += 1;
          }
          discarded
        };
        let (outcome, discarded) = tokio::join!(
          self.stream_resolved(request, provider, tx, cancel),
          drain
        );
        trace!("{} aggregated stream: {} chunks", provider, discarded);
        match outcome?
        {   StreamOutcome::Completed(response) => Ok(response)
          , StreamOutcome::Cancelled => Err(Error::Network(
              "stream closed before completion".to_string()
            ))
        }
    }

    /// Stream a request: rate limit once up front (prompt tokens only),
    /// no cache.
    pub async fn stream(
      &self
    , request: AiRequest
    , chunks: crate::ChunkSender
    , cancel: CancellationToken
    ) -> Result<StreamOutcome, Error>
    {   let (request, provider) = self.resolve(request.streaming(true))?;
        self.stream_resolved(request, provider, chunks, cancel).await
    }

    async fn stream_resolved(
      &self
    , request: AiRequest
    , provider: Provider
    , chunks: crate::ChunkSender
    , cancel: CancellationToken
    ) -> Result<StreamOutcome, Error>
    {   self.limiter.admit(
          provider,
          request.estimated_prompt_tokens() as u64
        )?;

        debug!("Opening {} stream", provider);
        let outcome = self.client(provider)
          .call_stream(&request, chunks, cancel)
          .await?;
        match &outcome
        {   StreamOutcome::Completed(response) => {
              self.record(provider, response)
            }
          , StreamOutcome::Cancelled => {
              debug!("{} stream cancelled by caller", provider)
            }
        }
        Ok(outcome)
    }

    fn record(&self, provider: Provider, response: &AiResponse)
    {   let mut usage = self.usage.lock();
        let totals = usage.entry(provider).or_default();
        totals.requests += 1;
        totals.prompt_tokens = totals.prompt_tokens
          .saturating_add(response.usage.prompt_tokens as u64);
        totals.completion_tokens = totals.completion_tokens
          .saturating_add(response.usage.completion_tokens as u64);
        totals.cost += response.usage.cost;
    }

    /// Single user turn.
    pub async fn send_message(
      &self
    , text: &str
    , provider: Option<Provider>
    , temperature: f32
    , max_tokens: u32
    ) -> Result<AiResponse, Error>
    {   let mut request = AiRequest::new(vec![Message::user(text)])
          .with_temperature(temperature)
          .with_max_tokens(max_tokens);
        request.provider = provider;
        self.send(request).await
    }

    /// Append `user_message` to a copy of `history` and send it. The
    /// caller's history is left untouched.
    pub async fn continue_conversation(
      &self
    , history: &[Message]
    , user_message: &str
    , provider: Option<Provider>
    ) -> Result<AiResponse, Error>
    {   let mut messages = history.to_vec();
        messages.push(Message::user(user_message));
        let mut request = AiRequest::new(messages)
          .with_temperature(self.config.default_temperature)
          .with_max_tokens(self.config.default_max_tokens);
        request.provider = provider;
        self.send(request).await
    }

    pub async fn execute_template(
      &self
    , template: &PromptTemplate
    , variables: &HashMap<String, String>
    , provider: Option<Provider>
    ) -> Result<AiResponse, Error>
    {   let rendered = self.templates.render(template, variables)?;
        debug!("Rendered template: {}", template.name);
        let mut request = AiRequest::new(rendered.into_messages())
          .with_temperature(self.config.default_temperature)
          .with_max_tokens(self.config.default_max_tokens);
        request.provider = provider;
        self.send(request).await
    }

    /// Look a registered template up by name and execute it.
    pub async fn execute_named_template(
      &self
    , name: &str
    , variables: &HashMap<String, String>
    , provider: Option<Provider>
    ) -> Result<AiResponse, Error>
    {   let template = self.templates.get(name).ok_or_else(|| {
          crate::error::TemplateError::UnknownTemplate(name.to_string())
        })?;
        self.execute_template(&template, variables, provider).await
    }

    /// Stream a single user turn.
    pub async fn send_message_stream(
      &self
    , text: &str
    , provider: Option<Provider>
    , chunks: crate::ChunkSender
    , cancel: CancellationToken
    ) -> Result<StreamOutcome, Error>
    {   let mut request = AiRequest::new(vec![Message::user(text)])
          .with_temperature(self.config.default_temperature)
          .with_max_tokens(self.config.default_max_tokens);
        request.provider = provider;
        self.stream(request, chunks, cancel).await
    }

    pub fn clear_cache(&self)
    {   self.cache.clear();
    }

    pub fn usage_report(&self) -> UsageReport
    {   UsageReport
        {   providers: self.usage.lock().clone()
        }
    }
}
