use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ai_orchestrator::config::ProviderConfig;
use ai_orchestrator::providers::ProviderClient;
use ai_orchestrator::{
  AiBackend, AiManager, AiRequest, AiResponse, ChunkSender, Error,
  ManualClock, Message, ModelInfo, OrchestratorConfig, Provider,
  RateLimitConfig, Role, StreamOutcome, TemplateError, Usage
};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

fn init_logging()
{   let _ = env_logger::builder().is_test(true).try_init();
}

fn model(provider: Provider) -> ModelInfo
{   ModelInfo
    {   name: "m1".to_string()
      , provider
      , max_context_tokens: 8192
      , max_output_tokens: 1024
      , max_temperature: 2.0
      , supports_streaming: true
      , cost_per_million_input_tokens: 1.0
      , cost_per_million_output_tokens: 2.0
    }
}

/// Provider double that counts calls and remembers the last request
struct FakeClient
{   provider: Provider
  , models: Vec<ModelInfo>
  , calls: AtomicUsize
  , last_request: Mutex<Option<AiRequest>>
  , chunks: Vec<&'static str>
  , chunk_delay: Duration
  , hang: bool
}

impl FakeClient
{   fn new(provider: Provider) -> Self
    {   FakeClient
        {   provider
          , models: vec![model(provider)]
          , calls: AtomicUsize::new(0)
          , last_request: Mutex::new(None)
          , chunks: vec!["hel", "lo"]
          , chunk_delay: Duration::ZERO
          , hang: false
        }
    }

    fn hanging(mut self) -> Self
    {   self.hang = true;
        self
    }

    fn with_chunks(mut self, chunks: Vec<&'static str>) -> Self
    {   self.chunks = chunks;
        self
    }

    fn slow_chunks(mut self, delay: Duration) -> Self
    {   self.chunk_delay = delay;
        self
    }

    fn calls(&self) -> usize
    {   self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> Option<AiRequest>
    {   self.last_request.lock().clone()
    }

    fn response(&self, content: String) -> AiResponse
    {   AiResponse
        {   content
          , provider: self.provider
          , model: "m1".to_string()
          , usage: Usage
            {   prompt_tokens: 8
              , completion_tokens: 4
              , total_tokens: 12
              , cost: 0.0001
            }
        }
    }
}

#[async_trait]
impl ProviderClient for FakeClient
{   fn provider(&self) -> Provider
    {   self.provider
    }

    fn models(&self) -> &[ModelInfo]
    {   &self.models
    }

    async fn call(&self, request: &AiRequest) -> Result<AiResponse, Error>
    {   self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());
        if self.hang
        {   futures::future::pending::<()>().await;
        }
        Ok(self.response("hello".to_string()))
    }

    async fn call_stream(
      &self
    , request: &AiRequest
    , chunks: ChunkSender
    , cancel: CancellationToken
    ) -> Result<StreamOutcome, Error>
    {   self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());
        let mut content = String::new();
        for (i, chunk) in self.chunks.iter().enumerate()
        {   if i > 0 && !self.chunk_delay.is_zero()
            {   tokio::select!
                { biased;
                  _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled)
                , _ = tokio::time::sleep(self.chunk_delay) => {}
                }
            }
            if cancel.is_cancelled() || chunks.send(chunk.to_string()).is_err()
            {   return Ok(StreamOutcome::Cancelled);
            }
            content.push_str(chunk);
        }
        Ok(StreamOutcome::Completed(self.response(content)))
    }
}

struct Harness
{   manager: Arc<AiManager>
  , clock: Arc<ManualClock>
  , openai: Arc<FakeClient>
  , anthropic: Arc<FakeClient>
}

fn config(rate_limit: RateLimitConfig) -> OrchestratorConfig
{   let mut config = OrchestratorConfig::default();
    config.request_timeout_secs = Some(1);
    config.providers = Provider::ALL
      .iter()
      .map(|p| ProviderConfig
      {   default_model: "m1".to_string()
        , rate_limit
        , ..ProviderConfig::default_for(*p)
      })
      .collect();
    config
}

fn roomy() -> RateLimitConfig
{   RateLimitConfig
    {   max_requests_per_window: 100
      , max_tokens_per_window: 1_000_000
      , window_secs: 60
    }
}

fn harness_with(
  config: OrchestratorConfig
, openai: FakeClient
) -> Harness
{   init_logging();
    let clock = Arc::new(ManualClock::new());
    let openai = Arc::new(openai);
    let anthropic = Arc::new(FakeClient::new(Provider::Anthropic));
    let manager = AiManager::builder(config)
      .clock(clock.clone())
      .provider_client(openai.clone())
      .provider_client(anthropic.clone())
      .build()
      .expect("manager builds");
    Harness
    {   manager: Arc::new(manager)
      , clock
      , openai
      , anthropic
    }
}

fn harness() -> Harness
{   harness_with(config(roomy()), FakeClient::new(Provider::OpenAi))
}

#[tokio::test]
async fn identical_requests_are_served_from_cache_until_ttl()
{   let h = harness();

    let first = h.manager
      .send_message("hi", Some(Provider::OpenAi), 0.7, 100)
      .await
      .expect("first call");
    assert_eq!(first.content, "hello");
    assert_eq!(first.usage.total_tokens, 12);
    assert_eq!(h.openai.calls(), 1);

    h.clock.advance(Duration::from_secs(299));
    let second = h.manager
      .send_message("hi", Some(Provider::OpenAi), 0.7, 100)
      .await
      .expect("cached call");
    assert_eq!(second, first);
    assert_eq!(h.openai.calls(), 1);

    h.clock.advance(Duration::from_secs(2));
    h.manager
      .send_message("hi", Some(Provider::OpenAi), 0.7, 100)
      .await
      .expect("expired entry refetched");
    assert_eq!(h.openai.calls(), 2);
}

#[tokio::test]
async fn different_parameters_do_not_share_cache_entries()
{   let h = harness();
    h.manager.send_message("hi", None, 0.7, 100).await.expect("call");
    h.manager.send_message("hi", None, 0.2, 100).await.expect("call");
    h.manager.send_message("hi", None, 0.7, 50).await.expect("call");
    h.manager
      .send_message("hi", Some(Provider::Anthropic), 0.7, 100)
      .await
      .expect("call");
    assert_eq!(h.openai.calls(), 3);
    assert_eq!(h.anthropic.calls(), 1);
}

#[tokio::test]
async fn clear_cache_forces_a_provider_call()
{   let h = harness();
    h.manager.send_message("hi", None, 0.7, 100).await.expect("call");
    h.manager.clear_cache();
    assert!(h.manager.cache().is_empty());
    h.manager.send_message("hi", None, 0.7, 100).await.expect("call");
    assert_eq!(h.openai.calls(), 2);
}

#[tokio::test]
async fn disabled_cache_always_calls_the_provider()
{   let mut config = config(roomy());
    config.cache.enabled = false;
    let h = harness_with(config, FakeClient::new(Provider::OpenAi));
    h.manager.send_message("hi", None, 0.7, 100).await.expect("call");
    h.manager.send_message("hi", None, 0.7, 100).await.expect("call");
    assert_eq!(h.openai.calls(), 2);
    assert!(h.manager.cache().is_empty());
}

#[tokio::test]
async fn invalid_requests_fail_before_any_cost()
{   let h = harness();
    let before = h.manager.rate_limiter().status(Provider::OpenAi);

    let too_hot = h.manager.send_message("hi", None, 5.0, 100).await;
    assert!(matches!(too_hot, Err(Error::Validation(_))));

    let no_tokens = h.manager.send_message("hi", None, 0.7, 0).await;
    assert!(matches!(no_tokens, Err(Error::Validation(_))));

    let empty = h.manager.send(AiRequest::new(Vec::new())).await;
    assert!(matches!(empty, Err(Error::Validation(_))));

    let unknown = h.manager
      .send(AiRequest::new(vec![Message::user("hi")]).with_model("nope"))
      .await;
    assert!(matches!(unknown, Err(Error::Validation(_))));

    assert_eq!(h.openai.calls(), 0);
    assert_eq!(h.manager.rate_limiter().status(Provider::OpenAi), before);
}

#[tokio::test]
async fn local_rate_limit_denies_without_calling_the_provider()
{   let limit = RateLimitConfig
    {   max_requests_per_window: 2
      , max_tokens_per_window: 1_000_000
      , window_secs: 60
    };
    let h = harness_with(config(limit), FakeClient::new(Provider::OpenAi));

    assert_ok!(h.manager.send_message("one", None, 0.7, 10).await);
    h.clock.advance(Duration::from_secs(10));
    assert_ok!(h.manager.send_message("two", None, 0.7, 10).await);

    match h.manager.send_message("three", None, 0.7, 10).await
    {   Err(Error::RateLimitExceeded { provider, retry_after }) => {
          assert_eq!(provider, Provider::OpenAi);
          assert_eq!(retry_after, Duration::from_secs(50));
        }
      , other => panic!("expected local rate limit, got {:?}", other)
    }
    assert_eq!(h.openai.calls(), 2);

    // cache hits never touch the limiter
    assert_ok!(h.manager.send_message("one", None, 0.7, 10).await);

    // the other provider has its own window
    h.manager
      .send_message("three", Some(Provider::Anthropic), 0.7, 10)
      .await
      .expect("separate budget");

    h.clock.advance(Duration::from_secs(50));
    h.manager.send_message("three", None, 0.7, 10).await.expect("slot free");
    assert_eq!(h.openai.calls(), 3);
}

#[tokio::test]
async fn timed_out_calls_keep_their_budget()
{   let h = harness_with(
      config(roomy()),
      FakeClient::new(Provider::OpenAi).hanging()
    );

    let error = assert_err!(h.manager.send_message("hi", None, 0.7, 100).await);
    assert_eq!(error, Error::Timeout(Duration::from_secs(1)));
    assert!(error.is_retryable());

    let status = h.manager.rate_limiter().status(Provider::OpenAi);
    assert_eq!(status.requests_remaining, 99);
    assert!(h.manager.cache().is_empty());
    assert_eq!(h.manager.usage_report().provider(Provider::OpenAi).requests, 0);
}

#[tokio::test]
async fn streaming_delivers_chunks_in_order_and_is_not_cached()
{   let h = harness();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let outcome = h.manager
      .send_message_stream("hi", None, tx, CancellationToken::new())
      .await
      .expect("stream");

    let mut received = Vec::new();
    while let Ok(chunk) = rx.try_recv()
    {   received.push(chunk);
    }
    assert_eq!(received, vec!["hel", "lo"]);
    match outcome
    {   StreamOutcome::Completed(response) => {
          assert_eq!(response.content, "hello");
        }
      , StreamOutcome::Cancelled => panic!("stream was not cancelled")
    }
    assert!(h.manager.cache().is_empty());
    assert!(h.openai.last_request().expect("request").stream);

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    h.manager
      .send_message_stream("hi", None, tx, CancellationToken::new())
      .await
      .expect("stream again");
    assert_eq!(h.openai.calls(), 2);
}

#[tokio::test]
async fn cancelled_stream_stops_delivering_chunks()
{   let h = harness_with(
      config(roomy()),
      FakeClient::new(Provider::OpenAi).slow_chunks(Duration::from_secs(30))
    );
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let manager = h.manager.clone();
    let stream_cancel = cancel.clone();
    let task = tokio::spawn(async move {
      manager.send_message_stream("hi", None, tx, stream_cancel).await
    });

    assert_eq!(rx.recv().await.as_deref(), Some("hel"));
    cancel.cancel();

    let outcome = task.await.expect("join").expect("stream");
    assert!(outcome.is_cancelled());
    assert_eq!(rx.recv().await, None);
    assert_eq!(h.manager.usage_report().provider(Provider::OpenAi).requests, 0);
}

#[tokio::test]
async fn streaming_flag_on_send_aggregates_the_stream()
{   let h = harness();
    let response = h.manager
      .send(AiRequest::new(vec![Message::user("hi")]).streaming(true))
      .await
      .expect("aggregated");
    assert_eq!(response.content, "hello");
    assert!(h.manager.cache().is_empty());
}

#[tokio::test]
async fn aggregated_stream_consumes_every_chunk()
{   let h = harness_with(
      config(roomy()),
      FakeClient::new(Provider::OpenAi).with_chunks(vec!["x"; 500])
    );
    let response = tokio::time::timeout(
      Duration::from_secs(5),
      h.manager.send(AiRequest::new(vec![Message::user("hi")]).streaming(true))
    )
    .await
    .expect("aggregation finishes once the client is done")
    .expect("aggregated");
    assert_eq!(response.content, "x".repeat(500));
    assert_eq!(h.manager.usage_report().provider(Provider::OpenAi).requests, 1);
}

#[tokio::test]
async fn admission_charges_prompt_only_for_streams()
{   let h = harness();
    let limiter = h.manager.rate_limiter();
    assert_eq!(limiter.status(Provider::OpenAi).tokens_remaining, 1_000_000);

    // "hi" estimates to one token
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    assert_ok!(
      h.manager
        .send_message_stream("hi", None, tx, CancellationToken::new())
        .await
    );
    let status = limiter.status(Provider::OpenAi);
    assert_eq!(status.tokens_remaining, 999_999);
    assert_eq!(status.requests_remaining, 99);

    // "hello there" estimates to three tokens, plus max_tokens
    assert_ok!(h.manager.send_message("hello there", None, 0.7, 100).await);
    let status = limiter.status(Provider::OpenAi);
    assert_eq!(status.tokens_remaining, 999_999 - 103);
    assert_eq!(status.requests_remaining, 98);

    // a cache hit is free
    assert_ok!(h.manager.send_message("hello there", None, 0.7, 100).await);
    assert_eq!(limiter.status(Provider::OpenAi), status);
}

#[tokio::test]
async fn stream_fits_where_a_plain_call_does_not()
{   let tight = RateLimitConfig
    {   max_requests_per_window: 100
      , max_tokens_per_window: 120
      , window_secs: 60
    };
    let h = harness_with(config(tight), FakeClient::new(Provider::OpenAi));

    // 2 + 100 tokens
    assert_ok!(h.manager.send_message("first", None, 0.7, 100).await);
    assert_eq!(
      h.manager.rate_limiter().status(Provider::OpenAi).tokens_remaining,
      18
    );

    let denied = h.manager.send_message("second", None, 0.7, 100).await;
    assert!(matches!(denied, Err(Error::RateLimitExceeded { .. })));
    assert_eq!(h.openai.calls(), 1);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let outcome = h.manager
      .send_message_stream("third", None, tx, CancellationToken::new())
      .await
      .expect("prompt-only admission fits");
    assert!(!outcome.is_cancelled());
    assert_eq!(rx.recv().await.as_deref(), Some("hel"));
    assert_eq!(h.openai.calls(), 2);
    assert_eq!(
      h.manager.rate_limiter().status(Provider::OpenAi).tokens_remaining,
      16
    );
}

#[tokio::test]
async fn continue_conversation_leaves_history_untouched()
{   let h = harness();
    let history = vec![
      Message::system("be brief")
    , Message::user("hi")
    , Message::assistant("hello")
    ];
    let snapshot = history.clone();

    h.manager
      .continue_conversation(&history, "and again?", None)
      .await
      .expect("turn");

    assert_eq!(history, snapshot);
    let sent = h.openai.last_request().expect("request");
    assert_eq!(sent.messages.len(), 4);
    assert_eq!(sent.messages[..3], snapshot[..]);
    assert_eq!(sent.messages[3], Message::user("and again?"));
    assert_eq!(sent.max_tokens, h.manager.config().default_max_tokens);
}

#[tokio::test]
async fn templates_render_into_system_and_user_turns()
{   let h = harness();
    let vars: HashMap<String, String> = [
      ("language".to_string(), "German".to_string())
    , ("text".to_string(), "good morning".to_string())
    ].into_iter().collect();

    h.manager
      .execute_named_template("translate", &vars, None)
      .await
      .expect("template call");
    let sent = h.openai.last_request().expect("request");
    assert_eq!(sent.messages.len(), 2);
    assert_eq!(sent.messages[0].role, Role::System);
    assert!(sent.messages[1].content.contains("into German"));
    assert!(sent.messages[1].content.contains("good morning"));

    let custom = ai_orchestrator::PromptTemplate::new(
      "shout", None, "{{word}}!"
    );
    let vars: HashMap<String, String>
      = [("word".to_string(), "hey".to_string())].into_iter().collect();
    h.manager.execute_template(&custom, &vars, None).await.expect("custom");
    let sent = h.openai.last_request().expect("request");
    assert_eq!(sent.messages, vec![Message::user("hey!")]);
}

#[tokio::test]
async fn template_errors_come_before_any_call()
{   let h = harness();
    let result = h.manager
      .execute_named_template("summarize", &HashMap::new(), None)
      .await;
    assert_eq!(
      result,
      Err(Error::Template(TemplateError::MissingVariable("text".to_string())))
    );

    let result = h.manager
      .execute_named_template("limerick", &HashMap::new(), None)
      .await;
    assert_eq!(
      result,
      Err(Error::Template(TemplateError::UnknownTemplate(
        "limerick".to_string()
      )))
    );
    assert_eq!(h.openai.calls(), 0);
}

#[tokio::test]
async fn default_provider_can_be_switched()
{   let h = harness();
    assert_eq!(h.manager.default_provider(), Provider::OpenAi);

    h.manager.set_default_provider(Provider::Anthropic);
    let response = h.manager
      .send_message("hi", None, 0.7, 100)
      .await
      .expect("call");
    assert_eq!(response.provider, Provider::Anthropic);
    assert_eq!(h.anthropic.calls(), 1);
    assert_eq!(h.openai.calls(), 0);
}

#[tokio::test]
async fn usage_report_tracks_calls_hits_and_cost()
{   let h = harness();
    h.manager.send_message("a", None, 0.7, 100).await.expect("call");
    h.manager.send_message("a", None, 0.7, 100).await.expect("hit");
    h.manager.send_message("b", None, 0.7, 100).await.expect("call");

    let report = h.manager.usage_report();
    let openai = report.provider(Provider::OpenAi);
    assert_eq!(openai.requests, 2);
    assert_eq!(openai.cache_hits, 1);
    assert_eq!(openai.prompt_tokens, 16);
    assert_eq!(openai.completion_tokens, 8);
    assert!((report.total_cost() - 0.0002).abs() < 1e-12);
    assert_eq!(report.provider(Provider::Anthropic).requests, 0);
}

#[tokio::test]
async fn missing_api_key_is_reported_for_real_clients()
{   init_logging();
    let manager = AiManager::new(
      OrchestratorConfig::default(),
      Arc::new(ai_orchestrator::StaticCredentials::new())
    ).expect("manager builds");

    let result = manager.send_message("hi", None, 0.7, 100).await;
    assert_eq!(result, Err(Error::MissingApiKey(Provider::OpenAi)));
}

#[tokio::test]
async fn backend_channels_drive_the_manager()
{   let h = harness();
    let backend = AiBackend::from_shared(h.manager.clone());

    let mut reply = backend
      .send_message("hi", None, 0.7, 100)
      .expect("queued");
    let response = reply.recv().await.expect("reply").expect("response");
    assert_eq!(response.content, "hello");

    let history = vec![Message::user("hi"), Message::assistant("hello")];
    let mut reply = backend
      .continue_conversation(history, "more", None)
      .expect("queued");
    reply.recv().await.expect("reply").expect("response");

    let vars: HashMap<String, String>
      = [("text".to_string(), "long text".to_string())].into_iter().collect();
    let mut reply = backend
      .execute_template("summarize", vars, None)
      .expect("queued");
    reply.recv().await.expect("reply").expect("response");

    let mut reply = backend
      .set_default_provider(Provider::Anthropic)
      .expect("queued");
    reply.recv().await.expect("reply").expect("switched");
    assert_eq!(h.manager.default_provider(), Provider::Anthropic);

    let (mut chunks, mut reply) = backend
      .stream_message("hi", None, CancellationToken::new())
      .expect("queued");
    let outcome = reply.recv().await.expect("reply").expect("outcome");
    assert!(!outcome.is_cancelled());
    assert_eq!(chunks.recv().await.as_deref(), Some("hel"));
    assert_eq!(chunks.recv().await.as_deref(), Some("lo"));
    assert_eq!(h.anthropic.calls(), 1);

    let mut reply = backend.get_model_lists().expect("queued");
    let models = reply.recv().await.expect("reply").expect("models");
    assert_eq!(models.len(), 2);

    let mut reply = backend.clear_cache().expect("queued");
    reply.recv().await.expect("reply").expect("cleared");
    assert!(h.manager.cache().is_empty());

    backend.shutdown().await.expect("shutdown");
}
