use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use log::{debug, error, info};

/// Public API for the orchestrator backend - owns the task
pub struct AiBackend
{   hand: crate::BackendHand
  , manager: Arc<crate::AiManager>
  , _task_handle: tokio::task::JoinHandle<()>
}

fn disconnected<T>(_: T) -> crate::error::Error
{   error!("Backend channel closed");
    crate::error::Error::BackendClosed
}

impl AiBackend
{   /// Spawn the backend task over `manager`.
    /// Returns immediately.
    pub fn new(manager: crate::AiManager) -> Self
    {   AiBackend::from_shared(Arc::new(manager))
    }

    pub fn from_shared(manager: Arc<crate::AiManager>) -> Self
    {   debug!("Creating AiBackend with task ownership");

        let (send_message_tx, send_message_rx)
          = mpsc::unbounded_channel();
        let (continue_conversation_tx, continue_conversation_rx)
          = mpsc::unbounded_channel();
        let (execute_template_tx, execute_template_rx)
          = mpsc::unbounded_channel();
        let (stream_message_tx, stream_message_rx)
          = mpsc::unbounded_channel();
        let (set_default_provider_tx, set_default_provider_rx)
          = mpsc::unbounded_channel();
        let (clear_cache_tx, clear_cache_rx)
          = mpsc::unbounded_channel();
        let (get_model_lists_tx, get_model_lists_rx)
          = mpsc::unbounded_channel();
        let (kill_process_tx, kill_process_rx)
          = mpsc::unbounded_channel();

        let hand = crate::BackendHand
        {   send_message_tx
          , continue_conversation_tx
          , execute_template_tx
          , stream_message_tx
          , set_default_provider_tx
          , clear_cache_tx
          , get_model_lists_tx
          , kill_process_tx
        };

        let foot = crate::BackendFoot
        {   send_message_rx
          , continue_conversation_rx
          , execute_template_rx
          , stream_message_rx
          , set_default_provider_rx
          , clear_cache_rx
          , get_model_lists_rx
          , kill_process_rx
        };

        let loop_manager = manager.clone();
        let _task_handle = tokio::spawn(async move {
          run_backend_loop(foot, loop_manager).await
        });

        AiBackend
        {   hand
          , manager
          , _task_handle
        }
    }

    /// Shared manager, for direct calls alongside the channels
    pub fn manager(&self) -> &Arc<crate::AiManager>
    {   &self.manager
    }

    /// Queue a single-turn message - returns almost immediately
    pub fn send_message(
      &self
    , text: impl Into<String>
    , provider: Option<crate::Provider>
    , temperature: f32
    , max_tokens: u32
    ) -> Result<
        mpsc::UnboundedReceiver<crate::ResponseReply>,
        crate::error::Error
      >
    {   let (reply, reply_rx) = mpsc::unbounded_channel();
        self.hand.send_message_tx
          .send(crate::SendMessageArgs
          {   text: text.into()
            , provider
            , temperature
            , max_tokens
            , reply
          })
          .map_err(disconnected)?;
        Ok(reply_rx)
    }

    /// Queue a conversation turn - returns almost immediately
    pub fn continue_conversation(
      &self
    , history: Vec<crate::Message>
    , user_message: impl Into<String>
    , provider: Option<crate::Provider>
    ) -> Result<
        mpsc::UnboundedReceiver<crate::ResponseReply>,
        crate::error::Error
      >
    {   debug!("continue_conversation queuing {} turns", history.len());
        let (reply, reply_rx) = mpsc::unbounded_channel();
        self.hand.continue_conversation_tx
          .send(crate::ContinueConversationArgs
          {   history
            , user_message: user_message.into()
            , provider
            , reply
          })
          .map_err(disconnected)?;
        Ok(reply_rx)
    }

    /// Queue a named template - returns almost immediately
    pub fn execute_template(
      &self
    , template: impl Into<String>
    , variables: HashMap<String, String>
    , provider: Option<crate::Provider>
    ) -> Result<
        mpsc::UnboundedReceiver<crate::ResponseReply>,
        crate::error::Error
      >
    {   let (reply, reply_rx) = mpsc::unbounded_channel();
        self.hand.execute_template_tx
          .send(crate::ExecuteTemplateArgs
          {   template: template.into()
            , variables
            , provider
            , reply
          })
          .map_err(disconnected)?;
        Ok(reply_rx)
    }

    /// Queue a streaming message. Chunks arrive on the first receiver,
    /// the outcome on the second.
    pub fn stream_message(
      &self
    , text: impl Into<String>
    , provider: Option<crate::Provider>
    , cancel: CancellationToken
    ) -> Result<
        (
          mpsc::UnboundedReceiver<String>,
          mpsc::UnboundedReceiver<crate::StreamReply>
        ),
        crate::error::Error
      >
    {   let (chunks, chunks_rx) = mpsc::unbounded_channel();
        let (reply, reply_rx) = mpsc::unbounded_channel();
        self.hand.stream_message_tx
          .send(crate::StreamMessageArgs
          {   text: text.into()
            , provider
            , chunks
            , cancel
            , reply
          })
          .map_err(disconnected)?;
        Ok((chunks_rx, reply_rx))
    }

    pub fn set_default_provider(
      &self
    , provider: crate::Provider
    ) -> Result<
        mpsc::UnboundedReceiver<crate::UnitReply>,
        crate::error::Error
      >
    {   let (reply, reply_rx) = mpsc::unbounded_channel();
        self.hand.set_default_provider_tx
          .send(crate::SetDefaultProviderArgs { provider, reply })
          .map_err(disconnected)?;
        Ok(reply_rx)
    }

    pub fn clear_cache(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver<crate::UnitReply>,
        crate::error::Error
      >
    {   let (reply, reply_rx) = mpsc::unbounded_channel();
        self.hand.clear_cache_tx
          .send(crate::ClearCacheArgs { reply })
          .map_err(disconnected)?;
        Ok(reply_rx)
    }

    /// Get model lists - returns almost immediately
    pub fn get_model_lists(
      &self
    ) -> Result<
        mpsc::UnboundedReceiver<crate::GetModelListsReply>,
        crate::error::Error
      >
    {   debug!("get_model_lists queuing command");
        let (reply, reply_rx) = mpsc::unbounded_channel();
        self.hand.get_model_lists_tx
          .send(crate::GetModelListsArgs { reply })
          .map_err(disconnected)?;
        Ok(reply_rx)
    }

    /// Gracefully shutdown the backend. Requests already spawned finish
    /// on their own.
    pub async fn shutdown(self)
      -> Result<(), crate::error::Error>
    {   debug!("Shutting down AiBackend");
        let (reply, mut reply_rx) = mpsc::unbounded_channel();

        self.hand.kill_process_tx
          .send(crate::KillProcessArgs { reply })
          .map_err(disconnected)?;

        match reply_rx.recv().await
        {   Some(result) => {
              debug!("Backend shutdown confirmed");
              result
            }
          , None => {
              error!("Backend exited without confirming shutdown");
              Err(crate::error::Error::BackendClosed)
            }
        }
    }
}

/// Main backend event loop
///
/// tokio::select! only routes. Provider work is spawned per request so
/// one slow call never holds up the others.
async fn run_backend_loop(
  foot: crate::BackendFoot
, manager: Arc<crate::AiManager>
)
{   debug!("Starting AiBackend event loop");
    let crate::BackendFoot
    {   mut send_message_rx
      , mut continue_conversation_rx
      , mut execute_template_rx
      , mut stream_message_rx
      , mut set_default_provider_rx
      , mut clear_cache_rx
      , mut get_model_lists_rx
      , mut kill_process_rx
    } = foot;

    loop
    { tokio::select!
      { Some(cmd) = send_message_rx.recv() => {
          debug!("Received SendMessage");
          let manager = manager.clone();
          tokio::spawn(async move {
            let result = manager
              .send_message(
                &cmd.text,
                cmd.provider,
                cmd.temperature,
                cmd.max_tokens
              )
              .await;
            let _ = cmd.reply.send(result);
          });
        }
      , Some(cmd) = continue_conversation_rx.recv() => {
          debug!("Received ContinueConversation");
          let manager = manager.clone();
          tokio::spawn(async move {
            let result = manager
              .continue_conversation(
                &cmd.history,
                &cmd.user_message,
                cmd.provider
              )
              .await;
            let _ = cmd.reply.send(result);
          });
        }
      , Some(cmd) = execute_template_rx.recv() => {
          debug!("Received ExecuteTemplate: {}", cmd.template);
          let manager = manager.clone();
          tokio::spawn(async move {
            let result = manager
              .execute_named_template(
                &cmd.template,
                &cmd.variables,
                cmd.provider
              )
              .await;
            let _ = cmd.reply.send(result);
          });
        }
      , Some(cmd) = stream_message_rx.recv() => {
          debug!("Received StreamMessage");
          let manager = manager.clone();
          tokio::spawn(async move {
            let result = manager
              .send_message_stream(
                &cmd.text,
                cmd.provider,
                cmd.chunks,
                cmd.cancel
              )
              .await;
            let _ = cmd.reply.send(result);
          });
        }
      , Some(cmd) = set_default_provider_rx.recv() => {
          debug!("Received SetDefaultProvider: {}", cmd.provider);
          manager.set_default_provider(cmd.provider);
          let _ = cmd.reply.send(Ok(()));
        }
      , Some(cmd) = clear_cache_rx.recv() => {
          debug!("Received ClearCache");
          manager.clear_cache();
          let _ = cmd.reply.send(Ok(()));
        }
      , Some(cmd) = get_model_lists_rx.recv() => {
          debug!("Received GetModelLists");
          let _ = cmd.reply.send(Ok(manager.models()));
        }
      , Some(cmd) = kill_process_rx.recv() => {
          debug!("Received KillProcess");
          let _ = cmd.reply.send(Ok(()));
          info!("AiBackend shutting down");
          break;
        }
      , else => {
          info!("All AiBackend channels closed");
          break;
        }
      }
    }
}
