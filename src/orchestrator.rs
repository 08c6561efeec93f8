//! Orchestrator: binds sessions to conversations and routes every upstream
//! call through the router's admission gate.
//!
//! Flow for one message: resolve the session, fetch or start its
//! conversation, append the user message, wait for admission, call upstream
//! (buffered or streamed), append the assistant reply.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{AgentClient, StreamOptions, StreamingClient, UpstreamProcessor};
use crate::config::TetherConfig;
use crate::conversation::{
    Conversation, ConversationSnapshot, HistoryQuery, Summarizer, TailSummarizer,
};
use crate::error::{Result, TetherError};
use crate::router::{MessageProcessor, MessageRouter, QueueStatus};
use crate::session::{
    FileSessionStore, HttpValidator, RestoreReport, Session, SessionOptions, SessionPatch,
    SessionRegistry,
};
use crate::types::reply::content_of;
use crate::types::{AgentReply, Message};

/// Reason used when a session is deleted under a live conversation.
pub const SESSION_DELETED: &str = "session_deleted";

/// Combined view returned by [`Orchestrator::state`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session: Session,
    pub conversation: Option<ConversationSnapshot>,
    pub queue: QueueStatus,
    pub active_streams: usize,
}

struct OrchestratorInner {
    config: TetherConfig,
    registry: Arc<SessionRegistry>,
    router: MessageRouter,
    streaming: StreamingClient,
    summarizer: RwLock<Arc<dyn Summarizer>>,
    conversations: Mutex<HashMap<String, Arc<Conversation>>>,
}

/// Entry point for embedding processes. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Assemble from parts. The processor handles buffered calls; the
    /// streaming client handles streamed ones.
    pub fn new(
        config: TetherConfig,
        registry: Arc<SessionRegistry>,
        processor: Arc<dyn MessageProcessor>,
        streaming: StreamingClient,
    ) -> Self {
        let router = MessageRouter::new(config.router.clone(), Arc::clone(&registry), processor);
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                registry,
                router,
                streaming,
                summarizer: RwLock::new(Arc::new(TailSummarizer::default())),
                conversations: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wire the default stack: file-backed store, HTTP validator, upstream
    /// processor and streaming client, all from `config`.
    pub fn from_config(config: TetherConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(FileSessionStore::new(config.storage_dir.clone()));
        let validator = Arc::new(HttpValidator::new(
            config.base_url.clone(),
            config.api_key.clone(),
            config.session.validation_cache_ttl,
        )?);
        let registry = Arc::new(
            SessionRegistry::new(config.session.clone(), store).with_validator(validator),
        );
        let processor = Arc::new(UpstreamProcessor::new(
            AgentClient::from_config(&config)?,
            Arc::clone(&registry),
        ));
        let streaming = StreamingClient::from_config(&config, Arc::clone(&registry))?;
        Ok(Self::new(config, registry, processor, streaming))
    }

    /// Replace the summarizer used for conversations started from now on.
    pub fn set_summarizer(&self, summarizer: Arc<dyn Summarizer>) {
        *self.inner.summarizer.write() = summarizer;
    }

    /// Restore persisted sessions and start the TTL sweeper.
    pub async fn start(&self) -> Result<RestoreReport> {
        let report = self.inner.registry.restore().await?;
        self.inner.registry.spawn_sweeper();
        Ok(report)
    }

    pub fn config(&self) -> &TetherConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn streaming(&self) -> &StreamingClient {
        &self.inner.streaming
    }

    pub async fn create_session(
        &self,
        workspace_id: &str,
        agent_id: &str,
        options: SessionOptions,
    ) -> Result<Session> {
        self.inner.registry.create(workspace_id, agent_id, options).await
    }

    /// Look up a session, refreshing its activity stamp.
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.inner.registry.get(session_id)
    }

    /// Tear down everything attached to a session, then delete it.
    pub async fn delete_session(&self, session_id: &str) -> bool {
        self.inner.streaming.cancel(session_id);
        self.inner.streaming.clear_listeners(session_id);
        self.inner.router.forget(session_id);
        let conversation = self.inner.conversations.lock().remove(session_id);
        if let Some(conversation) = conversation {
            conversation.complete(SESSION_DELETED);
            conversation.destroy();
        }
        self.inner.registry.delete(session_id).await
    }

    /// Send a message through the router and wait for the buffered reply.
    ///
    /// Both the user message and the reply are appended to the session's
    /// conversation. An upstream failure is recorded as an assistant message
    /// flagged `is_error` before the error is returned.
    pub async fn send_message(
        &self,
        session_id: &str,
        content: impl Into<String>,
    ) -> Result<AgentReply> {
        let conversation = self.inner.conversation_for(session_id).await?;
        let user = conversation.add_message(Message::user(content))?;

        match self.inner.router.queue_message(session_id, user).await {
            Ok(reply) => {
                append_quietly(&conversation, Message::assistant(reply.content.clone()));
                Ok(reply)
            }
            Err(e) => {
                append_quietly(&conversation, Message::assistant(e.to_string()).with_error());
                Err(e)
            }
        }
    }

    /// Stream the reply to a message.
    ///
    /// The sequence waits for admission first and holds the slot until it
    /// ends or is dropped. `content` deltas are accumulated and appended as
    /// one assistant message once the upstream closes.
    pub fn stream_response(
        &self,
        session_id: &str,
        content: impl Into<String>,
        options: StreamOptions,
    ) -> BoxStream<'static, Result<Value>> {
        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        let content = content.into();

        let stream = async_stream::stream! {
            let conversation = match inner.conversation_for(&session_id).await {
                Ok(conversation) => conversation,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let user = match conversation.add_message(Message::user(content)) {
                Ok(user) => user,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            // Cancellation must reach the caller while it waits for a slot.
            let token = match options.cancel {
                Some(parent) => parent.child_token(),
                None => CancellationToken::new(),
            };
            let mut waiting = Some(inner.streaming.track(&session_id, token.clone()));
            let admitted = tokio::select! {
                biased;
                _ = token.cancelled() => Err(TetherError::Aborted),
                admitted = inner.router.admit(&session_id, &user.id) => admitted,
            };
            let permit = match admitted {
                Ok(permit) => permit,
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "Stream not admitted");
                    yield Err(e);
                    return;
                }
            };
            debug!(
                session_id = %session_id,
                waited_ms = permit.waited().as_millis() as u64,
                "Stream admitted"
            );

            let options = StreamOptions::builder().cancel(token).build();
            let mut upstream = inner.streaming.stream(&session_id, user, options);
            let mut text = String::new();
            let mut failed = false;
            while let Some(item) = upstream.next().await {
                // The upstream stream has registered itself by now.
                drop(waiting.take());
                match item {
                    Ok(chunk) => {
                        if let Some(delta) = content_of(&chunk) {
                            text.push_str(delta);
                        }
                        yield Ok(chunk);
                    }
                    Err(e) => {
                        failed = true;
                        let note = Message::assistant(e.to_string()).with_error();
                        append_quietly(&conversation, note);
                        yield Err(e);
                        break;
                    }
                }
            }
            drop(waiting);
            drop(upstream);
            drop(permit);

            if !failed && !text.is_empty() {
                append_quietly(&conversation, Message::assistant(text));
            }
        };

        Box::pin(stream)
    }

    /// Append a message to the session's conversation without calling upstream.
    pub async fn add_message(&self, session_id: &str, message: Message) -> Result<Message> {
        self.inner
            .conversation_for(session_id)
            .await?
            .add_message(message)
    }

    /// History of the session's current conversation (empty if none started).
    pub fn history(&self, session_id: &str, query: &HistoryQuery) -> Result<Vec<Message>> {
        if !self.inner.registry.contains(session_id) {
            return Err(TetherError::SessionNotFound(session_id.to_string()));
        }
        Ok(self
            .inner
            .conversations
            .lock()
            .get(session_id)
            .map(|c| c.history(query))
            .unwrap_or_default())
    }

    pub fn queue_status(&self, session_id: &str) -> QueueStatus {
        self.inner.router.queue_status(session_id)
    }

    /// Session, conversation, queue and stream state in one read.
    pub fn state(&self, session_id: &str) -> Result<SessionState> {
        let session = self
            .inner
            .registry
            .peek(session_id)
            .ok_or_else(|| TetherError::SessionNotFound(session_id.to_string()))?;
        let conversation = self
            .inner
            .conversations
            .lock()
            .get(session_id)
            .map(|c| c.snapshot());
        Ok(SessionState {
            session,
            conversation,
            queue: self.inner.router.queue_status(session_id),
            active_streams: self.inner.streaming.active_streams(session_id),
        })
    }

    /// Complete the session's conversation. Returns false if there is none
    /// or it was already terminal.
    pub fn complete_conversation(&self, session_id: &str, reason: &str) -> Result<bool> {
        if !self.inner.registry.contains(session_id) {
            return Err(TetherError::SessionNotFound(session_id.to_string()));
        }
        let conversation = self.inner.conversations.lock().get(session_id).cloned();
        Ok(conversation.is_some_and(|c| c.complete(reason)))
    }

    pub fn cancel_stream(&self, session_id: &str) -> bool {
        self.inner.streaming.cancel(session_id)
    }

    /// Stop timers and streams, then flush and release the registry.
    pub async fn shutdown(&self) {
        let conversations: Vec<(String, Arc<Conversation>)> =
            self.inner.conversations.lock().drain().collect();
        for (session_id, conversation) in &conversations {
            conversation.destroy();
            self.inner.streaming.cancel(session_id);
            self.inner.router.cancel_pending(session_id);
        }
        self.inner.registry.shutdown().await;
        info!(conversations = conversations.len(), "Orchestrator shut down");
    }
}

impl OrchestratorInner {
    /// The live conversation for a session, starting a fresh one when there
    /// is none or the previous one reached a terminal state.
    async fn conversation_for(&self, session_id: &str) -> Result<Arc<Conversation>> {
        let Some(session) = self.registry.get(session_id) else {
            return Err(TetherError::SessionNotFound(session_id.to_string()));
        };

        let (conversation, rebind) = {
            let mut conversations = self.conversations.lock();
            conversations.retain(|id, _| id == session_id || self.registry.contains(id));

            let previous = match conversations.get(session_id) {
                Some(existing) if !existing.state().is_terminal() => {
                    return Ok(Arc::clone(existing));
                }
                Some(existing) => Some(Arc::clone(existing)),
                None => None,
            };
            if let Some(previous) = &previous {
                previous.destroy();
            }

            let conversation = Conversation::with_summarizer(
                session_id,
                self.config.conversation.clone(),
                self.summarizer.read().clone(),
            );
            conversations.insert(session_id.to_string(), Arc::clone(&conversation));
            (conversation, previous.is_some())
        };

        if rebind && session.conversation_id.is_some() {
            self.registry
                .update(session_id, SessionPatch::clear_conversation())
                .await;
        }
        debug!(
            session_id,
            conversation_id = %conversation.id(),
            rebind,
            "Conversation started for session"
        );
        Ok(conversation)
    }
}

/// Append, logging instead of failing when the conversation already ended.
fn append_quietly(conversation: &Conversation, message: Message) {
    if let Err(e) = conversation.add_message(message) {
        debug!(conversation_id = %conversation.id(), error = %e, "Reply not recorded");
    }
}
