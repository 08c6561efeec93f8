//! Upstream agent clients.
//!
//! [`AgentClient`] performs one buffered request/response call per message;
//! [`stream::StreamingClient`] consumes the event-stream variant of the same
//! endpoints. Both pick the endpoint from the session: a session without a
//! bound conversation posts to the new-conversation endpoint, otherwise to the
//! message-append endpoint of its conversation.

pub mod http;
pub mod stream;

pub use stream::{ActiveGuard, StreamEvent, StreamListener, StreamOptions, StreamingClient};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use self::http::{bearer_headers, build_client, join_url, status_to_error, transport_error};
use crate::config::{StreamConfig, TetherConfig};
use crate::error::Result;
use crate::router::MessageProcessor;
use crate::session::{Session, SessionRegistry};
use crate::types::{AgentReply, Message};
use crate::util::timeout::with_timeout;

/// Path of the endpoint a message for `session` is posted to.
pub fn endpoint_path(session: &Session) -> String {
    match session.conversation_id.as_deref() {
        Some(conversation_id) => format!("conversations/{conversation_id}/messages"),
        None => "conversations".to_string(),
    }
}

/// JSON body shared by the buffered and streamed calls.
pub fn request_body(session: &Session, message: &Message, stream: bool) -> Value {
    json!({
        "message": message.content,
        "workspaceId": session.workspace_id,
        "agentId": session.agent_id,
        "stream": stream,
    })
}

/// Buffered upstream call with per-attempt timeout and retry.
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    config: StreamConfig,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        config: StreamConfig,
    ) -> Result<Self> {
        Ok(Self {
            http: build_client()?,
            base_url: base_url.into(),
            api_key,
            config,
        })
    }

    pub fn from_config(config: &TetherConfig) -> Result<Self> {
        Self::new(
            config.base_url.clone(),
            config.api_key.clone(),
            config.stream.clone(),
        )
    }

    /// Send one message and wait for the complete reply.
    pub async fn send(&self, session: &Session, message: &Message) -> Result<AgentReply> {
        let url = join_url(&self.base_url, &endpoint_path(session));
        let body = request_body(session, message, false);
        debug!(session_id = %session.id, url = %url, "Sending message upstream");

        self.config
            .retry
            .execute(|| with_timeout(self.config.request_timeout, self.send_once(&url, &body)))
            .await
    }

    async fn send_once(&self, url: &str, body: &Value) -> Result<AgentReply> {
        let resp = self
            .http
            .post(url)
            .headers(bearer_headers(self.api_key.as_deref()))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &text));
        }

        let payload: Value = resp.json().await.map_err(transport_error)?;
        Ok(AgentReply::from_payload(payload))
    }
}

/// [`MessageProcessor`] that forwards every admitted message upstream and
/// binds the returned conversation id to sessions that have none.
pub struct UpstreamProcessor {
    client: AgentClient,
    registry: Arc<SessionRegistry>,
}

impl UpstreamProcessor {
    pub fn new(client: AgentClient, registry: Arc<SessionRegistry>) -> Self {
        Self { client, registry }
    }
}

#[async_trait]
impl MessageProcessor for UpstreamProcessor {
    async fn process(&self, session: &Session, message: &Message) -> Result<AgentReply> {
        let reply = self.client.send(session, message).await?;
        if session.conversation_id.is_none() {
            if let Some(conversation_id) = reply.conversation_id.as_deref() {
                self.registry
                    .bind_conversation_once(&session.id, conversation_id)
                    .await;
            }
        }
        Ok(reply)
    }
}
