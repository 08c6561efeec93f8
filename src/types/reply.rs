//! Upstream agent reply types.

use serde::{Deserialize, Serialize};

/// Result of one upstream agent call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    /// Assistant text extracted from the upstream payload.
    pub content: String,
    /// Conversation id reported by the upstream, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// The untouched upstream payload.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl AgentReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            conversation_id: None,
            raw: serde_json::Value::Null,
        }
    }

    /// Build a reply from an upstream JSON payload.
    ///
    /// Accepts `content`, `message.content` or `text` for the assistant text
    /// and `conversationId` / `conversation_id` for the conversation id.
    pub fn from_payload(raw: serde_json::Value) -> Self {
        let content = content_of(&raw).unwrap_or_default().to_string();
        let conversation_id = conversation_id_of(&raw).map(str::to_string);
        Self {
            content,
            conversation_id,
            raw,
        }
    }
}

/// Text carried by a chunk or reply payload.
pub fn content_of(value: &serde_json::Value) -> Option<&str> {
    value
        .get("content")
        .and_then(|c| c.as_str())
        .or_else(|| {
            value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
        })
        .or_else(|| value.get("text").and_then(|t| t.as_str()))
}

/// Conversation id carried by a chunk or reply payload.
pub fn conversation_id_of(value: &serde_json::Value) -> Option<&str> {
    value
        .get("conversationId")
        .or_else(|| value.get("conversation_id"))
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
}
