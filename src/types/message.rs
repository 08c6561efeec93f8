//! Conversation message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A message in a conversation.
///
/// Messages are immutable once appended to a history; insertion order is the
/// only meaningful order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_summary: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    /// Create a message with a fresh id.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            is_summary: false,
            is_error: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Synthetic marker standing in for summarized history.
    pub fn summary_marker(content: impl Into<String>) -> Self {
        Self {
            is_summary: true,
            ..Self::system(content)
        }
    }

    pub fn with_error(mut self) -> Self {
        self.is_error = true;
        self
    }

    /// Assign an id if the caller left it empty.
    pub fn ensure_id(&mut self) {
        if self.id.trim().is_empty() {
            self.id = new_message_id();
        }
    }

    /// Approximate token count: content length / 4, rounded up.
    pub fn estimated_tokens(&self) -> usize {
        self.content.chars().count().div_ceil(4)
    }
}

pub fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}
