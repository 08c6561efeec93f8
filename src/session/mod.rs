//! Sessions: client-scoped identities binding a workspace/agent pair.
//!
//! - [`registry::SessionRegistry`] owns the resident sessions, TTL eviction and shutdown
//! - [`store::SessionStore`] persists one JSON record per session
//! - [`validator::SessionValidator`] checks workspace/agent existence upstream

pub mod registry;
pub mod store;
pub mod validator;

pub use registry::{RestoreReport, SessionRegistry, SweepReport};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use validator::{HttpValidator, SessionValidator, ValidationResult};

use std::collections::BTreeSet;
use std::time::Duration;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SESSION_ID_PREFIX: &str = "session_";

/// A client session with an upstream agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub workspace_id: String,
    pub agent_id: String,
    /// Upstream conversation currently bound to this session.
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Live consumers; a session with listeners is never evicted.
    #[serde(skip)]
    pub listeners: BTreeSet<String>,
    #[serde(default)]
    pub files: Vec<FileRef>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    pub active_requests: usize,
    #[serde(skip)]
    pub queued_requests: usize,
}

impl Session {
    pub(crate) fn new(workspace_id: String, agent_id: String, options: SessionOptions) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}{}", SESSION_ID_PREFIX, Uuid::new_v4().simple()),
            workspace_id,
            agent_id,
            conversation_id: options.conversation_id,
            created_at: now,
            updated_at: now,
            last_activity: now,
            listeners: BTreeSet::new(),
            files: options.files,
            metadata: options.metadata,
            active_requests: 0,
            queued_requests: 0,
        }
    }

    /// Refresh the activity stamp; never moves it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }

    /// Idle past `ttl` with nobody listening.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.listeners.is_empty() && self.idle_for(now) > ttl
    }

    fn apply(&mut self, patch: SessionPatch) {
        if let Some(conversation_id) = patch.conversation_id {
            self.conversation_id = conversation_id;
        }
        if let Some(metadata) = patch.metadata {
            self.metadata.extend(metadata);
        }
        if let Some(files) = patch.files {
            self.files = files;
        }
    }
}

/// Reference to a file attached to a session. Storage lives elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub added_at: DateTime<Utc>,
}

impl FileRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mime_type: None,
            size: None,
            added_at: Utc::now(),
        }
    }
}

/// Options for [`SessionRegistry::create`].
#[derive(Debug, Clone, Builder)]
pub struct SessionOptions {
    /// Check workspace and agent existence when a validator is configured.
    #[builder(default = true)]
    pub validate: bool,
    pub conversation_id: Option<String>,
    #[builder(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[builder(default)]
    pub files: Vec<FileRef>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Partial update for [`SessionRegistry::update`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub conversation_id: Option<Option<String>>,
    /// Merged key-by-key into the existing metadata.
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    /// Replaces the attached file list.
    pub files: Option<Vec<FileRef>>,
}

impl SessionPatch {
    pub fn bind_conversation(id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(Some(id.into())),
            ..Default::default()
        }
    }

    pub fn clear_conversation() -> Self {
        Self {
            conversation_id: Some(None),
            ..Default::default()
        }
    }

    pub fn metadata(metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            metadata: Some(metadata),
            ..Default::default()
        }
    }
}
