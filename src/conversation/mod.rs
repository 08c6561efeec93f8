//! Conversation lifecycle: a bounded history driven by a small state machine
//! with idle and max-duration timers.
//!
//! ```text
//! initializing -> active <-> idle
//!                    \        \
//!                     +--------+--> completed | error   (terminal)
//! ```
//!
//! The idle timer restarts on every accepted message and moves an active
//! conversation to idle. The max-duration timer is anchored at creation and
//! completes the conversation with reason `max_duration_reached`. Both timers
//! are cleared on any terminal transition and when the conversation is dropped.

pub mod history;
pub mod summarizer;

pub use history::{ConversationHistory, HistoryQuery};
pub use summarizer::{Summarizer, TailSummarizer};

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConversationConfig;
use crate::error::{Result, TetherError};
use crate::types::{Message, Role};

const EVENT_CAPACITY: usize = 128;

/// Reason recorded when the max-duration timer fires.
pub const MAX_DURATION_REACHED: &str = "max_duration_reached";

/// Lifecycle state of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConversationState {
    Initializing,
    Active,
    Idle,
    Completed,
    Error,
}

impl ConversationState {
    /// `completed` and `error` accept no further messages.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Notifications emitted by a [`Conversation`].
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    StateChanged {
        conversation_id: String,
        from: ConversationState,
        to: ConversationState,
    },
    MessageAdded {
        conversation_id: String,
        message_id: String,
        role: Role,
    },
    Summarized {
        conversation_id: String,
        before: usize,
        after: usize,
    },
    SummarizationFailed {
        conversation_id: String,
        error: String,
    },
    Completed {
        conversation_id: String,
        reason: String,
        message_count: usize,
        token_count: usize,
    },
    Failed {
        conversation_id: String,
        error: String,
    },
}

/// Point-in-time view of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub id: String,
    pub session_id: String,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: usize,
    pub token_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    /// Carries the generation it was armed with.
    Idle(u64),
    MaxDuration,
}

struct ConversationInner {
    state: ConversationState,
    history: ConversationHistory,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    completion_reason: Option<String>,
    error: Option<String>,
    idle_timer: Option<JoinHandle<()>>,
    idle_generation: u64,
    max_duration_timer: Option<JoinHandle<()>>,
}

impl ConversationInner {
    fn clear_timers(&mut self) {
        self.idle_generation += 1;
        if let Some(handle) = self.idle_timer.take() {
            handle.abort();
        }
        if let Some(handle) = self.max_duration_timer.take() {
            handle.abort();
        }
    }
}

/// A single conversation bound to a session.
///
/// Must be created inside a Tokio runtime; timers run as spawned tasks that
/// only hold a weak reference back to the conversation.
pub struct Conversation {
    id: String,
    session_id: String,
    config: ConversationConfig,
    summarizer: Arc<dyn Summarizer>,
    inner: Mutex<ConversationInner>,
    events: broadcast::Sender<ConversationEvent>,
    state_tx: watch::Sender<ConversationState>,
    weak_self: Weak<Conversation>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Conversation {
    /// Start a conversation with the default tail summarizer.
    pub fn new(session_id: impl Into<String>, config: ConversationConfig) -> Arc<Self> {
        Self::with_summarizer(session_id, config, Arc::new(TailSummarizer::default()))
    }

    pub fn with_summarizer(
        session_id: impl Into<String>,
        config: ConversationConfig,
        summarizer: Arc<dyn Summarizer>,
    ) -> Arc<Self> {
        let id = format!("conv_{}", Uuid::new_v4().simple());
        let now = Utc::now();
        let history = ConversationHistory::new(id.clone(), config.max_history, config.max_tokens);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, _) = watch::channel(ConversationState::Initializing);

        let conversation = Arc::new_cyclic(|weak_self| Self {
            id,
            session_id: session_id.into(),
            config,
            summarizer,
            inner: Mutex::new(ConversationInner {
                state: ConversationState::Initializing,
                history,
                created_at: now,
                updated_at: now,
                last_activity: now,
                completion_reason: None,
                error: None,
                idle_timer: None,
                idle_generation: 0,
                max_duration_timer: None,
            }),
            events,
            state_tx,
            weak_self: weak_self.clone(),
        });
        conversation.start();
        conversation
    }

    fn start(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, ConversationState::Active);
        self.restart_idle_timer(&mut inner);
        inner.max_duration_timer =
            Some(self.spawn_timer(Timer::MaxDuration, self.config.max_duration));
        debug!(conversation_id = %self.id, session_id = %self.session_id, "Conversation started");
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub fn state(&self) -> ConversationState {
        self.inner.lock().state
    }

    /// Subscribe to state changes via a [`watch::Receiver`].
    pub fn watch_state(&self) -> watch::Receiver<ConversationState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Append a message.
    ///
    /// An idle conversation becomes active again and the idle timer restarts.
    /// Crossing the summarize threshold condenses the history in place; a
    /// failing summarizer is reported via an event and otherwise ignored.
    ///
    /// # Errors
    ///
    /// - [`TetherError::InvalidState`] once the conversation is completed or failed.
    /// - Any history error, which also moves the conversation to `error`.
    pub fn add_message(&self, mut message: Message) -> Result<Message> {
        message.ensure_id();
        let mut inner = self.inner.lock();

        if inner.state.is_terminal() {
            return Err(TetherError::InvalidState(format!(
                "conversation {} is {}",
                self.id, inner.state
            )));
        }
        if inner.state == ConversationState::Idle {
            self.transition(&mut inner, ConversationState::Active);
        }

        if let Err(e) = inner.history.add_message(message.clone()) {
            self.fail_locked(&mut inner, e.to_string());
            return Err(e);
        }

        let now = Utc::now();
        inner.updated_at = now;
        inner.last_activity = now;
        self.restart_idle_timer(&mut inner);

        self.emit(ConversationEvent::MessageAdded {
            conversation_id: self.id.clone(),
            message_id: message.id.clone(),
            role: message.role,
        });

        // A lone message has no earlier history to condense.
        if inner.history.conversational_len() > 1
            && inner.history.token_ratio() >= self.config.summarize_threshold
        {
            self.summarize_locked(&mut inner);
        }

        Ok(message)
    }

    /// Snapshot of the stored messages. Never mutates the conversation.
    pub fn history(&self, query: &HistoryQuery) -> Vec<Message> {
        self.inner.lock().history.get_history(query)
    }

    pub fn message_count(&self) -> usize {
        self.inner.lock().history.len()
    }

    pub fn token_count(&self) -> usize {
        self.inner.lock().history.token_count()
    }

    /// Complete the conversation. Returns `false` if it was already terminal.
    pub fn complete(&self, reason: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.clear_timers();
        inner.completion_reason = Some(reason.to_string());
        inner.updated_at = Utc::now();
        self.transition(&mut inner, ConversationState::Completed);

        let message_count = inner.history.len();
        let token_count = inner.history.token_count();
        info!(
            conversation_id = %self.id,
            session_id = %self.session_id,
            reason,
            message_count,
            token_count,
            "Conversation completed"
        );
        self.emit(ConversationEvent::Completed {
            conversation_id: self.id.clone(),
            reason: reason.to_string(),
            message_count,
            token_count,
        });
        true
    }

    /// Move to `error`. Returns `false` if it was already terminal.
    pub fn fail(&self, error: impl Into<String>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        self.fail_locked(&mut inner, error.into());
        true
    }

    /// Stop the timers without changing state.
    pub fn destroy(&self) {
        self.inner.lock().clear_timers();
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        let inner = self.inner.lock();
        ConversationSnapshot {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            state: inner.state,
            created_at: inner.created_at,
            updated_at: inner.updated_at,
            last_activity: inner.last_activity,
            message_count: inner.history.len(),
            token_count: inner.history.token_count(),
            completion_reason: inner.completion_reason.clone(),
            error: inner.error.clone(),
        }
    }

    fn summarize_locked(&self, inner: &mut ConversationInner) {
        let before = inner.history.len();
        match self.summarizer.summarize(&inner.history.messages()) {
            Ok(condensed) => {
                inner.history.replace(condensed);
                let after = inner.history.len();
                debug!(conversation_id = %self.id, before, after, "History summarized");
                self.emit(ConversationEvent::Summarized {
                    conversation_id: self.id.clone(),
                    before,
                    after,
                });
            }
            Err(e) => {
                warn!(conversation_id = %self.id, error = %e, "Summarization failed");
                self.emit(ConversationEvent::SummarizationFailed {
                    conversation_id: self.id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn fail_locked(&self, inner: &mut ConversationInner, error: String) {
        inner.clear_timers();
        inner.error = Some(error.clone());
        inner.updated_at = Utc::now();
        self.transition(inner, ConversationState::Error);
        warn!(conversation_id = %self.id, error = %error, "Conversation failed");
        self.emit(ConversationEvent::Failed {
            conversation_id: self.id.clone(),
            error,
        });
    }

    /// Abort the running idle timer and arm a new one under a fresh generation.
    fn restart_idle_timer(&self, inner: &mut ConversationInner) {
        if let Some(handle) = inner.idle_timer.take() {
            handle.abort();
        }
        inner.idle_generation += 1;
        inner.idle_timer = Some(self.spawn_timer(
            Timer::Idle(inner.idle_generation),
            self.config.idle_timeout,
        ));
    }

    fn on_idle_timeout(&self, generation: u64) {
        let mut inner = self.inner.lock();
        // A timer that fired while a message was restarting it is stale.
        if inner.idle_generation != generation {
            return;
        }
        inner.idle_timer = None;
        if inner.state == ConversationState::Active {
            self.transition(&mut inner, ConversationState::Idle);
        }
    }

    fn transition(&self, inner: &mut ConversationInner, to: ConversationState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.state_tx.send_replace(to);
        debug!(conversation_id = %self.id, %from, %to, "Conversation state changed");
        self.emit(ConversationEvent::StateChanged {
            conversation_id: self.id.clone(),
            from,
            to,
        });
    }

    fn spawn_timer(&self, timer: Timer, delay: Duration) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(conversation) = weak.upgrade() else {
                return;
            };
            match timer {
                Timer::Idle(generation) => conversation.on_idle_timeout(generation),
                Timer::MaxDuration => {
                    conversation.complete(MAX_DURATION_REACHED);
                }
            }
        })
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.inner.get_mut().clear_timers();
    }
}
