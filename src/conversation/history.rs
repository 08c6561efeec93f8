//! Bounded, append-only message log with token-budget trimming.

use std::collections::VecDeque;

use bon::Builder;

use crate::error::{Result, TetherError};
use crate::types::Message;

/// Filters for [`ConversationHistory::get_history`].
#[derive(Debug, Clone, Builder)]
pub struct HistoryQuery {
    /// Include synthetic summary markers.
    #[builder(default = true)]
    pub include_summaries: bool,
    /// Keep only the last N matching messages.
    pub limit: Option<usize>,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Message log for one conversation.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    conversation_id: String,
    messages: VecDeque<Message>,
    token_count: usize,
    max_history: usize,
    max_tokens: usize,
}

impl ConversationHistory {
    pub fn new(conversation_id: impl Into<String>, max_history: usize, max_tokens: usize) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: VecDeque::new(),
            token_count: 0,
            max_history,
            max_tokens,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Append a message, then trim to the count and token budgets.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Validation`] for a blank or duplicate message id.
    pub fn add_message(&mut self, message: Message) -> Result<()> {
        if message.id.trim().is_empty() {
            return Err(TetherError::Validation("message id is required".into()));
        }
        if self.messages.iter().any(|m| m.id == message.id) {
            return Err(TetherError::Validation(format!(
                "message {} already exists in conversation {}",
                message.id, self.conversation_id
            )));
        }

        self.token_count += message.estimated_tokens();
        self.messages.push_back(message);
        self.trim();
        Ok(())
    }

    /// Replace the whole log (used by summarization), then trim.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.token_count = messages.iter().map(Message::estimated_tokens).sum();
        self.messages = messages.into();
        self.trim();
    }

    /// Snapshot in insertion order. Never mutates the stored log.
    pub fn get_history(&self, query: &HistoryQuery) -> Vec<Message> {
        let filtered: Vec<&Message> = self
            .messages
            .iter()
            .filter(|m| query.include_summaries || !m.is_summary)
            .collect();
        let skip = match query.limit {
            Some(limit) => filtered.len().saturating_sub(limit),
            None => 0,
        };
        filtered.into_iter().skip(skip).cloned().collect()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.back()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Share of the token budget in use.
    pub fn token_ratio(&self) -> f64 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        self.token_count as f64 / self.max_tokens as f64
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.token_count = 0;
    }

    /// Messages that are not summary markers.
    pub fn conversational_len(&self) -> usize {
        self.messages.iter().filter(|m| !m.is_summary).count()
    }

    fn has_leading_marker(&self) -> bool {
        self.messages.front().is_some_and(|m| m.is_summary)
    }

    fn trim(&mut self) {
        while self.messages.len() > self.max_history {
            self.drop_oldest();
        }
        // The token budget never drops the last conversational message, and a
        // leading summary marker stays as long as one follows it.
        let floor = if self.has_leading_marker() { 2 } else { 1 };
        while self.token_count > self.max_tokens && self.messages.len() > floor {
            self.drop_oldest();
        }
    }

    /// Remove the oldest message, skipping a leading summary marker while at
    /// least two messages follow it.
    fn drop_oldest(&mut self) {
        let index = if self.has_leading_marker() && self.messages.len() > 2 {
            1
        } else {
            0
        };
        if let Some(removed) = self.messages.remove(index) {
            self.token_count = self.token_count.saturating_sub(removed.estimated_tokens());
        }
    }
}
