//! History summarization policies.

use crate::error::Result;
use crate::types::Message;

/// Condenses a history once it nears its token budget.
///
/// Implementations must return a synthetic summary marker (see
/// [`Message::summary_marker`]) followed by the retained tail, so the
/// conversation keeps its continuity.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, messages: &[Message]) -> Result<Vec<Message>>;
}

/// Keeps the most recent share of messages behind one marker.
#[derive(Debug, Clone)]
pub struct TailSummarizer {
    keep_ratio: f64,
}

impl TailSummarizer {
    /// `keep_ratio` is clamped to `(0, 1]`.
    pub fn new(keep_ratio: f64) -> Self {
        let keep_ratio = if keep_ratio.is_finite() {
            keep_ratio.clamp(f64::EPSILON, 1.0)
        } else {
            0.5
        };
        Self { keep_ratio }
    }

    pub fn keep_ratio(&self) -> f64 {
        self.keep_ratio
    }
}

impl Default for TailSummarizer {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl Summarizer for TailSummarizer {
    fn summarize(&self, messages: &[Message]) -> Result<Vec<Message>> {
        // Earlier markers are folded into the new one.
        let conversational: Vec<&Message> = messages.iter().filter(|m| !m.is_summary).collect();
        if conversational.is_empty() {
            return Ok(messages.to_vec());
        }
        let total = conversational.len();
        let keep = ((total as f64 * self.keep_ratio).ceil() as usize).clamp(1, total);
        let dropped = total - keep;

        let mut out = Vec::with_capacity(keep + 1);
        out.push(Message::summary_marker(format!(
            "[Summary] {dropped} earlier message(s) were summarized to stay within the token budget."
        )));
        out.extend(conversational[total - keep..].iter().map(|m| (*m).clone()));
        Ok(out)
    }
}
