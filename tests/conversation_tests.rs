//! Tests for the conversation state machine, timers and summarization.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use tether::config::ConversationConfig;
use tether::conversation::{
    Conversation, ConversationEvent, ConversationState, HistoryQuery, Summarizer,
    MAX_DURATION_REACHED,
};
use tether::error::{Result, TetherError};
use tether::types::Message;

fn drain(rx: &mut tokio::sync::broadcast::Receiver<ConversationEvent>) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_then_message_reactivates() {
    let conv = Conversation::new(
        "s1",
        ConversationConfig::builder()
            .idle_timeout(Duration::from_millis(1000))
            .build(),
    );
    let mut events = conv.subscribe();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(conv.state(), ConversationState::Idle);

    conv.add_message(Message::user("still here")).unwrap();
    assert_eq!(conv.state(), ConversationState::Active);

    let transitions: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ConversationEvent::StateChanged { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (ConversationState::Active, ConversationState::Idle),
            (ConversationState::Idle, ConversationState::Active),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn max_duration_completes_the_conversation() {
    let conv = Conversation::new(
        "s1",
        ConversationConfig::builder()
            .idle_timeout(Duration::from_secs(60))
            .max_duration(Duration::from_millis(5000))
            .build(),
    );
    let mut events = conv.subscribe();
    conv.add_message(Message::user("hello")).unwrap();

    tokio::time::sleep(Duration::from_millis(6000)).await;

    assert_eq!(conv.state(), ConversationState::Completed);
    let snapshot = conv.snapshot();
    assert_eq!(snapshot.completion_reason.as_deref(), Some(MAX_DURATION_REACHED));

    let completed: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ConversationEvent::Completed {
                reason,
                message_count,
                ..
            } => Some((reason, message_count)),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![(MAX_DURATION_REACHED.to_string(), 1)]);
}

#[tokio::test(start_paused = true)]
async fn max_duration_fires_even_while_idle() {
    let conv = Conversation::new(
        "s1",
        ConversationConfig::builder()
            .idle_timeout(Duration::from_millis(100))
            .max_duration(Duration::from_millis(1000))
            .build(),
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(conv.state(), ConversationState::Idle);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(conv.state(), ConversationState::Completed);
}

#[tokio::test(start_paused = true)]
async fn completed_conversation_rejects_messages_and_stops_timers() {
    let conv = Conversation::new(
        "s1",
        ConversationConfig::builder()
            .idle_timeout(Duration::from_millis(100))
            .build(),
    );
    assert!(conv.complete("user_ended"));
    assert!(!conv.complete("user_ended"));

    let err = conv.add_message(Message::user("late")).unwrap_err();
    assert!(matches!(err, TetherError::InvalidState(_)));

    // The idle timer was cleared, so the terminal state sticks.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(conv.state(), ConversationState::Completed);
    assert_eq!(conv.snapshot().completion_reason.as_deref(), Some("user_ended"));
}

#[tokio::test(start_paused = true)]
async fn history_respects_limits_after_many_messages() {
    let conv = Conversation::new(
        "s1",
        ConversationConfig::builder()
            .max_history(5)
            .max_tokens(1_000_000)
            .build(),
    );
    for i in 0..20 {
        conv.add_message(Message::user(format!("message {i}"))).unwrap();
    }
    let history = conv.history(&HistoryQuery::default());
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].content, "message 15");
    assert_eq!(history[4].content, "message 19");
}

#[tokio::test(start_paused = true)]
async fn crossing_the_threshold_summarizes_history() {
    let conv = Conversation::new(
        "s1",
        ConversationConfig::builder()
            .max_tokens(100)
            .summarize_threshold(0.75)
            .build(),
    );
    let mut events = conv.subscribe();

    // 40 characters is 10 tokens; the eighth message reaches 80%.
    for i in 0..7 {
        conv.add_message(Message::user(format!("{i}").repeat(40))).unwrap();
    }
    assert_eq!(conv.message_count(), 7);
    conv.add_message(Message::user("7".repeat(40))).unwrap();

    let history = conv.history(&HistoryQuery::default());
    assert_eq!(history.len(), 5);
    assert!(history[0].is_summary);
    assert_eq!(history[1].content, "4".repeat(40));
    assert_eq!(history[4].content, "7".repeat(40));
    assert_eq!(conv.state(), ConversationState::Active);

    let without_summary = conv.history(&HistoryQuery::builder().include_summaries(false).build());
    assert_eq!(without_summary.len(), 4);

    let summarized: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ConversationEvent::Summarized { before, after, .. } => Some((before, after)),
            _ => None,
        })
        .collect();
    assert_eq!(summarized, vec![(8, 5)]);
}

#[tokio::test(start_paused = true)]
async fn oversized_message_keeps_the_summary_marker() {
    let conv = Conversation::new(
        "s1",
        ConversationConfig::builder()
            .max_tokens(100)
            .summarize_threshold(0.75)
            .build(),
    );

    conv.add_message(Message::user("a".repeat(40))).unwrap();
    conv.add_message(Message::user("b".repeat(340))).unwrap();

    let history = conv.history(&HistoryQuery::default());
    assert_eq!(history.len(), 2);
    assert!(history[0].is_summary);
    assert!(history[0].content.contains("1 earlier"));
    assert_eq!(history[1].content, "b".repeat(340));

    // A later message evicts the oversized one, not the marker.
    conv.add_message(Message::user("c".repeat(40))).unwrap();
    let history = conv.history(&HistoryQuery::default());
    assert!(history[0].is_summary);
    assert_eq!(history.last().unwrap().content, "c".repeat(40));
    assert_eq!(history.iter().filter(|m| m.is_summary).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn single_oversized_message_is_not_summarized() {
    let conv = Conversation::new(
        "s1",
        ConversationConfig::builder()
            .max_tokens(100)
            .summarize_threshold(0.75)
            .build(),
    );
    let mut events = conv.subscribe();

    conv.add_message(Message::user("x".repeat(400))).unwrap();

    let history = conv.history(&HistoryQuery::default());
    assert_eq!(history.len(), 1);
    assert!(!history[0].is_summary);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, ConversationEvent::Summarized { .. })));
}

struct BrokenSummarizer;

impl Summarizer for BrokenSummarizer {
    fn summarize(&self, _messages: &[Message]) -> Result<Vec<Message>> {
        Err(TetherError::InvalidState("summarizer offline".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn summarization_failure_is_reported_not_fatal() {
    let conv = Conversation::with_summarizer(
        "s1",
        ConversationConfig::builder().max_tokens(10).build(),
        Arc::new(BrokenSummarizer),
    );
    let mut events = conv.subscribe();

    conv.add_message(Message::user("a".repeat(20))).unwrap();
    let added = conv.add_message(Message::user("b".repeat(20)));

    assert!(added.is_ok());
    assert_eq!(conv.state(), ConversationState::Active);
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, ConversationEvent::SummarizationFailed { error, .. } if error.contains("summarizer offline"))));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_conversation_cancels_timers() {
    let conv = Conversation::new(
        "s1",
        ConversationConfig::builder()
            .idle_timeout(Duration::from_millis(100))
            .build(),
    );
    let state = conv.watch_state();
    drop(conv);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*state.borrow(), ConversationState::Active);
}
