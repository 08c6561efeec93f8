//! Shared test helpers: a recording processor and registry builders.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tether::config::{RouterConfig, SessionSettings};
use tether::error::{Result, TetherError};
use tether::router::{MessageProcessor, MessageRouter};
use tether::session::{MemorySessionStore, Session, SessionOptions, SessionRegistry};
use tether::types::{AgentReply, Message};

/// Processor that records every call and echoes the message back.
///
/// Messages whose content starts with `fail` are rejected with a fatal
/// upstream error after the optional delay.
pub struct RecordingProcessor {
    calls: Mutex<Vec<(Session, Message)>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingProcessor {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> Vec<(Session, Message)> {
        self.calls.lock().clone()
    }

    pub fn contents(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|(_, message)| message.content.clone())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageProcessor for RecordingProcessor {
    async fn process(&self, session: &Session, message: &Message) -> Result<AgentReply> {
        self.calls.lock().push((session.clone(), message.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if message.content.starts_with("fail") {
            return Err(TetherError::fatal_status(400, "rejected by agent"));
        }
        Ok(AgentReply::text(format!("echo: {}", message.content)))
    }
}

pub fn memory_registry() -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(
        SessionSettings::default(),
        Arc::new(MemorySessionStore::new()),
    ))
}

pub async fn registry_with_session() -> (Arc<SessionRegistry>, Session) {
    let registry = memory_registry();
    let session = registry
        .create("w1", "a1", SessionOptions::default())
        .await
        .unwrap();
    (registry, session)
}

pub fn router_config(max_concurrent: usize, rate_limit_max: u32, window: Duration) -> RouterConfig {
    RouterConfig::builder()
        .max_concurrent(max_concurrent)
        .rate_limit_max(rate_limit_max)
        .rate_limit_window(window)
        .build()
}

pub fn router(
    registry: &Arc<SessionRegistry>,
    processor: Arc<RecordingProcessor>,
    config: RouterConfig,
) -> MessageRouter {
    MessageRouter::new(config, Arc::clone(registry), processor)
}
