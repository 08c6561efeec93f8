//! Message router: per-session FIFO admission with a concurrency cap and
//! fixed-window rate limiting.
//!
//! Every session gets its own queue and active counter. Entries are admitted
//! strictly in FIFO order while the active count is below the configured
//! maximum; an admitted entry holds a [`SlotPermit`] and dropping the permit
//! frees the slot and admits the next entry. Sessions never wait on each
//! other.

pub mod rate_limit;

pub use rate_limit::{RateLimitState, RateLimiter};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::config::RouterConfig;
use crate::error::{ErrorKind, Result, TetherError};
use crate::session::{Session, SessionRegistry};
use crate::types::{AgentReply, Message};

const EVENT_CAPACITY: usize = 256;

/// Strategy invoked for every admitted message.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, session: &Session, message: &Message) -> Result<AgentReply>;
}

/// Observability notifications emitted by the router.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    Queued {
        session_id: String,
        message_id: String,
        position: usize,
    },
    Processing {
        session_id: String,
        message_id: String,
        waited: Duration,
    },
    Complete {
        session_id: String,
        message_id: String,
        elapsed: Duration,
    },
    Error {
        session_id: String,
        message_id: String,
        kind: ErrorKind,
        message: String,
    },
}

/// Snapshot returned by [`MessageRouter::queue_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub session_id: String,
    pub queued: usize,
    pub active: usize,
    pub rate_limit: RateLimitState,
    pub max_concurrent: usize,
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
}

/// A pending admission, owned by the router until it is dequeued.
struct QueueEntry {
    message_id: String,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<SlotPermit>>,
}

#[derive(Default)]
struct SessionQueue {
    pending: VecDeque<QueueEntry>,
    active: usize,
}

struct RouterInner {
    config: RouterConfig,
    registry: Arc<SessionRegistry>,
    processor: Arc<dyn MessageProcessor>,
    limiter: RateLimiter,
    queues: Mutex<HashMap<String, SessionQueue>>,
    events: broadcast::Sender<RouterEvent>,
}

/// Per-session message router. Cheap to clone.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

/// An occupied concurrency slot. Dropping it frees the slot.
pub struct SlotPermit {
    router: Arc<RouterInner>,
    session_id: String,
    waited: Duration,
}

impl SlotPermit {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Time spent queued before admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit")
            .field("session_id", &self.session_id)
            .field("waited", &self.waited)
            .finish()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.router.release(&self.session_id);
    }
}

impl MessageRouter {
    pub fn new(
        config: RouterConfig,
        registry: Arc<SessionRegistry>,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let limiter = RateLimiter::new(config.rate_limit_max, config.rate_limit_window);
        Self {
            inner: Arc::new(RouterInner {
                config,
                registry,
                processor,
                limiter,
                queues: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a message and run it through the processor once admitted.
    ///
    /// # Errors
    ///
    /// - [`TetherError::RateLimitExceeded`] when the session's window is full
    ///   at dequeue time; no slot is consumed and nothing is retried.
    /// - [`TetherError::SessionNotFound`] when the session is gone at dispatch.
    /// - Whatever the processor returns.
    pub async fn queue_message(
        &self,
        session_id: &str,
        mut message: Message,
    ) -> Result<AgentReply> {
        message.ensure_id();
        let message_id = message.id.clone();

        let permit = match self.admit(session_id, &message_id).await {
            Ok(permit) => permit,
            Err(e) => {
                self.inner.emit_error(session_id, &message_id, &e);
                return Err(e);
            }
        };

        let Some(session) = self.inner.registry.get(session_id) else {
            let err = TetherError::SessionNotFound(session_id.to_string());
            self.inner.emit_error(session_id, &message_id, &err);
            return Err(err);
        };

        self.inner.emit(RouterEvent::Processing {
            session_id: session_id.to_string(),
            message_id: message_id.clone(),
            waited: permit.waited(),
        });
        let started = Instant::now();
        let result = self.inner.processor.process(&session, &message).await;
        match &result {
            Ok(_) => self.inner.emit(RouterEvent::Complete {
                session_id: session_id.to_string(),
                message_id: message_id.clone(),
                elapsed: started.elapsed(),
            }),
            Err(e) => self.inner.emit_error(session_id, &message_id, e),
        }
        drop(permit);
        result
    }

    /// Wait in the session's FIFO queue for a concurrency slot.
    ///
    /// The rate limit is applied when the entry reaches the head of the
    /// queue. Dropping the returned future gives up the place in line.
    pub async fn admit(&self, session_id: &str, label: &str) -> Result<SlotPermit> {
        let (tx, rx) = oneshot::channel();
        let position = {
            let mut queues = self.inner.queues.lock();
            let queue = queues.entry(session_id.to_string()).or_default();
            queue.pending.push_back(QueueEntry {
                message_id: label.to_string(),
                enqueued_at: Instant::now(),
                tx,
            });
            queue.pending.len()
        };
        self.inner.emit(RouterEvent::Queued {
            session_id: session_id.to_string(),
            message_id: label.to_string(),
            position,
        });

        self.inner.pump(session_id);

        rx.await.map_err(|_| {
            TetherError::InvalidState(format!("queued entry for session {session_id} was dropped"))
        })?
    }

    /// Queued/active counts and rate-limit state. Pure read.
    pub fn queue_status(&self, session_id: &str) -> QueueStatus {
        let (queued, active) = self
            .inner
            .queues
            .lock()
            .get(session_id)
            .map(|q| (q.pending.len(), q.active))
            .unwrap_or((0, 0));
        QueueStatus {
            session_id: session_id.to_string(),
            queued,
            active,
            rate_limit: self.inner.limiter.state(session_id),
            max_concurrent: self.inner.config.max_concurrent,
            rate_limit_max: self.inner.config.rate_limit_max,
            rate_limit_window_ms: self.inner.config.rate_limit_window.as_millis() as u64,
        }
    }

    /// Fail every queued (not yet admitted) entry for a session.
    pub fn cancel_pending(&self, session_id: &str) -> usize {
        let drained: Vec<QueueEntry> = {
            let mut queues = self.inner.queues.lock();
            match queues.get_mut(session_id) {
                Some(queue) => queue.pending.drain(..).collect(),
                None => Vec::new(),
            }
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(TetherError::Aborted));
        }
        self.inner.pump(session_id);
        count
    }

    /// Drop the session's pending entries and rate-limit window.
    pub fn forget(&self, session_id: &str) -> usize {
        let cancelled = self.cancel_pending(session_id);
        self.inner.limiter.reset(session_id);
        cancelled
    }
}

impl RouterInner {
    /// Admit queued entries while slots are free.
    fn pump(self: &Arc<Self>, session_id: &str) {
        let mut ready = Vec::new();
        let (active, queued) = {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get_mut(session_id) else {
                return;
            };
            while queue.active < self.config.max_concurrent {
                let Some(entry) = queue.pending.pop_front() else {
                    break;
                };
                if entry.tx.is_closed() {
                    continue;
                }
                match self.limiter.try_acquire(session_id) {
                    Ok(()) => {
                        queue.active += 1;
                        ready.push(entry);
                    }
                    Err(e) => {
                        debug!(session_id, message_id = %entry.message_id, "Rate limit exceeded");
                        let _ = entry.tx.send(Err(e));
                    }
                }
            }
            let counts = (queue.active, queue.pending.len());
            if queue.active == 0 && queue.pending.is_empty() {
                queues.remove(session_id);
                let pruned = self.limiter.prune();
                if pruned > 0 {
                    debug!(session_id, pruned, "Pruned expired rate-limit windows");
                }
            }
            counts
        };

        self.registry.record_load(session_id, active, queued);

        for entry in ready {
            let waited = entry.enqueued_at.elapsed();
            debug!(
                session_id,
                message_id = %entry.message_id,
                waited_ms = waited.as_millis() as u64,
                "Admitted"
            );
            let permit = SlotPermit {
                router: Arc::clone(self),
                session_id: session_id.to_string(),
                waited,
            };
            // A caller that gave up drops the permit here, which frees the slot.
            let _ = entry.tx.send(Ok(permit));
        }
    }

    fn release(self: &Arc<Self>, session_id: &str) {
        {
            let mut queues = self.queues.lock();
            if let Some(queue) = queues.get_mut(session_id) {
                queue.active = queue.active.saturating_sub(1);
            }
        }
        self.pump(session_id);
    }

    fn emit(&self, event: RouterEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, session_id: &str, message_id: &str, err: &TetherError) {
        self.emit(RouterEvent::Error {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}
