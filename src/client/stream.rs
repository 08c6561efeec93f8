//! Streaming upstream client.
//!
//! `stream()` returns a lazy, finite sequence of JSON chunks parsed from
//! `data: <json>` lines. Nothing happens until the sequence is first polled;
//! a new call re-issues the request.
//!
//! Retries apply only while the response is being established. Once bytes
//! have been read, a failure ends the sequence with an error so chunks are
//! never delivered twice. The per-attempt timeout bounds connect + headers,
//! then every individual body read.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::http::{
    build_client, join_url, parse_sse_data, status_to_error, stream_headers, transport_error,
};
use super::{endpoint_path, request_body};
use crate::config::{StreamConfig, TetherConfig};
use crate::error::{ErrorKind, Result, TetherError};
use crate::session::SessionRegistry;
use crate::types::reply::conversation_id_of;
use crate::types::Message;
use crate::util::timeout::with_timeout;

const EVENT_CAPACITY: usize = 256;

/// Receives every chunk streamed for a session.
///
/// Errors and panics are caught, logged and reported as
/// [`StreamEvent::ListenerFailed`]; they never interrupt the stream or other
/// listeners.
pub trait StreamListener: Send + Sync {
    fn on_chunk(&self, session_id: &str, chunk: &Value) -> Result<()>;
}

impl<F> StreamListener for F
where
    F: Fn(&str, &Value) -> Result<()> + Send + Sync,
{
    fn on_chunk(&self, session_id: &str, chunk: &Value) -> Result<()> {
        self(session_id, chunk)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default, Builder)]
pub struct StreamOptions {
    /// Caller-owned cancellation. Cancelling it aborts the in-flight attempt.
    pub cancel: Option<CancellationToken>,
}

/// Lifecycle notifications from the streaming client.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Started {
        session_id: String,
        url: String,
    },
    Retry {
        session_id: String,
        /// 1-based retry number.
        attempt: u32,
        delay: Duration,
        kind: ErrorKind,
        error: String,
    },
    Bound {
        session_id: String,
        conversation_id: String,
    },
    Completed {
        session_id: String,
        chunks: usize,
    },
    Aborted {
        session_id: String,
    },
    Failed {
        session_id: String,
        kind: ErrorKind,
        message: String,
    },
    ListenerFailed {
        session_id: String,
        listener_id: String,
        error: String,
    },
}

type ListenerList = Vec<(String, Arc<dyn StreamListener>)>;

struct ActiveStream {
    session_id: String,
    token: CancellationToken,
}

struct StreamInner {
    registry: Arc<SessionRegistry>,
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    config: StreamConfig,
    next_stream_id: AtomicU64,
    active: Mutex<HashMap<u64, ActiveStream>>,
    listeners: RwLock<HashMap<String, ListenerList>>,
    events: broadcast::Sender<StreamEvent>,
}

/// Streaming upstream client. Cheap to clone.
#[derive(Clone)]
pub struct StreamingClient {
    inner: Arc<StreamInner>,
}

/// Removes an in-flight stream from the active table when the sequence
/// finishes or is dropped by its consumer.
#[must_use = "the entry is removed as soon as the guard drops"]
pub struct ActiveGuard {
    inner: Arc<StreamInner>,
    stream_id: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner.active.lock().remove(&self.stream_id);
    }
}

impl StreamingClient {
    pub fn new(
        registry: Arc<SessionRegistry>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        config: StreamConfig,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(StreamInner {
                registry,
                http: build_client()?,
                base_url: base_url.into(),
                api_key,
                config,
                next_stream_id: AtomicU64::new(1),
                active: Mutex::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                events,
            }),
        })
    }

    pub fn from_config(config: &TetherConfig, registry: Arc<SessionRegistry>) -> Result<Self> {
        Self::new(
            registry,
            config.base_url.clone(),
            config.api_key.clone(),
            config.stream.clone(),
        )
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.events.subscribe()
    }

    /// Stream the reply to `message` for a session.
    ///
    /// The sequence yields each parsed chunk in arrival order and ends when
    /// the upstream closes. It ends with a single `Err` on failure:
    /// [`TetherError::SessionNotFound`], [`TetherError::Aborted`] on
    /// cancellation, or the upstream error once retries are exhausted.
    pub fn stream(
        &self,
        session_id: &str,
        message: Message,
        options: StreamOptions,
    ) -> BoxStream<'static, Result<Value>> {
        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();

        let stream = async_stream::stream! {
            let token = match options.cancel {
                Some(parent) => parent.child_token(),
                None => CancellationToken::new(),
            };
            let _guard = inner.register(&session_id, token.clone());

            let Some(session) = inner.registry.get(&session_id) else {
                let err = TetherError::SessionNotFound(session_id.clone());
                inner.emit_failure(&session_id, &err);
                yield Err(err);
                return;
            };

            let url = join_url(&inner.base_url, &endpoint_path(&session));
            let body = request_body(&session, &message, true);
            let timeout = inner.config.request_timeout;
            debug!(session_id = %session_id, url = %url, "Opening upstream stream");
            inner.emit(StreamEvent::Started {
                session_id: session_id.clone(),
                url: url.clone(),
            });

            let connect = inner.config.retry.execute_with_notify(
                || with_timeout(timeout, inner.connect(&url, &body)),
                |retry| {
                    inner.emit(StreamEvent::Retry {
                        session_id: session_id.clone(),
                        attempt: retry.attempt,
                        delay: retry.delay,
                        kind: retry.error.kind(),
                        error: retry.error.to_string(),
                    })
                },
            );
            let connected = tokio::select! {
                biased;
                _ = token.cancelled() => Err(TetherError::Aborted),
                result = connect => result,
            };
            let response = match connected {
                Ok(response) => response,
                Err(e) => {
                    inner.emit_failure(&session_id, &e);
                    yield Err(e);
                    return;
                }
            };

            let bytes = response.bytes_stream();
            futures::pin_mut!(bytes);
            let mut buffer: Vec<u8> = Vec::new();
            let mut bound = session.conversation_id.is_some();
            let mut chunks = 0usize;
            let mut finished = false;

            while !finished {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(TetherError::Aborted),
                    read = tokio::time::timeout(timeout, bytes.next()) => read.map_err(|_| {
                        TetherError::transient_code(
                            "ETIMEDOUT",
                            format!("no data for {}ms", timeout.as_millis()),
                        )
                    }),
                };
                match next {
                    Ok(Some(Ok(piece))) => buffer.extend_from_slice(&piece),
                    Ok(Some(Err(e))) => {
                        let err = transport_error(e);
                        inner.emit_failure(&session_id, &err);
                        yield Err(err);
                        return;
                    }
                    Ok(None) => {
                        finished = true;
                        if !buffer.is_empty() {
                            buffer.push(b'\n');
                        }
                    }
                    Err(err) => {
                        inner.emit_failure(&session_id, &err);
                        yield Err(err);
                        return;
                    }
                }

                for data in drain_data_lines(&mut buffer) {
                    let chunk: Value = match serde_json::from_str(&data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            debug!(
                                session_id = %session_id,
                                error = %e,
                                "Skipping unparseable chunk"
                            );
                            continue;
                        }
                    };

                    if !bound {
                        if let Some(conversation_id) = conversation_id_of(&chunk).map(str::to_string) {
                            bound = true;
                            let newly_bound = inner
                                .registry
                                .bind_conversation_once(&session_id, &conversation_id)
                                .await;
                            if newly_bound {
                                inner.emit(StreamEvent::Bound {
                                    session_id: session_id.clone(),
                                    conversation_id,
                                });
                            }
                        }
                    }

                    inner.fan_out(&session_id, &chunk);
                    chunks += 1;
                    yield Ok(chunk);
                }
            }

            debug!(session_id = %session_id, chunks, "Upstream stream finished");
            inner.emit(StreamEvent::Completed {
                session_id: session_id.clone(),
                chunks,
            });
        };

        Box::pin(stream)
    }

    /// Register a caller-owned token under the session so [`cancel`](Self::cancel)
    /// reaches work that has not opened a stream yet. The entry counts toward
    /// [`active_streams`](Self::active_streams) until the guard drops.
    pub fn track(&self, session_id: &str, token: CancellationToken) -> ActiveGuard {
        self.inner.register(session_id, token)
    }

    /// Abort every in-flight stream for a session. Returns whether anything
    /// was cancelled; calling it again is a no-op.
    pub fn cancel(&self, session_id: &str) -> bool {
        let cancelled: Vec<ActiveStream> = {
            let mut active = self.inner.active.lock();
            let ids: Vec<u64> = active
                .iter()
                .filter(|(_, stream)| stream.session_id == session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| active.remove(&id)).collect()
        };
        for stream in &cancelled {
            stream.token.cancel();
        }
        if !cancelled.is_empty() {
            debug!(session_id, count = cancelled.len(), "Streams cancelled");
        }
        !cancelled.is_empty()
    }

    /// In-flight streams for a session.
    pub fn active_streams(&self, session_id: &str) -> usize {
        self.inner
            .active
            .lock()
            .values()
            .filter(|stream| stream.session_id == session_id)
            .count()
    }

    /// Register a chunk listener. The session counts the listener as a live
    /// consumer and is not evicted while it is registered.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::SessionNotFound`] if the session is absent.
    pub fn add_listener(
        &self,
        session_id: &str,
        listener: Arc<dyn StreamListener>,
    ) -> Result<String> {
        let listener_id = format!("listener_{}", Uuid::new_v4().simple());
        if !self.inner.registry.add_listener(session_id, &listener_id) {
            return Err(TetherError::SessionNotFound(session_id.to_string()));
        }
        self.inner
            .listeners
            .write()
            .entry(session_id.to_string())
            .or_default()
            .push((listener_id.clone(), listener));
        Ok(listener_id)
    }

    pub fn remove_listener(&self, session_id: &str, listener_id: &str) -> bool {
        let removed = {
            let mut listeners = self.inner.listeners.write();
            let Some(list) = listeners.get_mut(session_id) else {
                return false;
            };
            let before = list.len();
            list.retain(|(id, _)| id != listener_id);
            let removed = list.len() != before;
            if list.is_empty() {
                listeners.remove(session_id);
            }
            removed
        };
        self.inner.registry.remove_listener(session_id, listener_id);
        removed
    }

    /// Drop every listener registered for a session.
    pub fn clear_listeners(&self, session_id: &str) -> usize {
        let removed = self
            .inner
            .listeners
            .write()
            .remove(session_id)
            .unwrap_or_default();
        for (listener_id, _) in &removed {
            self.inner.registry.remove_listener(session_id, listener_id);
        }
        removed.len()
    }
}

impl StreamInner {
    fn register(self: &Arc<Self>, session_id: &str, token: CancellationToken) -> ActiveGuard {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(
            stream_id,
            ActiveStream {
                session_id: session_id.to_string(),
                token,
            },
        );
        ActiveGuard {
            inner: Arc::clone(self),
            stream_id,
        }
    }

    async fn connect(&self, url: &str, body: &Value) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(url)
            .headers(stream_headers(self.api_key.as_deref()))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &text));
        }
        Ok(resp)
    }

    fn fan_out(&self, session_id: &str, chunk: &Value) {
        let listeners = self
            .listeners
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default();

        for (listener_id, listener) in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_chunk(session_id, chunk)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "listener panicked".to_string(),
            };
            warn!(session_id, listener_id = %listener_id, error = %error, "Stream listener failed");
            self.emit(StreamEvent::ListenerFailed {
                session_id: session_id.to_string(),
                listener_id,
                error,
            });
        }
    }

    fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    fn emit_failure(&self, session_id: &str, err: &TetherError) {
        if err.is_aborted() {
            debug!(session_id, "Stream aborted");
            self.emit(StreamEvent::Aborted {
                session_id: session_id.to_string(),
            });
        } else {
            warn!(session_id, error = %err, "Stream failed");
            self.emit(StreamEvent::Failed {
                session_id: session_id.to_string(),
                kind: err.kind(),
                message: err.to_string(),
            });
        }
    }
}

/// Take every complete line out of `buffer` and return the `data:` payloads.
/// A trailing partial line stays buffered.
fn drain_data_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        if let Some(data) = parse_sse_data(line.trim()) {
            out.push(data.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_lines_and_keeps_partial_tail() {
        let mut buffer = b"data: {\"a\":1}\n: ping\nevent: x\r\ndata: {\"b\"".to_vec();
        assert_eq!(drain_data_lines(&mut buffer), vec!["{\"a\":1}".to_string()]);
        assert_eq!(buffer, b"data: {\"b\"".to_vec());

        buffer.extend_from_slice(b":2}\r\n\ndata: [DONE]\n");
        assert_eq!(drain_data_lines(&mut buffer), vec!["{\"b\":2}".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn multibyte_text_split_across_reads_is_preserved() {
        let line = "data: {\"content\":\"héllo\"}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut buffer = line[..split].to_vec();
        assert!(drain_data_lines(&mut buffer).is_empty());
        buffer.extend_from_slice(&line[split..]);
        assert_eq!(
            drain_data_lines(&mut buffer),
            vec!["{\"content\":\"héllo\"}".to_string()]
        );
    }
}
