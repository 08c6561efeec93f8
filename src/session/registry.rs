//! Session registry: identity, TTL eviction, and durable snapshots.
//!
//! The registry is responsible for:
//! - Creating sessions (optionally validated upstream) and persisting them
//! - Lookups that refresh the activity stamp
//! - Tracking listeners, which exempt a session from eviction
//! - Periodic sweeping of idle sessions from memory and the store
//! - Restoring persisted sessions on startup and flushing them on shutdown

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::SessionStore;
use super::validator::{SessionValidator, ValidationResult};
use super::{FileRef, Session, SessionOptions, SessionPatch};
use crate::config::SessionSettings;
use crate::error::{Result, TetherError};

/// Result of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions evicted from memory (and their records).
    pub evicted: usize,
    /// Additional records removed by the store's own TTL pass.
    pub store_evicted: usize,
}

/// Result of restoring persisted sessions on startup.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: usize,
    /// Records found already past their TTL and deleted.
    pub expired: usize,
    /// Unreadable records (session id, error message).
    pub errors: Vec<(String, String)>,
}

/// Registry of live sessions. Share it behind an `Arc`.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    store: Arc<dyn SessionStore>,
    validator: Option<Arc<dyn SessionValidator>>,
    settings: SessionSettings,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(settings: SessionSettings, store: Arc<dyn SessionStore>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            validator: None,
            settings,
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn SessionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Create and persist a new session.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Validation`] if either id is empty, or if a
    /// validator is configured, `options.validate` is set, and the workspace
    /// or agent does not exist.
    pub async fn create(
        &self,
        workspace_id: &str,
        agent_id: &str,
        options: SessionOptions,
    ) -> Result<Session> {
        let workspace_id = workspace_id.trim();
        let agent_id = agent_id.trim();
        if workspace_id.is_empty() {
            return Err(TetherError::Validation("workspace id is required".into()));
        }
        if agent_id.is_empty() {
            return Err(TetherError::Validation("agent id is required".into()));
        }

        if options.validate {
            if let Some(validator) = &self.validator {
                let workspace = validator.workspace_exists(workspace_id).await;
                ensure_exists(&workspace, "workspace", workspace_id)?;
                let agent = validator.agent_exists(workspace_id, agent_id).await;
                ensure_exists(&agent, "agent", agent_id)?;
            }
        }

        let session = Session::new(workspace_id.to_string(), agent_id.to_string(), options);
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        self.persist(&session).await;

        info!(
            session_id = %session.id,
            workspace_id = %session.workspace_id,
            agent_id = %session.agent_id,
            "Session created"
        );
        Ok(session)
    }

    /// Look up a session, refreshing its activity stamp.
    pub fn get(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id)?;
        session.touch(Utc::now());
        Some(session.clone())
    }

    /// Look up a session without touching it.
    pub fn peek(&self, id: &str) -> Option<Session> {
        self.sessions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Merge `patch` into a session and persist it. Returns false if absent.
    pub async fn update(&self, id: &str, patch: SessionPatch) -> bool {
        let snapshot = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(id) else {
                return false;
            };
            let now = Utc::now();
            session.apply(patch);
            session.updated_at = now;
            session.touch(now);
            session.clone()
        };
        self.persist(&snapshot).await;
        true
    }

    /// Bind an upstream conversation id only if none is bound yet.
    ///
    /// Returns true when this call performed the binding.
    pub async fn bind_conversation_once(&self, id: &str, conversation_id: &str) -> bool {
        let snapshot = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(id) else {
                return false;
            };
            if session.conversation_id.is_some() {
                return false;
            }
            let now = Utc::now();
            session.conversation_id = Some(conversation_id.to_string());
            session.updated_at = now;
            session.touch(now);
            session.clone()
        };
        debug!(session_id = %id, conversation_id, "Conversation bound");
        self.persist(&snapshot).await;
        true
    }

    pub async fn attach_file(&self, id: &str, file: FileRef) -> bool {
        let Some(mut files) = self.peek(id).map(|s| s.files) else {
            return false;
        };
        files.retain(|f| f.id != file.id);
        files.push(file);
        self.update(
            id,
            SessionPatch {
                files: Some(files),
                ..Default::default()
            },
        )
        .await
    }

    /// Remove a session from memory and storage.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id);
        let Some(mut session) = removed else {
            return false;
        };
        session.listeners.clear();
        if let Err(e) = self.store.delete(id).await {
            warn!(session_id = %id, error = %e, "Failed to delete session record");
        }
        info!(session_id = %id, "Session deleted");
        true
    }

    pub fn add_listener(&self, id: &str, listener_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        session.listeners.insert(listener_id.to_string());
        session.touch(Utc::now());
        true
    }

    pub fn remove_listener(&self, id: &str, listener_id: &str) -> bool {
        self.sessions
            .write()
            .get_mut(id)
            .map(|s| s.listeners.remove(listener_id))
            .unwrap_or(false)
    }

    /// Record live request counts reported by the router. Memory only.
    pub fn record_load(&self, id: &str, active: usize, queued: usize) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.active_requests = active;
            session.queued_requests = queued;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Evict idle sessions as of now.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Evict sessions with no listeners idle past the TTL as of `now`, then
    /// let the store run its own TTL pass over non-resident records.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let ttl = self.settings.ttl;
        let (expired, resident) = {
            let mut sessions = self.sessions.write();
            let expired: Vec<String> = sessions
                .values()
                .filter(|s| s.is_expired(ttl, now))
                .map(|s| s.id.clone())
                .collect();
            for id in &expired {
                sessions.remove(id);
            }
            let resident: HashSet<String> = sessions.keys().cloned().collect();
            (expired, resident)
        };

        for id in &expired {
            if let Err(e) = self.store.delete(id).await {
                warn!(session_id = %id, error = %e, "Failed to delete expired session record");
            }
        }

        let store_evicted = match self.store.sweep_expired(ttl, now, &resident).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Session store sweep failed");
                0
            }
        };

        if !expired.is_empty() || store_evicted > 0 {
            info!(
                evicted = expired.len(),
                store_evicted, "Evicted idle sessions"
            );
        }
        SweepReport {
            evicted: expired.len(),
            store_evicted,
        }
    }

    /// Start sweeping on the configured interval. Replaces a running sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let period = self.settings.sweep_interval;
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.sweep().await;
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Load persisted sessions that are still within their TTL.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let now = Utc::now();
        let mut report = RestoreReport::default();
        for id in self.store.list_ids().await? {
            match self.store.load(&id).await {
                Ok(Some(session)) if session.idle_for(now) > self.settings.ttl => {
                    if let Err(e) = self.store.delete(&id).await {
                        warn!(session_id = %id, error = %e, "Failed to delete expired session record");
                    }
                    report.expired += 1;
                }
                Ok(Some(session)) => {
                    self.sessions
                        .write()
                        .entry(session.id.clone())
                        .or_insert(session);
                    report.restored += 1;
                }
                Ok(None) => {}
                Err(e) => report.errors.push((id, e.to_string())),
            }
        }
        info!(
            restored = report.restored,
            expired = report.expired,
            errors = report.errors.len(),
            "Restored persisted sessions"
        );
        Ok(report)
    }

    /// Stop the sweeper, flush every resident session, and clear the registry.
    ///
    /// Persistence failures are logged, never raised.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        let sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        for session in &sessions {
            self.persist(session).await;
        }
        self.sessions.write().clear();
        debug!(flushed = sessions.len(), "Session registry shut down");
    }

    async fn persist(&self, session: &Session) {
        if let Err(e) = self.store.save(session).await {
            warn!(session_id = %session.id, error = %e, "Failed to persist session");
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

fn ensure_exists(result: &ValidationResult, what: &str, id: &str) -> Result<()> {
    if let Some(error) = &result.error {
        return Err(TetherError::Validation(format!(
            "could not validate {what} {id}: {error}"
        )));
    }
    if !result.exists {
        return Err(TetherError::Validation(format!("{what} {id} does not exist")));
    }
    Ok(())
}
