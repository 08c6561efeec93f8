//! Durable session snapshots.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::fs;

use super::Session;
use crate::error::{Result, TetherError};

/// Storage abstraction for persisted session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &Session) -> Result<()>;
    async fn load(&self, id: &str) -> Result<Option<Session>>;
    /// Deleting a missing record is not an error.
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list_ids(&self) -> Result<Vec<String>>;

    /// Delete records idle past `ttl`, skipping ids in `keep`.
    ///
    /// Unreadable records are left alone. Returns how many were removed.
    async fn sweep_expired(
        &self,
        ttl: Duration,
        now: DateTime<Utc>,
        keep: &HashSet<String>,
    ) -> Result<usize> {
        let mut removed = 0;
        for id in self.list_ids().await? {
            if keep.contains(&id) {
                continue;
            }
            let expired = match self.load(&id).await {
                Ok(Some(record)) => record.idle_for(now) > ttl,
                Ok(None) => false,
                Err(e) => {
                    tracing::debug!(session_id = %id, error = %e, "Skipping unreadable session record");
                    false
                }
            };
            if expired {
                self.delete(&id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// One JSON file per session under a root directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", normalize_id(id)))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let path = self.record_path(&session.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(session)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let path = self.record_path(id);
        let raw = match fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let session = serde_json::from_slice(&raw).map_err(|e| {
            TetherError::Persistence(format!("corrupt record {}: {e}", path.display()))
        })?;
        Ok(Some(session))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Non-durable store for embedding without disk access.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        self.records
            .lock()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.records.lock().get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.lock().remove(id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.records.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Map an id onto a safe file name.
fn normalize_id(id: &str) -> String {
    let trimmed = id.trim();
    let mut out = String::with_capacity(trimmed.len());
    for ch in trimmed.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    if out.is_empty() {
        "unnamed".to_string()
    } else {
        out
    }
}
