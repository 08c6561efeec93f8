//! Upstream existence checks for workspaces and agents.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::http::{bearer_headers, build_client, join_url, transport_error};
use crate::error::Result;
use crate::util::cache::TtlCache;

const CACHE_CAPACITY: usize = 1024;

/// Outcome of one existence check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// The check completed (independent of the answer).
    pub valid: bool,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn found() -> Self {
        Self {
            valid: true,
            exists: true,
            error: None,
        }
    }

    pub fn missing() -> Self {
        Self {
            valid: true,
            exists: false,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            exists: false,
            error: Some(error.into()),
        }
    }
}

/// Checks that the ids a session is created for exist upstream.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn workspace_exists(&self, workspace_id: &str) -> ValidationResult;
    async fn agent_exists(&self, workspace_id: &str, agent_id: &str) -> ValidationResult;
}

/// Validator backed by the upstream REST API, with a TTL cache per id.
#[derive(Clone)]
pub struct HttpValidator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    cache: TtlCache<String, ValidationResult>,
}

impl HttpValidator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        cache_ttl: Duration,
    ) -> Result<Self> {
        Ok(Self::with_cache(
            build_client()?,
            base_url,
            api_key,
            TtlCache::new(CACHE_CAPACITY, cache_ttl),
        ))
    }

    /// Build with an explicit client and cache (shared or pre-seeded).
    pub fn with_cache(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        cache: TtlCache<String, ValidationResult>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            cache,
        }
    }

    pub fn cache(&self) -> &TtlCache<String, ValidationResult> {
        &self.cache
    }

    async fn check(&self, cache_key: String, path: String) -> ValidationResult {
        if let Some(hit) = self.cache.get(&cache_key) {
            return hit;
        }

        let url = join_url(&self.base_url, &path);
        debug!(url = %url, "Validating upstream resource");
        let result = match self
            .client
            .get(&url)
            .headers(bearer_headers(self.api_key.as_deref()))
            .send()
            .await
        {
            Ok(resp) => match resp.status().as_u16() {
                200..=299 => ValidationResult::found(),
                404 => ValidationResult::missing(),
                status => ValidationResult::failed(format!(
                    "validation request failed with status {status}"
                )),
            },
            Err(e) => ValidationResult::failed(transport_error(e).to_string()),
        };

        if result.error.is_none() {
            self.cache.insert(cache_key, result.clone());
        }
        result
    }
}

#[async_trait]
impl SessionValidator for HttpValidator {
    async fn workspace_exists(&self, workspace_id: &str) -> ValidationResult {
        self.check(
            format!("workspace:{workspace_id}"),
            format!("workspaces/{workspace_id}"),
        )
        .await
    }

    async fn agent_exists(&self, workspace_id: &str, agent_id: &str) -> ValidationResult {
        self.check(
            format!("agent:{workspace_id}:{agent_id}"),
            format!("workspaces/{workspace_id}/agents/{agent_id}"),
        )
        .await
    }
}
