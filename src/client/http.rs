//! Shared HTTP client construction, SSE parsing, and error classification.

use std::error::Error as _;
use std::io::ErrorKind as IoErrorKind;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};

use crate::error::{Result, TetherError};

/// HTTP statuses that are retried with backoff.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Transport error codes that are retried with backoff.
pub const RETRYABLE_CODES: [&str; 8] = [
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "EPIPE",
    "ENOTFOUND",
    "ENETUNREACH",
    "EAI_AGAIN",
    "ECONNABORTED",
];

/// Build the HTTP client used for upstream calls.
///
/// No global timeout: callers bound each attempt themselves.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .build()
        .map_err(|e| TetherError::Configuration(format!("failed to build HTTP client: {e}")))
}

/// JSON request headers with an optional bearer token.
pub fn bearer_headers(api_key: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(key) = api_key {
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {key}")) {
            headers.insert(AUTHORIZATION, val);
        }
    }
    headers
}

/// Headers for an event-stream request.
pub fn stream_headers(api_key: Option<&str>) -> HeaderMap {
    let mut headers = bearer_headers(api_key);
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    headers
}

/// Parse an SSE `data: ` line, returning None for other lines and `[DONE]`.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data)
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Classify a non-success HTTP status.
pub fn status_to_error(status: u16, body: &str) -> TetherError {
    let message = error_message(body, status);
    if is_retryable_status(status) {
        TetherError::transient_status(status, message)
    } else {
        TetherError::fatal_status(status, message)
    }
}

/// Classify a transport failure from reqwest.
pub fn transport_error(err: reqwest::Error) -> TetherError {
    if err.is_builder() {
        return TetherError::Configuration(err.to_string());
    }
    match transport_code(&err) {
        Some(code) if RETRYABLE_CODES.contains(&code) => {
            TetherError::transient_code(code, err.to_string())
        }
        _ => TetherError::UpstreamFatal {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        },
    }
}

/// Map a reqwest error onto the retryable transport code allow-list.
pub fn transport_code(err: &reqwest::Error) -> Option<&'static str> {
    if err.is_timeout() {
        return Some("ETIMEDOUT");
    }

    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            let code = match io.kind() {
                IoErrorKind::ConnectionReset => Some("ECONNRESET"),
                IoErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
                IoErrorKind::ConnectionAborted => Some("ECONNABORTED"),
                IoErrorKind::BrokenPipe => Some("EPIPE"),
                IoErrorKind::TimedOut => Some("ETIMEDOUT"),
                IoErrorKind::UnexpectedEof => Some("ECONNRESET"),
                _ => None,
            };
            if code.is_some() {
                return code;
            }
        }
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return Some(if text.contains("temporary") {
                "EAI_AGAIN"
            } else {
                "ENOTFOUND"
            });
        }
        if text.contains("network is unreachable") {
            return Some("ENETUNREACH");
        }
        source = inner.source();
    }

    if err.is_connect() {
        return Some("ECONNREFUSED");
    }
    if err.is_body() {
        return Some("ECONNRESET");
    }
    None
}

/// Join a base URL and a path with exactly one slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn error_message(body: &str, status: u16) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok().and_then(|v| {
        v.get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .or_else(|| v.get("message"))
            .and_then(|m| m.as_str().map(str::to_string))
    });
    match parsed {
        Some(message) => message,
        None if body.trim().is_empty() => format!("HTTP {status}"),
        None => body.chars().take(500).collect(),
    }
}
