//! Client configuration from environment variables

use crate::api::{KbId, ModelId, SessionId};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "http://localhost:8080/api";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL every REST and SSE path is appended to
    pub api_base: String,
    pub token: Option<String>,
    /// Applies to REST calls only; streams run until the server ends them
    pub request_timeout: Duration,
    /// Session to open on startup
    pub session_id: Option<SessionId>,
    /// Preferred model when the session does not dictate one
    pub model_id: Option<ModelId>,
    pub kb_id: Option<KbId>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            session_id: None,
            model_id: None,
            kb_id: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; blank values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let request_timeout = match get("RAG_REQUEST_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(e) => {
                    tracing::warn!(
                        value = %raw,
                        error = %e,
                        "Invalid RAG_REQUEST_TIMEOUT_SECS, using default"
                    );
                    Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
                }
            },
            None => Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        };

        Self {
            api_base: get("RAG_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            token: get("RAG_TOKEN"),
            request_timeout,
            session_id: get("RAG_SESSION_ID").and_then(|v| v.parse().ok()),
            model_id: get("RAG_MODEL_ID").and_then(|v| v.parse().ok()),
            kb_id: get("RAG_KB_ID").and_then(|v| v.parse().ok()),
        }
    }
}
