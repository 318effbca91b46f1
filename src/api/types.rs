//! REST request and response types

use crate::state_machine::{GenerationOptions, MessageStatus, Role};
use crate::stream::ProcessStep;
use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Identifiers
// ============================================================================

/// Server-issued identifier.
///
/// The backend hands out numeric ids, but nothing on the client depends on
/// that; the value is kept in whatever form it arrived and echoed back
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteId::Number(n) => write!(f, "{n}"),
            RemoteId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RemoteId {
    fn from(n: i64) -> Self {
        RemoteId::Number(n)
    }
}

impl FromStr for RemoteId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(s.parse::<i64>()
            .map_or_else(|_| RemoteId::Text(s.to_string()), RemoteId::Number))
    }
}

pub type SessionId = RemoteId;
pub type MessageId = RemoteId;
pub type ModelId = RemoteId;
pub type KbId = RemoteId;

// ============================================================================
// Response envelope
// ============================================================================

/// Every REST response is wrapped as `{code, message, data}`
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
}

pub(crate) const SUCCESS_CODE: i64 = 200;

// ============================================================================
// Model catalog
// ============================================================================

/// Thinking capability declared by a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingCapability {
    #[serde(default)]
    pub default: bool,
    #[serde(default = "default_true")]
    pub editable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub thinking: Option<ThinkingCapability>,
    /// Absent means the model can be combined with a knowledge base
    #[serde(default)]
    pub kb: Option<bool>,
}

/// Entry of `GET /models/available`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub model_id: ModelId,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub metadata: Option<ModelMetadata>,
}

impl ModelInfo {
    pub fn tools(&self) -> &[String] {
        self.metadata.as_ref().map_or(&[][..], |m| m.tools.as_slice())
    }

    pub fn offers_tool(&self, tool: &str) -> bool {
        self.tools().iter().any(|t| t == tool)
    }

    pub fn thinking(&self) -> Option<ThinkingCapability> {
        self.metadata.as_ref().and_then(|m| m.thinking)
    }

    pub fn supports_kb(&self) -> bool {
        self.metadata.as_ref().and_then(|m| m.kb).unwrap_or(true)
    }

    pub fn display_name(&self) -> String {
        self.model_name
            .clone()
            .unwrap_or_else(|| self.model_id.to_string())
    }
}

// ============================================================================
// Knowledge bases
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: KbId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Grouped catalog of `GET /kb`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KbCatalog {
    #[serde(default)]
    pub private: Vec<KnowledgeBase>,
    #[serde(default)]
    pub shared: Vec<KnowledgeBase>,
    #[serde(default)]
    pub public: Vec<KnowledgeBase>,
    #[serde(default)]
    pub invited: Vec<KnowledgeBase>,
}

impl KbCatalog {
    pub fn iter(&self) -> impl Iterator<Item = &KnowledgeBase> {
        self.private
            .iter()
            .chain(&self.shared)
            .chain(&self.public)
            .chain(&self.invited)
    }

    pub fn find(&self, id: &KbId) -> Option<&KnowledgeBase> {
        self.iter().find(|kb| &kb.id == id)
    }
}

// ============================================================================
// Message history
// ============================================================================

/// Message as returned by `GET /chat/sessions/{id}/messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    #[serde(default)]
    pub id: Option<MessageId>,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub model_id: Option<ModelId>,
    #[serde(default)]
    pub kb_id: Option<KbId>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    /// Either a JSON object or a string holding one
    #[serde(default)]
    pub options: Option<Value>,
    /// Either a JSON array or a string holding one
    #[serde(default)]
    pub rag_context: Option<Value>,
    #[serde(default)]
    pub thinking: Option<String>,
}

impl PersistedMessage {
    pub fn status(&self) -> MessageStatus {
        MessageStatus::from_wire(self.status.as_deref())
    }

    pub fn is_pending_user(&self) -> bool {
        self.role == Role::User && self.status() == MessageStatus::Pending
    }

    pub fn parsed_options(&self) -> Option<GenerationOptions> {
        parse_embedded(self.options.as_ref(), "options")
    }

    /// Step records are only kept for assistant messages
    pub fn parsed_rag_process(&self) -> Option<Vec<ProcessStep>> {
        if self.role != Role::Assistant {
            return None;
        }
        parse_embedded(self.rag_context.as_ref(), "ragContext")
    }
}

/// Decode a column that may arrive as structured JSON or as a JSON string.
/// Unparseable values are logged and dropped.
fn parse_embedded<T: DeserializeOwned>(value: Option<&Value>, field: &str) -> Option<T> {
    let result = match value? {
        Value::Null => return None,
        Value::String(s) if s.trim().is_empty() => return None,
        Value::String(s) => serde_json::from_str(s),
        other => serde_json::from_value(other.clone()),
    };
    match result {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!(field, error = %e, "Failed to parse persisted field");
            None
        }
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Body of `POST /chat/start`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChatRequest {
    pub model_id: Option<ModelId>,
    pub question: String,
    pub kb_id: Option<KbId>,
    pub options: GenerationOptions,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChatResponse {
    pub session_id: SessionId,
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Cursor query for `POST /sessions/list`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListQuery {
    pub last_active_at: Option<NaiveDateTime>,
    pub last_id: Option<SessionId>,
    pub page_size: u32,
}

impl Default for SessionListQuery {
    fn default() -> Self {
        Self {
            last_active_at: None,
            last_id: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SessionListQuery {
    /// Query for the page following `cursor`
    pub fn after(cursor: &SessionCursor) -> Self {
        Self {
            last_active_at: cursor.last_active_at,
            last_id: cursor.last_id.clone(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCursor {
    #[serde(default)]
    pub last_active_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_id: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionGroupKind {
    Today,
    Yesterday,
    Earlier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionItem {
    pub id: SessionId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub last_active_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionGroup {
    pub group: SessionGroupKind,
    #[serde(default)]
    pub items: Vec<SessionItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionList {
    #[serde(default)]
    pub groups: Vec<SessionGroup>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<SessionCursor>,
}

/// Body of `POST /sessions/search`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSearchQuery {
    pub keyword: String,
    pub limit: u32,
    pub offset: u32,
}

impl SessionSearchQuery {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSnippet {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSearchHit {
    pub session_id: SessionId,
    #[serde(default)]
    pub session_title: Option<String>,
    #[serde(default)]
    pub content_list: Vec<SearchSnippet>,
}
