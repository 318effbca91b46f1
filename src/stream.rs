//! Stream event interpreter
//!
//! Turns raw SSE frames into typed [`StreamEvent`]s. The interpreter is
//! stateless; ordering is the transport's responsibility.

use crate::api::MessageId;
use crate::transport::SseFrame;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_TITLE: &str = "New conversation";

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Answer text fragment
    Content { text: String },
    /// Reasoning text fragment
    Thinking { text: String },
    /// Retrieval pipeline step record
    Process(ProcessStep),
    /// Turn persisted; carries the server ids of both messages
    Done {
        user_message_id: Option<MessageId>,
        assistant_message_id: Option<MessageId>,
    },
    Usage(UsageStats),
}

/// Retrieval pipeline step. Identity is the `(step, status)` pair; any other
/// fields are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStep {
    pub step: String,
    pub status: String,
    #[serde(flatten)]
    pub detail: Map<String, Value>,
}

impl ProcessStep {
    pub fn new(step: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            status: status.into(),
            detail: Map::new(),
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.step, &self.status)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("malformed stream payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Content {
        #[serde(default)]
        content: String,
    },
    Thinking {
        #[serde(default)]
        content: String,
    },
    Process {
        payload: ProcessStep,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        #[serde(default)]
        user_message_id: Option<MessageId>,
        #[serde(default)]
        assistant_message_id: Option<MessageId>,
    },
    Usage {
        #[serde(default)]
        payload: Option<UsageStats>,
    },
    #[serde(other)]
    Unknown,
}

/// Decode one chat stream frame. Empty frames and unrecognised types
/// yield `Ok(None)`.
pub fn interpret(frame: &SseFrame) -> Result<Option<StreamEvent>, InterpretError> {
    if frame.data.trim().is_empty() {
        return Ok(None);
    }

    let event = match serde_json::from_str::<WireEvent>(&frame.data)? {
        WireEvent::Content { content } => StreamEvent::Content { text: content },
        WireEvent::Thinking { content } => StreamEvent::Thinking { text: content },
        WireEvent::Process { payload } => StreamEvent::Process(payload),
        WireEvent::Done {
            user_message_id,
            assistant_message_id,
        } => StreamEvent::Done {
            user_message_id,
            assistant_message_id,
        },
        WireEvent::Usage { payload } => StreamEvent::Usage(payload.unwrap_or_default()),
        WireEvent::Unknown => {
            tracing::debug!(data = %frame.data, "Ignoring unknown stream event type");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

#[derive(Deserialize)]
struct TitlePayload {
    #[serde(default)]
    title: Option<String>,
}

/// Decode a title stream frame, falling back to [`DEFAULT_TITLE`]
pub fn parse_title(frame: &SseFrame) -> Result<String, InterpretError> {
    let payload: TitlePayload = serde_json::from_str(&frame.data)?;
    Ok(payload
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string()))
}
