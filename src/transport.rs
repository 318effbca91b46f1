//! Streaming transport
//!
//! Opens one long-lived SSE connection per generation and reports its
//! lifecycle as four ordered events: open, message, error, close. Every
//! event is tagged with the [`StreamId`] that produced it so the consumer
//! can drop events from connections it no longer cares about.

mod error;
mod http;
mod sse;

pub use error::{TransportError, TransportErrorKind};
pub use http::HttpTransport;
pub use sse::{SseDecoder, SseFrame};

use crate::api::{MessageId, SessionId};
use crate::state_machine::GenerationParams;
use serde_json::{json, Value};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identifies one transport connection within a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Chat,
    Edit,
    Retry,
    Title,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMethod {
    Get,
    Post,
}

/// A streaming endpoint call
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub method: StreamMethod,
    pub path: String,
    pub body: Option<Value>,
    pub kind: StreamKind,
}

impl StreamRequest {
    /// `POST /chat/stream`. A `None` question asks the server to resume the
    /// session's pending user message.
    pub fn chat(params: &GenerationParams, question: Option<&str>) -> Self {
        Self {
            method: StreamMethod::Post,
            path: "/chat/stream".to_string(),
            body: Some(json!({
                "sessionId": params.session_id,
                "modelId": params.model_id,
                "question": question,
                "kbId": params.kb_id,
                "options": params.options,
            })),
            kind: StreamKind::Chat,
        }
    }

    /// `POST /chat/messages/{id}/edit`
    pub fn edit(message_id: &MessageId, params: &GenerationParams, new_content: &str) -> Self {
        Self {
            method: StreamMethod::Post,
            path: format!("/chat/messages/{message_id}/edit"),
            body: Some(json!({
                "sessionId": params.session_id,
                "modelId": params.model_id,
                "kbId": params.kb_id,
                "newContent": new_content,
                "options": params.options,
            })),
            kind: StreamKind::Edit,
        }
    }

    /// `POST /chat/messages/{id}/retry`
    pub fn retry(message_id: &MessageId, params: &GenerationParams) -> Self {
        Self {
            method: StreamMethod::Post,
            path: format!("/chat/messages/{message_id}/retry"),
            body: Some(json!({
                "sessionId": params.session_id,
                "modelId": params.model_id,
                "kbId": params.kb_id,
                "options": params.options,
            })),
            kind: StreamKind::Retry,
        }
    }

    /// `GET /sessions/{id}/title/await`
    pub fn title(session_id: &SessionId) -> Self {
        Self {
            method: StreamMethod::Get,
            path: format!("/sessions/{session_id}/title/await"),
            body: None,
            kind: StreamKind::Title,
        }
    }
}

/// Response metadata reported on open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: u16,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open(ResponseMeta),
    Message(SseFrame),
    /// Terminal; no `Close` follows
    Error(TransportError),
    Close,
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Error(_) | TransportEvent::Close)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub stream: StreamId,
    pub event: TransportEvent,
}

pub type TransportSink = mpsc::UnboundedSender<TransportMessage>;

/// Owner's grip on an open connection. Dropping it cancels the connection.
#[derive(Debug)]
pub struct StreamHandle {
    stream: StreamId,
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn new(stream: StreamId, cancel: CancellationToken) -> Self {
        Self { stream, cancel }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream
    }

    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(stream_id = %self.stream, "Cancelling stream");
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
