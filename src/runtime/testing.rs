//! Mock implementations for testing
//!
//! These mocks enable runtime testing without real I/O.

use super::traits::*;
use crate::api::{
    ApiError, KbCatalog, ModelInfo, PersistedMessage, RemoteId, SessionId, SessionList,
    SessionListQuery, SessionSearchHit, SessionSearchQuery, StartChatRequest,
};
use crate::transport::{
    SseFrame, StreamHandle, StreamId, StreamRequest, TransportEvent, TransportMessage,
    TransportSink,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock Chat API
// ============================================================================

/// In-memory backend. Starting a chat stores the question as a pending
/// user message, the way the real server does.
#[allow(dead_code)]
pub struct MockChatApi {
    models: Mutex<Vec<ModelInfo>>,
    kbs: Mutex<KbCatalog>,
    histories: Mutex<HashMap<SessionId, Vec<PersistedMessage>>>,
    next_session: Mutex<i64>,
    /// Applied before every history fetch
    history_delay: Option<Duration>,
    /// Record of `start_session` requests
    pub started: Mutex<Vec<StartChatRequest>>,
    /// Record of deleted sessions
    pub deleted: Mutex<Vec<SessionId>>,
}

#[allow(dead_code)]
impl MockChatApi {
    pub fn new() -> Self {
        Self {
            models: Mutex::new(Vec::new()),
            kbs: Mutex::new(KbCatalog::default()),
            histories: Mutex::new(HashMap::new()),
            next_session: Mutex::new(100),
            history_delay: None,
            started: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// A model offering web search and default-on, editable thinking
    pub fn with_default_model(self) -> Self {
        let model = serde_json::from_value(json!({
            "modelId": 1,
            "modelName": "mock",
            "provider": "mock",
            "metadata": {
                "tools": ["webSearch"],
                "thinking": {"default": true, "editable": true}
            }
        }))
        .unwrap();
        self.models.lock().unwrap().push(model);
        self
    }

    pub fn with_kb(self, id: i64, name: &str) -> Self {
        let kb = serde_json::from_value(json!({"id": id, "name": name})).unwrap();
        self.kbs.lock().unwrap().private.push(kb);
        self
    }

    pub fn with_history(self, session_id: SessionId, history: serde_json::Value) -> Self {
        let history = serde_json::from_value(history).unwrap();
        self.histories.lock().unwrap().insert(session_id, history);
        self
    }

    pub fn with_history_delay(mut self, delay: Duration) -> Self {
        self.history_delay = Some(delay);
        self
    }

    pub fn history(&self, session_id: &SessionId) -> Option<Vec<PersistedMessage>> {
        self.histories.lock().unwrap().get(session_id).cloned()
    }
}

impl Default for MockChatApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn available_models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        Ok(self.models.lock().unwrap().clone())
    }

    async fn knowledge_bases(&self) -> Result<KbCatalog, ApiError> {
        Ok(self.kbs.lock().unwrap().clone())
    }

    async fn session_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PersistedMessage>, ApiError> {
        if let Some(delay) = self.history_delay {
            tokio::time::sleep(delay).await;
        }
        self.history(session_id).ok_or_else(|| ApiError::Business {
            code: 404,
            message: format!("session {session_id} not found"),
        })
    }

    async fn start_session(&self, request: &StartChatRequest) -> Result<SessionId, ApiError> {
        self.started.lock().unwrap().push(request.clone());

        let id = {
            let mut next = self.next_session.lock().unwrap();
            *next += 1;
            RemoteId::Number(*next)
        };
        let pending = serde_json::from_value(json!({
            "id": 1,
            "role": "user",
            "content": request.question,
            "status": "pending",
            "modelId": request.model_id,
            "kbId": request.kb_id,
            "options": serde_json::to_string(&request.options).unwrap(),
        }))
        .unwrap();
        self.histories
            .lock()
            .unwrap()
            .insert(id.clone(), vec![pending]);
        Ok(id)
    }

    async fn list_sessions(&self, _query: &SessionListQuery) -> Result<SessionList, ApiError> {
        Ok(SessionList::default())
    }

    async fn search_sessions(
        &self,
        _query: &SessionSearchQuery,
    ) -> Result<Vec<SessionSearchHit>, ApiError> {
        Ok(Vec::new())
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), ApiError> {
        self.histories.lock().unwrap().remove(session_id);
        self.deleted.lock().unwrap().push(session_id.clone());
        Ok(())
    }
}

// ============================================================================
// Mock Transport
// ============================================================================

struct OpenedStream {
    stream: StreamId,
    request: StreamRequest,
    sink: TransportSink,
    cancel: CancellationToken,
}

/// Transport whose events are pushed by the test
#[allow(dead_code)]
pub struct MockTransport {
    opened: Mutex<Vec<OpenedStream>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(StreamId, StreamRequest)> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .map(|o| (o.stream, o.request.clone()))
            .collect()
    }

    pub fn last(&self) -> Option<(StreamId, StreamRequest)> {
        self.requests().pop()
    }

    pub fn is_cancelled(&self, stream: StreamId) -> bool {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .find(|o| o.stream == stream)
            .is_some_and(|o| o.cancel.is_cancelled())
    }

    /// Deliver an event as the transport would. Cancelled streams stay
    /// silent; returns whether the event was delivered.
    pub fn emit(&self, stream: StreamId, event: TransportEvent) -> bool {
        let opened = self.opened.lock().unwrap();
        let Some(entry) = opened.iter().find(|o| o.stream == stream) else {
            return false;
        };
        if entry.cancel.is_cancelled() {
            return false;
        }
        entry.sink.send(TransportMessage { stream, event }).is_ok()
    }

    pub fn emit_data(&self, stream: StreamId, data: &str) -> bool {
        self.emit(
            stream,
            TransportEvent::Message(SseFrame {
                data: data.to_string(),
                ..SseFrame::default()
            }),
        )
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTransport for MockTransport {
    fn open(
        &self,
        stream: StreamId,
        request: StreamRequest,
        sink: TransportSink,
    ) -> StreamHandle {
        let cancel = CancellationToken::new();
        self.opened.lock().unwrap().push(OpenedStream {
            stream,
            request,
            sink,
            cancel: cancel.clone(),
        });
        StreamHandle::new(stream, cancel)
    }
}
