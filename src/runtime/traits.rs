//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the session runtime with mock implementations.

use crate::api::{
    ApiError, HttpChatApi, KbCatalog, ModelInfo, PersistedMessage, SessionId, SessionList,
    SessionListQuery, SessionSearchHit, SessionSearchQuery, StartChatRequest,
};
use crate::transport::{HttpTransport, StreamHandle, StreamId, StreamRequest, TransportSink};
use async_trait::async_trait;
use std::sync::Arc;

/// Request/response operations against the chat backend
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn available_models(&self) -> Result<Vec<ModelInfo>, ApiError>;

    async fn knowledge_bases(&self) -> Result<KbCatalog, ApiError>;

    async fn session_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PersistedMessage>, ApiError>;

    /// Create a session whose first question is stored as a pending user
    /// message
    async fn start_session(&self, request: &StartChatRequest) -> Result<SessionId, ApiError>;

    async fn list_sessions(&self, query: &SessionListQuery) -> Result<SessionList, ApiError>;

    async fn search_sessions(
        &self,
        query: &SessionSearchQuery,
    ) -> Result<Vec<SessionSearchHit>, ApiError>;

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), ApiError>;
}

/// Opens streaming connections
pub trait StreamTransport: Send + Sync {
    /// Start a connection. Its events arrive on `sink` tagged with `stream`
    /// until a terminal event or until the returned handle is cancelled.
    fn open(&self, stream: StreamId, request: StreamRequest, sink: TransportSink)
        -> StreamHandle;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ChatApi + ?Sized> ChatApi for Arc<T> {
    async fn available_models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        (**self).available_models().await
    }

    async fn knowledge_bases(&self) -> Result<KbCatalog, ApiError> {
        (**self).knowledge_bases().await
    }

    async fn session_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PersistedMessage>, ApiError> {
        (**self).session_messages(session_id).await
    }

    async fn start_session(&self, request: &StartChatRequest) -> Result<SessionId, ApiError> {
        (**self).start_session(request).await
    }

    async fn list_sessions(&self, query: &SessionListQuery) -> Result<SessionList, ApiError> {
        (**self).list_sessions(query).await
    }

    async fn search_sessions(
        &self,
        query: &SessionSearchQuery,
    ) -> Result<Vec<SessionSearchHit>, ApiError> {
        (**self).search_sessions(query).await
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), ApiError> {
        (**self).delete_session(session_id).await
    }
}

impl<T: StreamTransport + ?Sized> StreamTransport for Arc<T> {
    fn open(
        &self,
        stream: StreamId,
        request: StreamRequest,
        sink: TransportSink,
    ) -> StreamHandle {
        (**self).open(stream, request, sink)
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn available_models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        HttpChatApi::available_models(self).await
    }

    async fn knowledge_bases(&self) -> Result<KbCatalog, ApiError> {
        HttpChatApi::knowledge_bases(self).await
    }

    async fn session_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PersistedMessage>, ApiError> {
        HttpChatApi::session_messages(self, session_id).await
    }

    async fn start_session(&self, request: &StartChatRequest) -> Result<SessionId, ApiError> {
        HttpChatApi::start_session(self, request).await
    }

    async fn list_sessions(&self, query: &SessionListQuery) -> Result<SessionList, ApiError> {
        HttpChatApi::list_sessions(self, query).await
    }

    async fn search_sessions(
        &self,
        query: &SessionSearchQuery,
    ) -> Result<Vec<SessionSearchHit>, ApiError> {
        HttpChatApi::search_sessions(self, query).await
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), ApiError> {
        HttpChatApi::delete_session(self, session_id).await
    }
}

impl StreamTransport for HttpTransport {
    fn open(
        &self,
        stream: StreamId,
        request: StreamRequest,
        sink: TransportSink,
    ) -> StreamHandle {
        HttpTransport::open(self, stream, request, sink)
    }
}
