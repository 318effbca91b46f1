//! HTTP client for the chat backend's REST endpoints

use super::error::ApiError;
use super::types::{
    Envelope, KbCatalog, ModelInfo, PersistedMessage, SessionId, SessionList, SessionListQuery,
    SessionSearchHit, SessionSearchQuery, StartChatRequest, StartChatResponse, SUCCESS_CODE,
};
use crate::config::ClientConfig;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let request = self.authorize(self.client.get(self.url(path)));
        Self::execute(request, path).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = self.authorize(self.client.post(self.url(path)).json(body));
        Self::execute(request, path).await
    }

    async fn execute<T: DeserializeOwned>(
        request: RequestBuilder,
        path: &str,
    ) -> Result<T, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            tracing::warn!(path, status = status.as_u16(), "REST request failed");
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        tracing::debug!(path, bytes = text.len(), "REST response");
        decode_envelope(&text)
    }

    pub async fn available_models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        self.get("/models/available").await
    }

    pub async fn knowledge_bases(&self) -> Result<KbCatalog, ApiError> {
        self.get("/kb").await
    }

    pub async fn session_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PersistedMessage>, ApiError> {
        self.get(&format!("/chat/sessions/{session_id}/messages"))
            .await
    }

    pub async fn start_session(&self, request: &StartChatRequest) -> Result<SessionId, ApiError> {
        let response: StartChatResponse = self.post("/chat/start", request).await?;
        Ok(response.session_id)
    }

    pub async fn list_sessions(&self, query: &SessionListQuery) -> Result<SessionList, ApiError> {
        self.post("/sessions/list", query).await
    }

    pub async fn search_sessions(
        &self,
        query: &SessionSearchQuery,
    ) -> Result<Vec<SessionSearchHit>, ApiError> {
        self.post("/sessions/search", query).await
    }

    pub async fn delete_session(&self, session_id: &SessionId) -> Result<(), ApiError> {
        let path = format!("/sessions/{session_id}");
        let request = self.authorize(self.client.delete(self.url(&path)));
        let _: serde_json::Value = Self::execute(request, &path).await?;
        Ok(())
    }
}

/// Unwrap `{code, message, data}` and decode `data`
pub(crate) fn decode_envelope<T: DeserializeOwned>(text: &str) -> Result<T, ApiError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.code != SUCCESS_CODE {
        return Err(ApiError::Business {
            code: envelope.code,
            message: envelope.message.unwrap_or_default(),
        });
    }
    Ok(serde_json::from_value(envelope.data)?)
}
