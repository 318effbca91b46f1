//! reqwest-backed SSE transport

use super::{
    ResponseMeta, SseDecoder, StreamHandle, StreamId, StreamMethod, StreamRequest,
    TransportError, TransportEvent, TransportMessage, TransportSink,
};
use crate::config::ClientConfig;
use futures::StreamExt;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    /// Streams carry no overall timeout; they run until the server ends them.
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    /// Spawn a reader task for `request`. Events arrive on `sink` tagged
    /// with `stream`; nothing is sent after the handle is cancelled.
    pub fn open(
        &self,
        stream: StreamId,
        request: StreamRequest,
        sink: TransportSink,
    ) -> StreamHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = self.clone();

        tokio::spawn(async move {
            let emitter = Emitter { stream, sink };
            tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!(stream_id = %stream, "Stream cancelled");
                }
                () = this.run_stream(request, &emitter) => {}
            }
        });

        StreamHandle::new(stream, cancel)
    }

    async fn run_stream(&self, request: StreamRequest, emitter: &Emitter) {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            StreamMethod::Get => self.client.get(&url),
            StreamMethod::Post => self.client.post(&url),
        };
        builder = builder.header("Accept", "text/event-stream");
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(stream_id = %emitter.stream, error = %e, "Stream connect failed");
                emitter.send(TransportEvent::Error(TransportError::network(e.to_string())));
                return;
            }
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(stream_id = %emitter.stream, status, "Stream rejected");
            emitter.send(TransportEvent::Error(TransportError::from_status(status, &body)));
            return;
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        if !emitter.send(TransportEvent::Open(ResponseMeta {
            status,
            content_type,
        })) {
            return;
        }

        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for frame in decoder.push(&bytes) {
                        tracing::debug!(
                            stream_id = %emitter.stream,
                            bytes = frame.data.len(),
                            "SSE frame"
                        );
                        if !emitter.send(TransportEvent::Message(frame)) {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(stream_id = %emitter.stream, error = %e, "Stream read failed");
                    emitter.send(TransportEvent::Error(TransportError::network(e.to_string())));
                    return;
                }
            }
        }

        if let Some(frame) = decoder.finish() {
            if !emitter.send(TransportEvent::Message(frame)) {
                return;
            }
        }
        tracing::info!(stream_id = %emitter.stream, "Stream closed");
        emitter.send(TransportEvent::Close);
    }
}

struct Emitter {
    stream: StreamId,
    sink: TransportSink,
}

impl Emitter {
    /// Returns false once the receiver is gone
    fn send(&self, event: TransportEvent) -> bool {
        self.sink
            .send(TransportMessage {
                stream: self.stream,
                event,
            })
            .is_ok()
    }
}
