//! Events that can occur in a conversation

use super::state::{GenerationParams, MessageRef};
use crate::api::PersistedMessage;
use crate::stream::StreamEvent;
use crate::transport::StreamId;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // Session lifecycle
    LoadStarted,
    LoadFailed {
        message: String,
    },
    /// History fetched. `resume` carries the parameters to continue a
    /// pending last user message with, if the caller wants it resumed.
    Restored {
        history: Vec<PersistedMessage>,
        resume: Option<GenerationParams>,
    },
    /// Session torn down; any open stream is released
    Teardown,

    // User actions
    Send {
        text: String,
        params: GenerationParams,
    },
    Edit {
        target: MessageRef,
        content: String,
        params: GenerationParams,
    },
    Retry {
        target: MessageRef,
        params: GenerationParams,
    },
    /// Retry whichever user message is latest
    RetryLatest {
        params: GenerationParams,
    },

    // Transport events
    StreamOpened {
        stream: StreamId,
    },
    Stream {
        stream: StreamId,
        event: StreamEvent,
    },
    StreamFailed {
        stream: StreamId,
        message: String,
    },
    StreamClosed {
        stream: StreamId,
    },
}

impl Event {
    /// Stream the event belongs to, for transport-originated events
    pub fn stream(&self) -> Option<StreamId> {
        match self {
            Event::StreamOpened { stream }
            | Event::Stream { stream, .. }
            | Event::StreamFailed { stream, .. }
            | Event::StreamClosed { stream } => Some(*stream),
            _ => None,
        }
    }
}
