//! Effects produced by state transitions

use super::state::{LocalId, Message};
use crate::api::{KbId, ModelId, SessionId};
use crate::transport::{StreamId, StreamRequest};

/// Effects to be executed after state transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Open a transport connection for `request`
    OpenStream {
        stream: StreamId,
        request: StreamRequest,
    },

    /// Release a transport connection
    CancelStream { stream: StreamId },

    /// Notify subscribers
    NotifyClient(SessionUpdate),
}

impl Effect {
    pub fn open_stream(stream: StreamId, request: StreamRequest) -> Self {
        Effect::OpenStream { stream, request }
    }

    pub fn cancel_stream(stream: StreamId) -> Self {
        Effect::CancelStream { stream }
    }

    pub fn notify(update: SessionUpdate) -> Self {
        Effect::NotifyClient(update)
    }

    pub fn message_updated(message: &Message) -> Self {
        Effect::NotifyClient(SessionUpdate::MessageUpdated {
            message: message.clone(),
        })
    }

    pub fn generation_changed(generating: bool) -> Self {
        Effect::NotifyClient(SessionUpdate::GenerationChanged { generating })
    }
}

/// Observable change to a session, broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// A session was opened; its transcript follows as `Restored`
    SessionOpened { session_id: SessionId },
    /// Whole transcript replaced
    Restored { messages: Vec<Message> },
    MessageAppended { message: Message },
    /// Spliced out by an edit or retry
    MessageRemoved { local_id: LocalId },
    ContentDelta { local_id: LocalId, text: String },
    ThinkingDelta { local_id: LocalId, text: String },
    /// Anything other than a text delta changed
    MessageUpdated { message: Message },
    GenerationChanged { generating: bool },
    SelectionChanged {
        model_id: Option<ModelId>,
        kb_id: Option<KbId>,
        tools: Vec<String>,
        thinking: bool,
    },
    Title { title: String },
    /// Request was refused; nothing changed
    Warning { message: String },
    /// Something failed; the session is still usable unless stated otherwise
    Failure { message: String },
}
