//! Conversation state types

use crate::api::{KbId, MessageId, ModelId, PersistedMessage, SessionId};
use crate::stream::ProcessStep;
use crate::transport::StreamId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// Messages
// ============================================================================

/// Client-assigned message identity, stable for the lifetime of a
/// [`Conversation`] regardless of whether the server has issued an id yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Generating,
    Completed,
    Error,
}

impl MessageStatus {
    /// Persisted status; a missing or unrecognised value counts as completed
    pub fn from_wire(status: Option<&str>) -> Self {
        match status {
            Some("pending") => Self::Pending,
            Some("generating") => Self::Generating,
            Some("error") => Self::Error,
            Some("completed") | None => Self::Completed,
            Some(other) => {
                tracing::debug!(status = other, "Unknown message status, treating as completed");
                Self::Completed
            }
        }
    }
}

/// Tool and thinking toggles a generation was requested with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
    /// Options this client does not interpret, echoed back on resume
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerationOptions {
    pub fn web_search(&self) -> bool {
        self.web_search == Some(true)
    }

    pub fn thinking(&self) -> bool {
        self.thinking == Some(true)
    }
}

/// How the reasoning panel of a message is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingPanel {
    Hidden,
    Expanded,
    Collapsed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub local_id: LocalId,
    pub id: Option<MessageId>,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    /// Placeholder has not received its first event yet
    pub loading: bool,
    pub thinking: Option<String>,
    pub rag_process: Vec<ProcessStep>,
    pub latency_ms: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub options: Option<GenerationOptions>,
    pub model_id: Option<ModelId>,
    pub kb_id: Option<KbId>,
}

impl Message {
    fn blank(local_id: LocalId, role: Role, status: MessageStatus) -> Self {
        Self {
            local_id,
            id: None,
            role,
            content: String::new(),
            status,
            loading: false,
            thinking: None,
            rag_process: Vec::new(),
            latency_ms: None,
            completion_tokens: None,
            options: None,
            model_id: None,
            kb_id: None,
        }
    }

    pub fn user(local_id: LocalId, content: impl Into<String>, params: &GenerationParams) -> Self {
        Self {
            content: content.into(),
            options: Some(params.options.clone()),
            model_id: params.model_id.clone(),
            kb_id: params.kb_id.clone(),
            ..Self::blank(local_id, Role::User, MessageStatus::Pending)
        }
    }

    pub fn assistant_placeholder(local_id: LocalId) -> Self {
        Self {
            loading: true,
            ..Self::blank(local_id, Role::Assistant, MessageStatus::Generating)
        }
    }

    pub fn from_persisted(local_id: LocalId, persisted: &PersistedMessage) -> Self {
        let status = persisted.status();
        Self {
            local_id,
            id: persisted.id.clone(),
            role: persisted.role,
            content: persisted.content.clone(),
            status,
            loading: persisted.role == Role::Assistant && status == MessageStatus::Generating,
            thinking: persisted.thinking.clone().filter(|t| !t.is_empty()),
            rag_process: persisted.parsed_rag_process().unwrap_or_default(),
            latency_ms: persisted.latency_ms,
            completion_tokens: persisted.completion_tokens,
            options: persisted.parsed_options(),
            model_id: persisted.model_id.clone(),
            kb_id: persisted.kb_id.clone(),
        }
    }

    /// Replace the record with the same `(step, status)`, else append
    pub fn upsert_process(&mut self, step: ProcessStep) {
        match self.rag_process.iter_mut().find(|p| p.key() == step.key()) {
            Some(existing) => *existing = step,
            None => self.rag_process.push(step),
        }
    }

    pub fn thinking_panel(&self) -> ThinkingPanel {
        match &self.thinking {
            None => ThinkingPanel::Hidden,
            Some(t) if t.is_empty() => ThinkingPanel::Hidden,
            Some(_) if self.status == MessageStatus::Generating && self.content.is_empty() => {
                ThinkingPanel::Expanded
            }
            Some(_) => ThinkingPanel::Collapsed,
        }
    }
}

/// Reference to a message as a caller knows it. Resolution tries the local
/// id, then the server id, then a content match against the latest user
/// message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageRef {
    pub local_id: Option<LocalId>,
    pub remote_id: Option<MessageId>,
    pub content: Option<String>,
}

impl MessageRef {
    pub fn local(local_id: LocalId) -> Self {
        Self {
            local_id: Some(local_id),
            ..Self::default()
        }
    }

    pub fn remote(remote_id: MessageId) -> Self {
        Self {
            remote_id: Some(remote_id),
            ..Self::default()
        }
    }

    pub fn of(message: &Message) -> Self {
        Self {
            local_id: Some(message.local_id),
            remote_id: message.id.clone(),
            content: Some(message.content.clone()),
        }
    }
}

// ============================================================================
// Generation
// ============================================================================

/// Request parameters for one generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub session_id: SessionId,
    pub model_id: Option<ModelId>,
    pub kb_id: Option<KbId>,
    pub options: GenerationOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    Send,
    Edit,
    Retry,
    /// Continuation of a user message left pending by an interrupted session
    Resume,
}

/// The user/assistant pair a stream is writing into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTurn {
    pub stream: StreamId,
    pub kind: TurnKind,
    pub user: LocalId,
    pub assistant: LocalId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationState {
    #[default]
    Idle,
    /// History fetch in flight
    Loading,
    /// Stream requested, not yet open
    Requesting(ActiveTurn),
    Streaming(ActiveTurn),
}

impl GenerationState {
    pub fn active_turn(&self) -> Option<ActiveTurn> {
        match self {
            Self::Requesting(turn) | Self::Streaming(turn) => Some(*turn),
            Self::Idle | Self::Loading => None,
        }
    }
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub(super) messages: Vec<Message>,
    pub(super) generation: GenerationState,
    /// Most recently finished turn; late usage events still land here
    pub(super) settled: Option<ActiveTurn>,
    next_local_id: u64,
    next_stream_id: u64,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn generation(&self) -> GenerationState {
        self.generation
    }

    pub fn active_turn(&self) -> Option<ActiveTurn> {
        self.generation.active_turn()
    }

    pub fn settled_turn(&self) -> Option<ActiveTurn> {
        self.settled
    }

    pub fn is_generating(&self) -> bool {
        self.active_turn().is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.generation == GenerationState::Loading
    }

    pub fn get(&self, local_id: LocalId) -> Option<&Message> {
        self.messages.iter().find(|m| m.local_id == local_id)
    }

    pub(super) fn get_mut(&mut self, local_id: LocalId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.local_id == local_id)
    }

    pub fn position(&self, local_id: LocalId) -> Option<usize> {
        self.messages.iter().position(|m| m.local_id == local_id)
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    pub fn resolve(&self, target: &MessageRef) -> Option<LocalId> {
        if let Some(local) = target.local_id.filter(|id| self.get(*id).is_some()) {
            return Some(local);
        }
        if let Some(remote) = &target.remote_id {
            if let Some(m) = self.messages.iter().find(|m| m.id.as_ref() == Some(remote)) {
                return Some(m.local_id);
            }
        }
        let content = target.content.as_deref()?;
        self.last_user_message()
            .filter(|m| m.content == content)
            .map(|m| m.local_id)
    }

    pub(super) fn allocate_local_id(&mut self) -> LocalId {
        self.next_local_id += 1;
        LocalId(self.next_local_id)
    }

    /// Stream ids are shared with streams the runtime opens on its own
    pub fn allocate_stream_id(&mut self) -> StreamId {
        self.next_stream_id += 1;
        StreamId(self.next_stream_id)
    }
}
