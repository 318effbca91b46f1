//! State transition function
//!
//! Every event is validated before anything is touched, so a rejected event
//! leaves the conversation exactly as it was.

use super::effect::{Effect, SessionUpdate};
use super::event::Event;
use super::state::{
    ActiveTurn, Conversation, GenerationParams, GenerationState, LocalId, Message, MessageRef,
    MessageStatus, Role, TurnKind,
};
use crate::api::PersistedMessage;
use crate::stream::{StreamEvent, UsageStats};
use crate::transport::{StreamId, StreamRequest};
use thiserror::Error;

/// Appended to an assistant message whose stream failed
pub const ERROR_MARKER: &str = "\n[Error: request failed]";

/// Result of a state transition
#[derive(Debug, Default)]
pub struct TransitionResult {
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Why an event was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("A response is still being generated")]
    GenerationInProgress,
    #[error("Session is still loading")]
    LoadInProgress,
    #[error("Message not found")]
    TargetNotFound,
    #[error("No user message to retry")]
    NothingToRetry,
    #[error("Message content cannot be empty")]
    EmptyContent,
    #[error("Message has not been saved yet")]
    NotPersisted,
    #[error("Only the latest question can be edited or retried")]
    NotLatestTurn,
}

pub fn transition(
    conv: &mut Conversation,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match event {
        // ============================================================
        // Session lifecycle
        // ============================================================
        Event::LoadStarted => Ok(load_started(conv)),

        Event::LoadFailed { message } => {
            tracing::warn!(error = %message, "Session load failed");
            if conv.is_loading() {
                conv.generation = GenerationState::Idle;
            }
            Ok(TransitionResult::new())
        }

        Event::Restored { history, resume } => Ok(restored(conv, &history, resume.as_ref())),

        Event::Teardown => {
            let result = release_active(conv);
            conv.generation = GenerationState::Idle;
            Ok(result)
        }

        // ============================================================
        // User actions
        // ============================================================
        Event::Send { text, params } => {
            ensure_idle(conv)?;
            if text.trim().is_empty() {
                return Err(TransitionError::EmptyContent);
            }
            Ok(send(conv, text, &params))
        }

        Event::Edit {
            target,
            content,
            params,
        } => {
            ensure_idle(conv)?;
            if content.trim().is_empty() {
                return Err(TransitionError::EmptyContent);
            }
            let user = latest_turn_target(conv, &target)?;
            let remote = conv
                .get(user)
                .and_then(|m| m.id.clone())
                .ok_or(TransitionError::NotPersisted)?;
            let request = StreamRequest::edit(&remote, &params, &content);
            Ok(restart_turn(conv, user, Some(content), &params, TurnKind::Edit, request))
        }

        Event::Retry { target, params } => {
            ensure_idle(conv)?;
            let user = latest_turn_target(conv, &target)?;
            Ok(retry(conv, user, &params))
        }

        Event::RetryLatest { params } => {
            ensure_idle(conv)?;
            let user = conv
                .last_user_message()
                .map(|m| m.local_id)
                .ok_or(TransitionError::NothingToRetry)?;
            Ok(retry(conv, user, &params))
        }

        // ============================================================
        // Transport events
        // ============================================================
        Event::StreamOpened { stream } => {
            if let GenerationState::Requesting(turn) = conv.generation {
                if turn.stream == stream {
                    tracing::debug!(stream_id = %stream, "Stream opened");
                    conv.generation = GenerationState::Streaming(turn);
                }
            }
            Ok(TransitionResult::new())
        }

        Event::Stream { stream, event } => Ok(stream_event(conv, stream, event)),

        Event::StreamFailed { stream, message } => Ok(stream_failed(conv, stream, &message)),

        Event::StreamClosed { stream } => Ok(stream_closed(conv, stream)),
    }
}

// ============================================================================
// Guards
// ============================================================================

fn ensure_idle(conv: &Conversation) -> Result<(), TransitionError> {
    match conv.generation {
        GenerationState::Idle => Ok(()),
        GenerationState::Loading => Err(TransitionError::LoadInProgress),
        GenerationState::Requesting(_) | GenerationState::Streaming(_) => {
            Err(TransitionError::GenerationInProgress)
        }
    }
}

/// Edits and retries only ever apply to the latest user message
fn latest_turn_target(
    conv: &Conversation,
    target: &MessageRef,
) -> Result<LocalId, TransitionError> {
    let local = conv.resolve(target).ok_or(TransitionError::TargetNotFound)?;
    match conv.last_user_message() {
        Some(latest) if latest.local_id == local => Ok(local),
        _ => Err(TransitionError::NotLatestTurn),
    }
}

fn active_turn_for(conv: &Conversation, stream: StreamId) -> Option<ActiveTurn> {
    let turn = conv.active_turn().filter(|t| t.stream == stream);
    if turn.is_none() {
        tracing::debug!(stream_id = %stream, "Ignoring event for inactive stream");
    }
    turn
}

// ============================================================================
// Session lifecycle
// ============================================================================

fn release_active(conv: &Conversation) -> TransitionResult {
    match conv.active_turn() {
        Some(turn) => TransitionResult::new()
            .with_effect(Effect::cancel_stream(turn.stream))
            .with_effect(Effect::generation_changed(false)),
        None => TransitionResult::new(),
    }
}

fn load_started(conv: &mut Conversation) -> TransitionResult {
    let result = release_active(conv);
    conv.messages.clear();
    conv.settled = None;
    conv.generation = GenerationState::Loading;
    result.with_effect(Effect::notify(SessionUpdate::Restored {
        messages: Vec::new(),
    }))
}

fn restored(
    conv: &mut Conversation,
    history: &[PersistedMessage],
    resume: Option<&GenerationParams>,
) -> TransitionResult {
    let mut result = release_active(conv);

    let mut messages = Vec::with_capacity(history.len() + 1);
    for persisted in history {
        let local_id = conv.allocate_local_id();
        messages.push(Message::from_persisted(local_id, persisted));
    }
    conv.messages = messages;
    conv.settled = None;
    conv.generation = GenerationState::Idle;

    tracing::info!(messages = conv.messages.len(), "Session restored");
    result = result.with_effect(Effect::notify(SessionUpdate::Restored {
        messages: conv.messages.clone(),
    }));

    let pending = conv
        .messages
        .last()
        .filter(|m| m.role == Role::User && m.status == MessageStatus::Pending)
        .map(|m| m.local_id);

    match (pending, resume) {
        (Some(user), Some(params)) => {
            tracing::info!(user = %user, "Resuming interrupted turn");
            let request = StreamRequest::chat(params, None);
            result.with_effects(begin_turn(conv, user, TurnKind::Resume, request))
        }
        _ => result,
    }
}

// ============================================================================
// User actions
// ============================================================================

fn send(conv: &mut Conversation, text: String, params: &GenerationParams) -> TransitionResult {
    let request = StreamRequest::chat(params, Some(&text));
    let local_id = conv.allocate_local_id();
    let user = Message::user(local_id, text, params);
    conv.messages.push(user.clone());

    TransitionResult::new()
        .with_effect(Effect::notify(SessionUpdate::MessageAppended { message: user }))
        .with_effects(begin_turn(conv, local_id, TurnKind::Send, request))
}

fn retry(conv: &mut Conversation, user: LocalId, params: &GenerationParams) -> TransitionResult {
    let Some(msg) = conv.get(user) else {
        return TransitionResult::new();
    };
    // A question the server never acknowledged is asked again
    let request = match &msg.id {
        Some(remote) => StreamRequest::retry(remote, params),
        None => StreamRequest::chat(params, Some(&msg.content)),
    };
    restart_turn(conv, user, None, params, TurnKind::Retry, request)
}

/// Drop the answer that followed `user` and start a new generation for it
fn restart_turn(
    conv: &mut Conversation,
    user: LocalId,
    new_content: Option<String>,
    params: &GenerationParams,
    kind: TurnKind,
    request: StreamRequest,
) -> TransitionResult {
    let mut result = TransitionResult::new();

    if let Some(msg) = conv.get_mut(user) {
        if let Some(content) = new_content {
            msg.content = content;
        }
        msg.options = Some(params.options.clone());
        msg.model_id.clone_from(&params.model_id);
        msg.kb_id.clone_from(&params.kb_id);
    }

    if let Some(pos) = conv.position(user) {
        let next = pos + 1;
        if conv
            .messages
            .get(next)
            .is_some_and(|m| m.role == Role::Assistant)
        {
            let removed = conv.messages.remove(next);
            if conv.settled.is_some_and(|t| t.assistant == removed.local_id) {
                conv.settled = None;
            }
            result = result.with_effect(Effect::notify(SessionUpdate::MessageRemoved {
                local_id: removed.local_id,
            }));
        }
    }

    result.with_effects(begin_turn(conv, user, kind, request))
}

/// Append a placeholder answer for `user`, mark it generating and request
/// the stream
fn begin_turn(
    conv: &mut Conversation,
    user: LocalId,
    kind: TurnKind,
    request: StreamRequest,
) -> Vec<Effect> {
    let mut effects = Vec::with_capacity(5);

    let assistant_id = conv.allocate_local_id();
    let placeholder = Message::assistant_placeholder(assistant_id);
    conv.messages.push(placeholder.clone());

    if let Some(msg) = conv.get_mut(user) {
        msg.status = MessageStatus::Generating;
        effects.push(Effect::message_updated(msg));
    }

    let stream = conv.allocate_stream_id();
    conv.generation = GenerationState::Requesting(ActiveTurn {
        stream,
        kind,
        user,
        assistant: assistant_id,
    });
    tracing::info!(stream_id = %stream, ?kind, "Generation requested");

    effects.push(Effect::notify(SessionUpdate::MessageAppended {
        message: placeholder,
    }));
    effects.push(Effect::generation_changed(true));
    effects.push(Effect::open_stream(stream, request));
    effects
}

// ============================================================================
// Transport events
// ============================================================================

fn stream_event(
    conv: &mut Conversation,
    stream: StreamId,
    event: StreamEvent,
) -> TransitionResult {
    if let StreamEvent::Usage(usage) = event {
        return apply_usage(conv, stream, usage);
    }

    let Some(turn) = active_turn_for(conv, stream) else {
        return TransitionResult::new();
    };
    if let GenerationState::Requesting(turn) = conv.generation {
        conv.generation = GenerationState::Streaming(turn);
    }

    match event {
        StreamEvent::Content { text } => match conv.get_mut(turn.assistant) {
            Some(msg) => {
                msg.loading = false;
                msg.content.push_str(&text);
                TransitionResult::new().with_effect(Effect::notify(SessionUpdate::ContentDelta {
                    local_id: turn.assistant,
                    text,
                }))
            }
            None => TransitionResult::new(),
        },

        StreamEvent::Thinking { text } => match conv.get_mut(turn.assistant) {
            Some(msg) => {
                msg.loading = false;
                msg.thinking.get_or_insert_with(String::new).push_str(&text);
                TransitionResult::new().with_effect(Effect::notify(SessionUpdate::ThinkingDelta {
                    local_id: turn.assistant,
                    text,
                }))
            }
            None => TransitionResult::new(),
        },

        StreamEvent::Process(step) => match conv.get_mut(turn.assistant) {
            Some(msg) => {
                msg.loading = false;
                msg.upsert_process(step);
                TransitionResult::new().with_effect(Effect::message_updated(msg))
            }
            None => TransitionResult::new(),
        },

        StreamEvent::Done {
            user_message_id,
            assistant_message_id,
        } => {
            let mut result = TransitionResult::new();
            if let Some(msg) = conv.get_mut(turn.user) {
                if user_message_id.is_some() {
                    msg.id = user_message_id;
                }
                msg.status = MessageStatus::Completed;
                result = result.with_effect(Effect::message_updated(msg));
            }
            if let Some(msg) = conv.get_mut(turn.assistant) {
                if assistant_message_id.is_some() {
                    msg.id = assistant_message_id;
                }
                msg.status = MessageStatus::Completed;
                msg.loading = false;
                result = result.with_effect(Effect::message_updated(msg));
            }
            settle(conv, turn);
            tracing::info!(stream_id = %stream, "Generation done");
            result.with_effect(Effect::generation_changed(false))
        }

        StreamEvent::Usage(_) => TransitionResult::new(),
    }
}

/// Usage lands on the active turn or, after `done`, on the turn it settled.
/// Each metric is recorded once.
fn apply_usage(
    conv: &mut Conversation,
    stream: StreamId,
    usage: UsageStats,
) -> TransitionResult {
    let turn = conv
        .active_turn()
        .or(conv.settled)
        .filter(|t| t.stream == stream);
    let Some(turn) = turn else {
        tracing::debug!(stream_id = %stream, "Ignoring usage for unknown stream");
        return TransitionResult::new();
    };
    let Some(msg) = conv.get_mut(turn.assistant) else {
        return TransitionResult::new();
    };

    let mut changed = false;
    if msg.latency_ms.is_none() && usage.latency_ms.is_some() {
        msg.latency_ms = usage.latency_ms;
        changed = true;
    }
    if msg.completion_tokens.is_none() && usage.completion_tokens.is_some() {
        msg.completion_tokens = usage.completion_tokens;
        changed = true;
    }

    if changed {
        TransitionResult::new().with_effect(Effect::message_updated(msg))
    } else {
        TransitionResult::new()
    }
}

fn stream_failed(conv: &mut Conversation, stream: StreamId, message: &str) -> TransitionResult {
    let Some(turn) = active_turn_for(conv, stream) else {
        return TransitionResult::new();
    };
    tracing::warn!(stream_id = %stream, error = message, "Generation failed");

    let mut result = TransitionResult::new().with_effect(Effect::cancel_stream(stream));
    if let Some(msg) = conv.get_mut(turn.assistant) {
        msg.content.push_str(ERROR_MARKER);
        msg.status = MessageStatus::Error;
        msg.loading = false;
        result = result.with_effect(Effect::message_updated(msg));
    }
    if let Some(msg) = conv.get_mut(turn.user) {
        msg.status = MessageStatus::Pending;
        result = result.with_effect(Effect::message_updated(msg));
    }
    conv.generation = GenerationState::Idle;
    result.with_effect(Effect::generation_changed(false))
}

fn stream_closed(conv: &mut Conversation, stream: StreamId) -> TransitionResult {
    let Some(turn) = active_turn_for(conv, stream) else {
        return TransitionResult::new();
    };

    let mut result = TransitionResult::new();
    if let Some(msg) = conv.get_mut(turn.assistant) {
        msg.status = MessageStatus::Completed;
        msg.loading = false;
        result = result.with_effect(Effect::message_updated(msg));
    }
    if let Some(msg) = conv.get_mut(turn.user) {
        msg.status = MessageStatus::Completed;
        result = result.with_effect(Effect::message_updated(msg));
    }
    settle(conv, turn);
    tracing::info!(stream_id = %stream, "Generation closed");
    result.with_effect(Effect::generation_changed(false))
}

fn settle(conv: &mut Conversation, turn: ActiveTurn) {
    conv.generation = GenerationState::Idle;
    conv.settled = Some(turn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RemoteId;
    use crate::state_machine::{GenerationOptions, ThinkingPanel};
    use crate::stream::ProcessStep;
    use crate::transport::StreamKind;
    use serde_json::json;

    fn params() -> GenerationParams {
        GenerationParams {
            session_id: RemoteId::Number(1),
            model_id: Some(RemoteId::Number(3)),
            kb_id: None,
            options: GenerationOptions::default(),
        }
    }

    fn apply(conv: &mut Conversation, event: Event) -> Vec<Effect> {
        transition(conv, event).unwrap().effects
    }

    fn opened_stream(effects: &[Effect]) -> (StreamId, StreamRequest) {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::OpenStream { stream, request } => Some((*stream, request.clone())),
                _ => None,
            })
            .expect("no stream opened")
    }

    fn content(stream: StreamId, text: &str) -> Event {
        Event::Stream {
            stream,
            event: StreamEvent::Content { text: text.into() },
        }
    }

    fn done(stream: StreamId, user: i64, assistant: i64) -> Event {
        Event::Stream {
            stream,
            event: StreamEvent::Done {
                user_message_id: Some(RemoteId::Number(user)),
                assistant_message_id: Some(RemoteId::Number(assistant)),
            },
        }
    }

    fn send(conv: &mut Conversation, text: &str) -> StreamId {
        let effects = apply(
            conv,
            Event::Send {
                text: text.into(),
                params: params(),
            },
        );
        opened_stream(&effects).0
    }

    /// Conversation holding one finished turn: user id 1, assistant id 2
    fn completed_turn() -> Conversation {
        let mut conv = Conversation::new();
        let stream = send(&mut conv, "Hello");
        apply(&mut conv, Event::StreamOpened { stream });
        apply(&mut conv, content(stream, "Hi there"));
        apply(&mut conv, done(stream, 1, 2));
        conv
    }

    fn persisted(value: serde_json::Value) -> PersistedMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_send_streams_answer() {
        let mut conv = Conversation::new();
        let effects = apply(
            &mut conv,
            Event::Send {
                text: "Hello".into(),
                params: params(),
            },
        );
        let (stream, request) = opened_stream(&effects);
        assert_eq!(request.kind, StreamKind::Chat);
        assert_eq!(request.body.as_ref().unwrap()["question"], json!("Hello"));
        assert!(conv.is_generating());
        assert_eq!(conv.messages().len(), 2);
        assert_eq!(conv.messages()[0].status, MessageStatus::Generating);
        assert!(conv.messages()[1].loading);

        apply(&mut conv, Event::StreamOpened { stream });
        apply(&mut conv, content(stream, "Hi"));
        apply(&mut conv, content(stream, " there"));
        apply(&mut conv, done(stream, 1, 2));

        let user = &conv.messages()[0];
        let assistant = &conv.messages()[1];
        assert_eq!(user.id, Some(RemoteId::Number(1)));
        assert_eq!(user.status, MessageStatus::Completed);
        assert_eq!(assistant.id, Some(RemoteId::Number(2)));
        assert_eq!(assistant.content, "Hi there");
        assert_eq!(assistant.status, MessageStatus::Completed);
        assert!(!assistant.loading);
        assert!(!conv.is_generating());
    }

    #[test]
    fn test_send_rejected_while_generating() {
        let mut conv = Conversation::new();
        send(&mut conv, "first");
        let before = conv.messages().to_vec();

        let err = transition(
            &mut conv,
            Event::Send {
                text: "second".into(),
                params: params(),
            },
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::GenerationInProgress);
        assert_eq!(conv.messages(), before.as_slice());
    }

    #[test]
    fn test_send_rejected_while_loading() {
        let mut conv = Conversation::new();
        apply(&mut conv, Event::LoadStarted);
        let err = transition(
            &mut conv,
            Event::Send {
                text: "hi".into(),
                params: params(),
            },
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::LoadInProgress);
    }

    #[test]
    fn test_empty_send_rejected() {
        let mut conv = Conversation::new();
        let err = transition(
            &mut conv,
            Event::Send {
                text: "   ".into(),
                params: params(),
            },
        )
        .unwrap_err();
        assert_eq!(err, TransitionError::EmptyContent);
        assert!(conv.messages().is_empty());
    }

    #[test]
    fn test_process_steps_upsert() {
        let mut conv = Conversation::new();
        let stream = send(&mut conv, "q");
        for status in ["start", "done", "done"] {
            apply(
                &mut conv,
                Event::Stream {
                    stream,
                    event: StreamEvent::Process(ProcessStep::new("retrieve", status)),
                },
            );
        }
        let assistant = &conv.messages()[1];
        assert_eq!(assistant.rag_process.len(), 2);
        assert!(!assistant.loading);
    }

    #[test]
    fn test_thinking_then_content() {
        let mut conv = Conversation::new();
        let stream = send(&mut conv, "q");
        apply(
            &mut conv,
            Event::Stream {
                stream,
                event: StreamEvent::Thinking { text: "let me".into() },
            },
        );
        apply(
            &mut conv,
            Event::Stream {
                stream,
                event: StreamEvent::Thinking { text: " see".into() },
            },
        );
        assert_eq!(conv.messages()[1].thinking.as_deref(), Some("let me see"));
        assert_eq!(conv.messages()[1].thinking_panel(), ThinkingPanel::Expanded);

        apply(&mut conv, content(stream, "answer"));
        assert_eq!(conv.messages()[1].thinking_panel(), ThinkingPanel::Collapsed);
    }

    fn thinking_only_turn() -> (Conversation, StreamId) {
        let mut conv = Conversation::new();
        let stream = send(&mut conv, "q");
        apply(&mut conv, Event::StreamOpened { stream });
        apply(
            &mut conv,
            Event::Stream {
                stream,
                event: StreamEvent::Thinking { text: "hmm".into() },
            },
        );
        assert_eq!(conv.messages()[1].thinking_panel(), ThinkingPanel::Expanded);
        (conv, stream)
    }

    #[test]
    fn test_thinking_collapses_when_stream_closes_without_content() {
        let (mut conv, stream) = thinking_only_turn();
        apply(&mut conv, Event::StreamClosed { stream });

        let answer = &conv.messages()[1];
        assert!(answer.content.is_empty());
        assert_eq!(answer.status, MessageStatus::Completed);
        assert_eq!(answer.thinking_panel(), ThinkingPanel::Collapsed);
    }

    #[test]
    fn test_thinking_collapses_when_stream_fails() {
        let (mut conv, stream) = thinking_only_turn();
        apply(
            &mut conv,
            Event::StreamFailed {
                stream,
                message: "reset".into(),
            },
        );

        let answer = &conv.messages()[1];
        assert_eq!(answer.status, MessageStatus::Error);
        assert_eq!(answer.thinking.as_deref(), Some("hmm"));
        assert_eq!(answer.thinking_panel(), ThinkingPanel::Collapsed);
    }

    #[test]
    fn test_done_is_idempotent_and_close_after_done_is_noop() {
        let mut conv = completed_turn();
        let stream = conv.settled_turn().unwrap().stream;
        let before = conv.messages().to_vec();

        assert!(apply(&mut conv, done(stream, 9, 9)).is_empty());
        assert!(apply(&mut conv, Event::StreamClosed { stream }).is_empty());
        assert!(apply(
            &mut conv,
            Event::StreamFailed {
                stream,
                message: "late".into()
            }
        )
        .is_empty());
        assert_eq!(conv.messages(), before.as_slice());
    }

    #[test]
    fn test_usage_after_done_applied_once() {
        let mut conv = completed_turn();
        let stream = conv.settled_turn().unwrap().stream;
        let usage = |latency| Event::Stream {
            stream,
            event: StreamEvent::Usage(UsageStats {
                latency_ms: Some(latency),
                completion_tokens: Some(42),
                ..UsageStats::default()
            }),
        };

        assert_eq!(apply(&mut conv, usage(1200)).len(), 1);
        assert!(apply(&mut conv, usage(5000)).is_empty());
        assert_eq!(conv.messages()[1].latency_ms, Some(1200));
        assert_eq!(conv.messages()[1].completion_tokens, Some(42));
    }

    #[test]
    fn test_stream_failure_marks_error_and_reverts_user() {
        let mut conv = Conversation::new();
        let stream = send(&mut conv, "q");
        apply(&mut conv, content(stream, "partial"));
        let effects = apply(
            &mut conv,
            Event::StreamFailed {
                stream,
                message: "connection reset".into(),
            },
        );

        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelStream { stream: s } if *s == stream)));
        let assistant = &conv.messages()[1];
        assert_eq!(assistant.content, format!("partial{ERROR_MARKER}"));
        assert_eq!(assistant.status, MessageStatus::Error);
        assert!(!assistant.loading);
        assert_eq!(conv.messages()[0].status, MessageStatus::Pending);
        assert!(!conv.is_generating());
    }

    #[test]
    fn test_close_without_done_completes() {
        let mut conv = Conversation::new();
        let stream = send(&mut conv, "q");
        apply(&mut conv, content(stream, "a"));
        apply(&mut conv, Event::StreamClosed { stream });

        assert_eq!(conv.messages()[0].status, MessageStatus::Completed);
        assert_eq!(conv.messages()[1].status, MessageStatus::Completed);
        assert!(conv.messages()[1].id.is_none());
        assert!(!conv.is_generating());
    }

    #[test]
    fn test_stale_stream_events_ignored() {
        let mut conv = Conversation::new();
        let stream = send(&mut conv, "q");
        let stale = StreamId(stream.0 + 100);
        assert!(apply(&mut conv, content(stale, "ghost")).is_empty());
        assert_eq!(conv.messages()[1].content, "");
        assert!(conv.messages()[1].loading);
    }

    #[test]
    fn test_retry_with_nothing_to_retry() {
        let mut conv = Conversation::new();
        let err = transition(&mut conv, Event::RetryLatest { params: params() }).unwrap_err();
        assert_eq!(err, TransitionError::NothingToRetry);
        assert!(conv.messages().is_empty());
        assert!(!conv.is_generating());
    }

    #[test]
    fn test_retry_replaces_answer() {
        let mut conv = completed_turn();
        let old_assistant = conv.messages()[1].local_id;

        let effects = apply(&mut conv, Event::RetryLatest { params: params() });
        let (_, request) = opened_stream(&effects);
        assert_eq!(request.kind, StreamKind::Retry);
        assert_eq!(request.path, "/chat/messages/1/retry");
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::NotifyClient(SessionUpdate::MessageRemoved { local_id }) if *local_id == old_assistant
        )));

        assert_eq!(conv.messages().len(), 2);
        assert_ne!(conv.messages()[1].local_id, old_assistant);
        assert!(conv.messages()[1].loading);
        assert_eq!(conv.messages()[0].status, MessageStatus::Generating);
    }

    #[test]
    fn test_retry_unpersisted_message_asks_again() {
        let mut conv = Conversation::new();
        let stream = send(&mut conv, "q");
        apply(
            &mut conv,
            Event::StreamFailed {
                stream,
                message: "down".into(),
            },
        );

        let effects = apply(&mut conv, Event::RetryLatest { params: params() });
        let (_, request) = opened_stream(&effects);
        assert_eq!(request.path, "/chat/stream");
        assert_eq!(request.body.unwrap()["question"], "q");
        // errored placeholder was replaced
        assert_eq!(conv.messages().len(), 2);
        assert!(!conv.messages()[1].content.contains("Error"));
    }

    #[test]
    fn test_edit_latest_turn() {
        let mut conv = completed_turn();
        let user = MessageRef::of(&conv.messages()[0]);

        let effects = apply(
            &mut conv,
            Event::Edit {
                target: user,
                content: "Hello again".into(),
                params: params(),
            },
        );
        let (_, request) = opened_stream(&effects);
        assert_eq!(request.path, "/chat/messages/1/edit");
        assert_eq!(request.body.unwrap()["newContent"], json!("Hello again"));
        assert_eq!(conv.messages().len(), 2);
        assert_eq!(conv.messages()[0].content, "Hello again");
        assert_eq!(conv.messages()[1].content, "");
    }

    #[test]
    fn test_edit_rejections_leave_state_untouched() {
        let mut conv = completed_turn();
        let first_user = MessageRef::of(&conv.messages()[0]);

        let stream = {
            let effects = apply(
                &mut conv,
                Event::Send {
                    text: "second".into(),
                    params: params(),
                },
            );
            opened_stream(&effects).0
        };
        apply(&mut conv, Event::StreamClosed { stream });
        let before = conv.messages().to_vec();

        let edit = |target: MessageRef, content: &str| Event::Edit {
            target,
            content: content.into(),
            params: params(),
        };

        assert_eq!(
            transition(&mut conv, edit(first_user, "x")).unwrap_err(),
            TransitionError::NotLatestTurn
        );
        let latest = MessageRef::of(&conv.messages()[2]);
        assert_eq!(
            transition(&mut conv, edit(latest.clone(), "  ")).unwrap_err(),
            TransitionError::EmptyContent
        );
        // closed without done: no server id
        assert_eq!(
            transition(&mut conv, edit(latest, "y")).unwrap_err(),
            TransitionError::NotPersisted
        );
        assert_eq!(
            transition(&mut conv, edit(MessageRef::local(LocalId(999)), "z")).unwrap_err(),
            TransitionError::TargetNotFound
        );
        assert_eq!(conv.messages(), before.as_slice());
    }

    #[test]
    fn test_restore_resumes_pending_user_message() {
        let mut conv = Conversation::new();
        apply(&mut conv, Event::LoadStarted);
        let history = vec![
            persisted(json!({"id": 1, "role": "user", "content": "a", "status": "completed"})),
            persisted(json!({"id": 2, "role": "assistant", "content": "b", "status": "completed",
                "ragContext": "[{\"step\":\"retrieve\",\"status\":\"done\"}]"})),
            persisted(json!({"id": 3, "role": "user", "content": "c", "status": "pending",
                "options": {"webSearch": true}})),
        ];

        let effects = apply(
            &mut conv,
            Event::Restored {
                history,
                resume: Some(params()),
            },
        );
        let (_, request) = opened_stream(&effects);
        assert_eq!(request.path, "/chat/stream");
        assert_eq!(request.body.unwrap()["question"], json!(null));

        assert_eq!(conv.messages().len(), 4);
        assert_eq!(conv.messages()[1].rag_process.len(), 1);
        assert_eq!(conv.messages()[2].status, MessageStatus::Generating);
        assert!(conv.messages()[3].loading);
        assert_eq!(conv.active_turn().unwrap().kind, TurnKind::Resume);
    }

    #[test]
    fn test_restore_without_resume_stays_idle() {
        let mut conv = Conversation::new();
        apply(&mut conv, Event::LoadStarted);
        let history = vec![persisted(
            json!({"id": 3, "role": "user", "content": "c", "status": "pending"}),
        )];
        let effects = apply(
            &mut conv,
            Event::Restored {
                history,
                resume: None,
            },
        );
        assert!(!effects.iter().any(|e| matches!(e, Effect::OpenStream { .. })));
        assert_eq!(conv.messages().len(), 1);
        assert!(!conv.is_generating());
    }

    #[test]
    fn test_load_cancels_active_stream() {
        let mut conv = Conversation::new();
        let stream = send(&mut conv, "q");
        let effects = apply(&mut conv, Event::LoadStarted);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelStream { stream: s } if *s == stream)));
        assert!(conv.messages().is_empty());
        assert!(conv.is_loading());

        // the old stream's events are now no-ops
        assert!(apply(&mut conv, content(stream, "late")).is_empty());
    }

    #[test]
    fn test_teardown_releases_stream() {
        let mut conv = Conversation::new();
        let stream = send(&mut conv, "q");
        let effects = apply(&mut conv, Event::Teardown);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelStream { stream: s } if *s == stream)));
        assert!(!conv.is_generating());
    }
}
