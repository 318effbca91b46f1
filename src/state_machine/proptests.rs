//! Property-based tests for the state machine
//!
//! These tests drive conversations through arbitrary event sequences and
//! check the transcript invariants after every step.

#![allow(clippy::single_match_else)]

use super::state::*;
use super::transition::*;
use super::*;
use crate::api::RemoteId;
use crate::stream::{ProcessStep, StreamEvent, UsageStats};
use crate::transport::StreamId;
use proptest::prelude::*;
use std::collections::HashSet;

// ============================================================================
// Test Helpers
// ============================================================================

fn params() -> GenerationParams {
    GenerationParams {
        session_id: RemoteId::Number(1),
        model_id: Some(RemoteId::Number(2)),
        kb_id: None,
        options: GenerationOptions::default(),
    }
}

fn begin(conv: &mut Conversation, text: &str) -> StreamId {
    let result = transition(
        conv,
        Event::Send {
            text: text.to_string(),
            params: params(),
        },
    )
    .expect("send from idle");
    result
        .effects
        .iter()
        .find_map(|e| match e {
            Effect::OpenStream { stream, .. } => Some(*stream),
            _ => None,
        })
        .expect("stream opened")
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

/// What happens next in a session, relative to whatever stream is current
#[derive(Debug, Clone)]
enum Step {
    Send(String),
    Content(String),
    Thinking(String),
    Process(String, String),
    Done,
    Usage(u64),
    Fail,
    Close,
    /// Event for a stream that was never opened
    Stale(String),
    RetryLatest,
    EditLatest(String),
}

fn arb_text() -> impl Strategy<Value = String> {
    "[a-zA-Z ]{0,12}"
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        arb_text().prop_map(Step::Send),
        arb_text().prop_map(Step::Content),
        arb_text().prop_map(Step::Thinking),
        ("(retrieve|rerank|generate)", "(start|done)")
            .prop_map(|(s, st)| Step::Process(s, st)),
        Just(Step::Done),
        (1u64..10_000).prop_map(Step::Usage),
        Just(Step::Fail),
        Just(Step::Close),
        arb_text().prop_map(Step::Stale),
        Just(Step::RetryLatest),
        arb_text().prop_map(Step::EditLatest),
    ]
}

struct Driver {
    conv: Conversation,
    /// Stream of the latest turn, active or settled
    current: Option<StreamId>,
    next_remote: i64,
}

impl Driver {
    fn new() -> Self {
        Self {
            conv: Conversation::new(),
            current: None,
            next_remote: 1,
        }
    }

    fn stream_of(result: &TransitionResult) -> Option<StreamId> {
        result.effects.iter().find_map(|e| match e {
            Effect::OpenStream { stream, .. } => Some(*stream),
            _ => None,
        })
    }

    fn apply(&mut self, step: &Step) -> Result<TransitionResult, TransitionError> {
        let stream = self.current.unwrap_or(StreamId(0));
        let event = match step {
            Step::Send(text) => Event::Send {
                text: text.clone(),
                params: params(),
            },
            Step::Content(text) => Event::Stream {
                stream,
                event: StreamEvent::Content { text: text.clone() },
            },
            Step::Thinking(text) => Event::Stream {
                stream,
                event: StreamEvent::Thinking { text: text.clone() },
            },
            Step::Process(name, status) => Event::Stream {
                stream,
                event: StreamEvent::Process(ProcessStep::new(name.clone(), status.clone())),
            },
            Step::Done => {
                let user = self.next_remote;
                self.next_remote += 2;
                Event::Stream {
                    stream,
                    event: StreamEvent::Done {
                        user_message_id: Some(RemoteId::Number(user)),
                        assistant_message_id: Some(RemoteId::Number(user + 1)),
                    },
                }
            }
            Step::Usage(latency) => Event::Stream {
                stream,
                event: StreamEvent::Usage(UsageStats {
                    latency_ms: Some(*latency),
                    ..UsageStats::default()
                }),
            },
            Step::Fail => Event::StreamFailed {
                stream,
                message: "boom".to_string(),
            },
            Step::Close => Event::StreamClosed { stream },
            Step::Stale(text) => Event::Stream {
                stream: StreamId(u64::MAX),
                event: StreamEvent::Content { text: text.clone() },
            },
            Step::RetryLatest => Event::RetryLatest { params: params() },
            Step::EditLatest(text) => Event::Edit {
                target: self
                    .conv
                    .last_user_message()
                    .map(MessageRef::of)
                    .unwrap_or_default(),
                content: text.clone(),
                params: params(),
            },
        };

        let result = transition(&mut self.conv, event)?;
        if let Some(stream) = Self::stream_of(&result) {
            self.current = Some(stream);
        }
        Ok(result)
    }
}

fn check_invariants(conv: &Conversation) -> Result<(), TestCaseError> {
    let generating: Vec<&Message> = conv
        .messages()
        .iter()
        .filter(|m| m.role == Role::Assistant && m.status == MessageStatus::Generating)
        .collect();
    prop_assert!(generating.len() <= 1, "more than one generating answer");

    let local_ids: HashSet<LocalId> = conv.messages().iter().map(|m| m.local_id).collect();
    prop_assert_eq!(local_ids.len(), conv.messages().len(), "duplicate local ids");

    for msg in conv.messages() {
        let keys: HashSet<(&str, &str)> = msg.rag_process.iter().map(ProcessStep::key).collect();
        prop_assert_eq!(keys.len(), msg.rag_process.len(), "duplicate process step");
    }

    match conv.active_turn() {
        Some(turn) => {
            let user = conv.get(turn.user);
            let assistant = conv.get(turn.assistant);
            prop_assert!(user.is_some_and(|m| m.role == Role::User));
            prop_assert!(assistant.is_some_and(|m| m.role == Role::Assistant));
            prop_assert_eq!(conv.messages().last().map(|m| m.local_id), Some(turn.assistant));
        }
        None => {
            prop_assert!(generating.is_empty(), "generating answer without a turn");
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Invariants hold after every event, and rejected events change nothing
    #[test]
    fn prop_invariants_hold(steps in proptest::collection::vec(arb_step(), 1..40)) {
        let mut driver = Driver::new();
        for step in &steps {
            let before = driver.conv.messages().to_vec();
            let generation = driver.conv.generation();
            if driver.apply(step).is_err() {
                prop_assert_eq!(driver.conv.messages(), before.as_slice());
                prop_assert_eq!(driver.conv.generation(), generation);
            }
            check_invariants(&driver.conv)?;
        }
    }

    /// The answer is exactly the concatenation of its content fragments
    #[test]
    fn prop_content_is_concatenation(fragments in proptest::collection::vec(arb_text(), 0..20)) {
        let mut conv = Conversation::new();
        let stream = begin(&mut conv, "question");
        for fragment in &fragments {
            transition(&mut conv, Event::Stream {
                stream,
                event: StreamEvent::Content { text: fragment.clone() },
            }).unwrap();
        }
        prop_assert_eq!(&conv.messages()[1].content, &fragments.concat());
    }

    /// Events for streams other than the active one never touch the transcript
    #[test]
    fn prop_stale_streams_ignored(texts in proptest::collection::vec(arb_text(), 1..10)) {
        let mut conv = Conversation::new();
        let stream = begin(&mut conv, "question");
        let before = conv.messages().to_vec();
        for text in texts {
            let result = transition(&mut conv, Event::Stream {
                stream: StreamId(stream.0 + 1),
                event: StreamEvent::Content { text },
            }).unwrap();
            prop_assert!(result.effects.is_empty());
        }
        prop_assert_eq!(conv.messages(), before.as_slice());
    }

    /// Repeated edits of the latest turn keep exactly one answer after it
    #[test]
    fn prop_edit_keeps_pair_count(edits in proptest::collection::vec("[a-z]{1,8}", 1..6)) {
        let mut conv = Conversation::new();
        let mut stream = begin(&mut conv, "first");
        let mut remote = 1;
        for edit in edits {
            transition(&mut conv, Event::Stream {
                stream,
                event: StreamEvent::Done {
                    user_message_id: Some(RemoteId::Number(remote)),
                    assistant_message_id: Some(RemoteId::Number(remote + 1)),
                },
            }).unwrap();
            remote += 2;

            let target = MessageRef::of(conv.last_user_message().unwrap());
            let result = transition(&mut conv, Event::Edit {
                target,
                content: edit.clone(),
                params: params(),
            }).unwrap();
            stream = Driver::stream_of(&result).unwrap();

            prop_assert_eq!(conv.messages().len(), 2);
            prop_assert_eq!(&conv.messages()[0].content, &edit);
        }
    }
}
