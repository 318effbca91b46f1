//! RAG chat client
//!
//! Streaming chat session engine for a retrieval-augmented-generation
//! backend. A session opens one server-sent-event connection per
//! generation, interprets the tagged payloads it carries, and folds them
//! into a transcript through an explicit state machine.

pub mod api;
pub mod config;
pub mod runtime;
pub mod state_machine;
pub mod stream;
pub mod transport;
