//! Core conversation state machine
//!
//! Implements the Elm Architecture pattern: typed events are folded into the
//! transcript by [`transition`], which returns the effects the runtime must
//! carry out.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{Effect, SessionUpdate};
pub use event::Event;
pub use state::{
    ActiveTurn, Conversation, GenerationOptions, GenerationParams,
    GenerationState, LocalId, Message, MessageRef, MessageStatus, Role, ThinkingPanel, TurnKind,
};
pub use transition::{transition, TransitionError, TransitionResult, ERROR_MARKER};
