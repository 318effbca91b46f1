//! Session runtime errors

use crate::api::{ApiError, KbId, ModelId};
use crate::state_machine::TransitionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("No session is open")]
    NoSession,

    #[error("Unknown model: {0}")]
    UnknownModel(ModelId),

    #[error("Unknown knowledge base: {0}")]
    UnknownKnowledgeBase(KbId),

    #[error("Session runtime has stopped")]
    ChannelClosed,
}

impl SessionError {
    /// The request was refused without changing anything
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::Transition(_)
                | Self::NoSession
                | Self::UnknownModel(_)
                | Self::UnknownKnowledgeBase(_)
        )
    }
}
