//! Runtime for driving a chat session
//!
//! Owns the conversation state machine and executes its effects against a
//! REST backend and a streaming transport. All mutation happens on one
//! task; commands and transport events are interleaved by a single
//! `select!` loop.

mod error;
mod executor;
mod selection;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use error::SessionError;
pub use executor::{Command, SessionHandle, SessionRuntime};
pub use selection::{Selection, WEB_SEARCH};
pub use traits::*;

use crate::api::HttpChatApi;
use crate::transport::HttpTransport;

/// Type alias for production runtime with concrete implementations
pub type ProductionRuntime = SessionRuntime<HttpChatApi, HttpTransport>;
