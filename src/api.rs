//! REST collaborator
//!
//! Plain request/response operations the session engine calls into:
//! model and knowledge-base catalogs, message history, session listing.

mod client;
mod error;
mod types;

pub use client::HttpChatApi;
pub use error::ApiError;
pub use types::*;
