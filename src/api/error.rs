//! REST error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Envelope with a non-success `code`
    #[error("server rejected request ({code}): {message}")]
    Business { code: i64, message: String },

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status == 401 || *status == 403,
            ApiError::Business { code, .. } => *code == 401 || *code == 403,
            ApiError::Http(e) => e
                .status()
                .is_some_and(|s| s.as_u16() == 401 || s.as_u16() == 403),
            ApiError::Decode(_) => false,
        }
    }
}
