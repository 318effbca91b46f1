//! Transport error types

use thiserror::Error;

/// Stream failure with classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    /// HTTP status when the failure came from a response
    pub status: Option<u16>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    /// Classify a non-2xx response
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 => TransportErrorKind::Unauthorized,
            403 => TransportErrorKind::Forbidden,
            500..=599 => TransportErrorKind::ServerError,
            _ => TransportErrorKind::BadStatus,
        };
        let body = body.trim();
        let message = if body.is_empty() {
            format!("Failed to connect: {status}")
        } else {
            format!("Failed to connect: {status}: {body}")
        };
        Self {
            kind,
            message,
            status: Some(status),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connect failure or body read failure
    Network,
    /// 401; the session cannot continue without new credentials
    Unauthorized,
    /// 403; retrying with the same credentials will not help
    Forbidden,
    /// 5xx
    ServerError,
    /// Any other non-2xx
    BadStatus,
}

impl TransportErrorKind {
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::Unauthorized | Self::Forbidden)
    }
}
