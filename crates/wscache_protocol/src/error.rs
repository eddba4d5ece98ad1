//! Classified errors returned by repository clients.

use thiserror::Error;

/// Result type for repository client requests.
pub type ClientResult<T> = Result<T, ClientError>;

/// Category of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientErrorKind {
    /// The server could not be reached or the connection dropped.
    Connection,
    /// The requested instance or file does not exist.
    NotFound,
    /// The caller lacks permission.
    Forbidden,
    /// The write conflicts with the server state.
    Conflict,
    /// The server refused the request as malformed.
    BadRequest,
    /// The server failed while processing the request.
    Server,
    /// The request was canceled before completion.
    Canceled,
}

/// A failed repository request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct ClientError {
    /// Error category.
    pub kind: ClientErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl ClientError {
    /// Creates an error.
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Connection, message)
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::NotFound, message)
    }

    /// Creates a forbidden error.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Forbidden, message)
    }

    /// Creates a canceled error.
    pub fn canceled() -> Self {
        Self::new(ClientErrorKind::Canceled, "request canceled")
    }

    /// Returns true if the server refused this particular request.
    ///
    /// Refusals concern only the entities in the request; the connection and
    /// the rest of the batch are unaffected.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self.kind,
            ClientErrorKind::NotFound
                | ClientErrorKind::Forbidden
                | ClientErrorKind::Conflict
                | ClientErrorKind::BadRequest
        )
    }

    /// Returns true if the server answered, whatever the answer.
    pub fn is_server_response(&self) -> bool {
        !matches!(
            self.kind,
            ClientErrorKind::Connection | ClientErrorKind::Canceled
        )
    }

    /// Returns true if the request was canceled.
    pub fn is_canceled(&self) -> bool {
        self.kind == ClientErrorKind::Canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ClientError::not_found("x").is_rejected());
        assert!(ClientError::forbidden("x").is_rejected());
        assert!(!ClientError::connection("x").is_rejected());
        assert!(!ClientError::new(ClientErrorKind::Server, "x").is_rejected());

        assert!(ClientError::new(ClientErrorKind::Server, "x").is_server_response());
        assert!(!ClientError::connection("x").is_server_response());
        assert!(!ClientError::canceled().is_server_response());
        assert!(ClientError::canceled().is_canceled());
    }

    #[test]
    fn error_display() {
        let err = ClientError::not_found("instance A");
        assert_eq!(err.to_string(), "NotFound: instance A");
    }
}
