//! Error types for relay-agent

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Persist failed: {0}")]
    Persist(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

/// Where an error falls in the handling taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad syntax, URL or prefix. Reply to the user, no state change.
    Validation,
    /// Durable write failed. Cache keeps its previous value.
    Persistence,
    /// Send or HTTP failure. Logged and counted, never retried.
    Transport,
    /// Scan or query failure. Aborts the current pass only.
    ExternalStore,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Persist(_) | Error::Io(_) | Error::Json(_) => ErrorKind::Persistence,
            Error::Http(_) | Error::Transport(_) => ErrorKind::Transport,
            Error::Sqlite(_) | Error::Store(_) | Error::Decode(_) => ErrorKind::ExternalStore,
            Error::Config(_) | Error::InvalidState { .. } => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Validation("prefix must not be empty".to_string());
        assert!(err.to_string().contains("prefix must not be empty"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Transport("send".into()).kind(), ErrorKind::Transport);
        assert_eq!(Error::Store("locked".into()).kind(), ErrorKind::ExternalStore);
        assert_eq!(Error::Persist("disk full".into()).kind(), ErrorKind::Persistence);
        assert_eq!(Error::Validation("bad url".into()).kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_invalid_state_display() {
        let err = Error::InvalidState {
            expected: "Stopped".to_string(),
            actual: "Running".to_string(),
        };
        assert!(err.to_string().contains("Stopped"));
        assert!(err.to_string().contains("Running"));
    }
}
