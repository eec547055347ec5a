//! Notifier-specific error types

use thiserror::Error;

/// Result type alias for notifier operations
pub type NotifierResult<T> = std::result::Result<T, NotifierError>;

/// Notifier error type
#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("Sink delivery failed: {0}")]
    Sink(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
