/// Unified error types for the Tubewatch system.
use thiserror::Error;

/// Top-level error type for the Tubewatch system.
#[derive(Debug, Error)]
pub enum TubewatchError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while turning a download link into job identifiers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("Invalid link URL '{href}': {reason}")]
    InvalidUrl { href: String, reason: String },

    #[error("Link is missing the '{0}' parameter")]
    MissingParam(&'static str),

    #[error("Invalid video id '{0}'")]
    InvalidVideoId(String),

    #[error("Invalid itag '{0}'")]
    InvalidItag(String),

    #[error("Unknown media type '{0}'")]
    UnknownMediaType(String),
}

/// Errors from the progress stream transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Server answered with HTTP {0}")]
    Status(u16),

    #[error("Unexpected content type '{0}', expected text/event-stream")]
    ContentType(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Stream ended")]
    Eof,
}

impl TransportError {
    /// Whether the transport should give up instead of reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Status(_) | TransportError::ContentType(_))
    }
}

/// Result type alias for Tubewatch operations.
pub type TubewatchResult<T> = Result<T, TubewatchError>;
