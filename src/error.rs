//! Error types for rowwire-client.
//!
//! Errors are `Clone`: a single rejection reason is delivered to every
//! listener waiting on a chunk, so sources that are not `Clone` themselves
//! are kept behind an `Arc`.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for all decoding operations.
#[derive(Debug, Clone, Error)]
pub enum RowwireError {
    /// I/O error reported by the transport.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Malformed JSON in a row payload.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// Protocol violation (malformed framing, pre-split text rows, binary
    /// rows in text mode). Always fatal to the whole session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error row sent by the producer for a specific id.
    #[error("{0}")]
    Remote(Arc<RemoteError>),

    /// The transport ended before every referenced row arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A module reference names a module missing from the module map.
    #[error("Could not find the module \"{0}\" in the module map")]
    ModuleNotFound(String),

    /// A module reference names an export missing from its module entry.
    #[error("Could not find the export \"{export}\" in module \"{module}\"")]
    ExportNotFound { module: String, export: String },

    /// `require` was called for a module that was never preloaded.
    #[error("Module \"{0}\" must be preloaded before use")]
    ModuleNotPreloaded(String),

    /// The module loader failed to load or evaluate a module.
    #[error("Failed to load module: {0}")]
    ModuleLoad(String),

    /// A remote-procedure id is missing from the server map.
    #[error("Could not find the server reference \"{0}\"")]
    ServerReferenceNotFound(String),

    /// A builder received a value it cannot materialize.
    #[error("Unsupported value: {0}")]
    Unsupported(String),

    /// A temporary reference arrived but no set was supplied.
    #[error("Missing a temporary reference set but the stream returned a temporary reference")]
    MissingTemporaryReferences,

    /// A remote procedure was invoked without an `on_remote_call` callback.
    #[error("No remote call handler configured for \"{0}\"")]
    MissingRemoteCall(String),

    /// The chunk was halted: the producer will never send its value.
    #[error("Value was intentionally left incomplete")]
    Incomplete,

    /// The session owning a lazily materialized value has been torn down.
    #[error("Session has been released")]
    SessionReleased,
}

impl From<std::io::Error> for RowwireError {
    fn from(err: std::io::Error) -> Self {
        RowwireError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for RowwireError {
    fn from(err: serde_json::Error) -> Self {
        RowwireError::Json(Arc::new(err))
    }
}

impl From<RemoteError> for RowwireError {
    fn from(err: RemoteError) -> Self {
        RowwireError::Remote(Arc::new(err))
    }
}

/// Result type alias using RowwireError.
pub type Result<T> = std::result::Result<T, RowwireError>;

/// Message used when an error row carries no message of its own.
pub const DEFAULT_REMOTE_MESSAGE: &str =
    "An error occurred on the server but no message was provided";

/// Error descriptor produced by the server side of the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteError {
    /// Human-readable message.
    pub message: String,
    /// Error class name, when sent.
    pub name: Option<String>,
    /// Opaque digest that correlates with server-side logs.
    pub digest: Option<String>,
    /// Server-side stack text, when sent.
    pub stack: Option<String>,
    /// Label of the environment the error was raised in.
    pub environment: Option<String>,
}

impl RemoteError {
    /// Create an error descriptor with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Build a descriptor from the JSON object of an error row.
    ///
    /// Missing or non-string fields are treated as absent.
    pub fn from_json(info: &serde_json::Value) -> Self {
        let field = |key: &str| info.get(key).and_then(|v| v.as_str()).map(str::to_string);
        Self {
            message: field("message").unwrap_or_else(|| DEFAULT_REMOTE_MESSAGE.to_string()),
            name: field("name"),
            digest: field("digest"),
            stack: field("stack"),
            environment: field("env"),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message)?,
            None => f.write_str(&self.message)?,
        }
        if let Some(digest) = &self.digest {
            write!(f, " (digest: {})", digest)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_from_json() {
        let info = serde_json::json!({
            "message": "boom",
            "digest": "abc123",
            "env": "Server"
        });
        let err = RemoteError::from_json(&info);

        assert_eq!(err.message, "boom");
        assert_eq!(err.digest.as_deref(), Some("abc123"));
        assert_eq!(err.environment.as_deref(), Some("Server"));
        assert!(err.name.is_none());
    }

    #[test]
    fn test_remote_error_default_message() {
        let err = RemoteError::from_json(&serde_json::json!({ "digest": "d" }));
        assert_eq!(err.message, DEFAULT_REMOTE_MESSAGE);
    }

    #[test]
    fn test_display_includes_digest() {
        let err = RowwireError::from(RemoteError {
            message: "bad".to_string(),
            name: Some("TypeError".to_string()),
            digest: Some("42".to_string()),
            ..RemoteError::default()
        });
        assert_eq!(err.to_string(), "TypeError: bad (digest: 42)");
    }

    #[test]
    fn test_io_error_is_clone() {
        let err: RowwireError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        let cloned = err.clone();
        assert!(cloned.to_string().contains("gone"));
    }
}
