//! Error types for the wire protocol

use thiserror::Error;

/// Result type alias using [`ProtocolError`]
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while framing or interpreting peer messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Transport I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A field value could not be parsed as JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame line does not follow the `key: value` layout
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// The `command` field names no known message
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A field required by the command is absent or has the wrong type
    #[error("Missing or invalid field '{field}' in '{command}'")]
    MissingField {
        /// Command being decoded
        command: String,
        /// Offending field
        field: String,
    },

    /// Frame exceeded the configured size limit
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

impl ProtocolError {
    /// Create a malformed-frame error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a missing-field error
    pub fn missing(command: &str, field: &str) -> Self {
        Self::MissingField {
            command: command.to_string(),
            field: field.to_string(),
        }
    }
}
