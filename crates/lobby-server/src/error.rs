//! Error taxonomy shared by every lobby handler.

use serde_json::Value;

/// A failed lobby request. Every variant maps to one error kind on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    /// The request line was not a well-formed message.
    #[error("malformed request: {0}")]
    Parse(String),

    /// The `Command` field named no known command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A field value was rejected.
    #[error("{0}")]
    Validation(String),

    /// The room, slot, player or session does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The request is valid but cannot be applied to the current state.
    #[error("{0}")]
    Conflict(String),

    /// A handler failed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LobbyError {
    /// Wire name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LobbyError::Parse(_) => "ParseError",
            LobbyError::UnknownCommand(_) => "UnknownCommand",
            LobbyError::Validation(_) => "ValidationError",
            LobbyError::NotFound(_) => "NotFoundError",
            LobbyError::Conflict(_) => "ConflictError",
            LobbyError::Internal(_) => "InternalError",
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        LobbyError::Validation(message.into())
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        LobbyError::NotFound(message.into())
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        LobbyError::Conflict(message.into())
    }
}

impl From<serde_json::Error> for LobbyError {
    fn from(e: serde_json::Error) -> Self {
        LobbyError::Parse(e.to_string())
    }
}

/// Render the kind of a JSON value for error messages.
pub(crate) fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Result alias for lobby operations.
pub type LobbyResult<T> = Result<T, LobbyError>;
