//! Protocol error types.

use thiserror::Error;

/// Errors raised while decoding or encoding wire messages.
///
/// None of these are fatal to a connection: the offending frame is
/// dropped and the session continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("unknown message type: {0:?}")]
    UnknownType(String),

    #[error("{message_type} is missing required field `{field}`")]
    MissingField {
        message_type: String,
        field: &'static str,
    },

    #[error("failed to encode message: {0}")]
    Encode(String),
}
