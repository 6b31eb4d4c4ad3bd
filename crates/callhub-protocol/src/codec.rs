//! Text frame encoding and decoding.

use crate::error::ProtocolError;
use crate::message::{ClientMessage, Envelope, ServerMessage};

/// Default upper bound on a single inbound frame (64 KiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Decodes one inbound text frame into a validated client message.
///
/// Frames larger than `max_bytes` are rejected before parsing.
pub fn decode_client(text: &str, max_bytes: usize) -> Result<ClientMessage, ProtocolError> {
    if text.len() > max_bytes {
        return Err(ProtocolError::MessageTooLarge {
            size: text.len(),
            max: max_bytes,
        });
    }

    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    ClientMessage::try_from(envelope)
}

/// Encodes an outbound message as a JSON text frame.
pub fn encode_server(msg: ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(&Envelope::from(msg)).map_err(|e| ProtocolError::Encode(e.to_string()))
}
