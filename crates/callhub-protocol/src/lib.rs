//! callhub Protocol - Wire format for signaling messages
//!
//! Every frame on the WebSocket is one flat JSON record
//! (`{type, to?, from?, call_id?, data?}`), modelled here as [`Envelope`].
//! Inbound envelopes are validated into the closed [`ClientMessage`] union;
//! everything the relay emits is a [`ServerMessage`].

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{decode_client, encode_server, DEFAULT_MAX_MESSAGE_BYTES};
pub use error::ProtocolError;
pub use message::{ClientMessage, Envelope, RelayKind, RelayMessage, ServerMessage};
