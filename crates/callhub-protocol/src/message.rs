//! Protocol message types for client/relay communication.

use callhub_core::{CallId, Username};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

// ============================================================================
// Message type names
// ============================================================================

pub const TYPE_CALL_REQUEST: &str = "call_request";
pub const TYPE_CALL_END: &str = "call_end";
pub const TYPE_PRESENCE: &str = "presence";
pub const TYPE_INCOMING_CALL: &str = "incoming_call";
pub const TYPE_BUSY: &str = "busy";
pub const TYPE_CALL_ENDED: &str = "call_ended";

// ============================================================================
// Envelope (flat wire record)
// ============================================================================

/// A single wire record, used in both directions.
///
/// Only `type` is mandatory on the wire. Which of the other fields matter
/// depends on the type; unknown extra fields are ignored on input and absent
/// fields are omitted on output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message discriminator
    #[serde(rename = "type")]
    pub kind: String,

    /// Addressee
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Username>,

    /// Originator, always stamped by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Username>,

    /// Call the message belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,

    /// Free-form payload (SDP, ICE candidate, presence details...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    fn typed(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Self::default()
        }
    }

    /// Returns `to`, treating a blank username as absent.
    fn require_to(&self) -> Result<Username, ProtocolError> {
        self.to
            .as_ref()
            .and_then(|to| Username::parse(to.as_str()).ok())
            .ok_or_else(|| self.missing("to"))
    }

    /// Returns `call_id`, treating an empty ID as absent.
    fn require_call_id(&self) -> Result<CallId, ProtocolError> {
        self.call_id
            .as_ref()
            .and_then(|id| CallId::parse(id.as_str()).ok())
            .ok_or_else(|| self.missing("call_id"))
    }

    fn missing(&self, field: &'static str) -> ProtocolError {
        ProtocolError::MissingField {
            message_type: self.kind.clone(),
            field,
        }
    }
}

// ============================================================================
// Relay kinds
// ============================================================================

/// Message types the relay forwards verbatim to their addressee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayKind {
    CallAccept,
    CallReject,
    SdpOffer,
    SdpAnswer,
    IceCandidate,
}

impl RelayKind {
    /// All relay kinds, in protocol order.
    pub const ALL: [RelayKind; 5] = [
        RelayKind::CallAccept,
        RelayKind::CallReject,
        RelayKind::SdpOffer,
        RelayKind::SdpAnswer,
        RelayKind::IceCandidate,
    ];

    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CallAccept => "call_accept",
            Self::CallReject => "call_reject",
            Self::SdpOffer => "sdp_offer",
            Self::SdpAnswer => "sdp_answer",
            Self::IceCandidate => "ice_candidate",
        }
    }

    /// Looks up a relay kind by wire name.
    pub fn from_type(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl std::fmt::Display for RelayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Client -> relay
// ============================================================================

/// A negotiation message forwarded without interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    pub kind: RelayKind,
    pub to: Username,
    pub call_id: Option<CallId>,
    pub data: Option<serde_json::Value>,
}

/// Messages a client may send to the relay.
///
/// Any sender-supplied `from` is discarded during conversion: routing
/// always uses the identity the connection registered with.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Ring `to`, reserving both parties under `call_id`
    CallRequest { to: Username, call_id: CallId },

    /// Accept/reject/SDP/ICE, forwarded to `to`
    Relay(RelayMessage),

    /// Hang up `call_id` for everyone in it
    CallEnd { call_id: CallId },
}

impl ClientMessage {
    /// Wire name of this message's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CallRequest { .. } => TYPE_CALL_REQUEST,
            Self::Relay(relay) => relay.kind.as_str(),
            Self::CallEnd { .. } => TYPE_CALL_END,
        }
    }

    /// Creates a call request.
    pub fn call_request(to: impl Into<Username>, call_id: impl Into<CallId>) -> Self {
        Self::CallRequest {
            to: to.into(),
            call_id: call_id.into(),
        }
    }

    /// Creates a relayed message with a payload.
    pub fn relay(kind: RelayKind, to: impl Into<Username>, data: Option<serde_json::Value>) -> Self {
        Self::Relay(RelayMessage {
            kind,
            to: to.into(),
            call_id: None,
            data,
        })
    }

    /// Creates a call end message.
    pub fn call_end(call_id: impl Into<CallId>) -> Self {
        Self::CallEnd {
            call_id: call_id.into(),
        }
    }
}

impl TryFrom<Envelope> for ClientMessage {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope.kind.as_str() {
            TYPE_CALL_REQUEST => Ok(Self::CallRequest {
                to: envelope.require_to()?,
                call_id: envelope.require_call_id()?,
            }),
            TYPE_CALL_END => Ok(Self::CallEnd {
                call_id: envelope.require_call_id()?,
            }),
            other => match RelayKind::from_type(other) {
                Some(kind) => {
                    let to = envelope.require_to()?;
                    Ok(Self::Relay(RelayMessage {
                        kind,
                        to,
                        call_id: envelope.call_id,
                        data: envelope.data,
                    }))
                }
                None => Err(ProtocolError::UnknownType(envelope.kind)),
            },
        }
    }
}

// ============================================================================
// Relay -> client
// ============================================================================

/// Messages the relay sends to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `user` came online or went offline
    Presence { user: Username, online: bool },

    /// Someone is calling the recipient
    IncomingCall { from: Username, call_id: CallId },

    /// The callee of the recipient's call request is already engaged
    Busy { to: Username },

    /// A negotiation message from another client
    Relay {
        kind: RelayKind,
        from: Username,
        to: Username,
        call_id: Option<CallId>,
        data: Option<serde_json::Value>,
    },

    /// `call_id` was hung up
    CallEnded { call_id: CallId },
}

impl ServerMessage {
    /// Creates a presence notification.
    pub fn presence(user: Username, online: bool) -> Self {
        Self::Presence { user, online }
    }

    /// Creates an incoming call notification.
    pub fn incoming_call(from: Username, call_id: CallId) -> Self {
        Self::IncomingCall { from, call_id }
    }

    /// Creates a busy reply addressed to the requester.
    pub fn busy(to: Username) -> Self {
        Self::Busy { to }
    }

    /// Stamps a client's relay message with its sender.
    pub fn relayed(from: Username, relay: RelayMessage) -> Self {
        Self::Relay {
            kind: relay.kind,
            from,
            to: relay.to,
            call_id: relay.call_id,
            data: relay.data,
        }
    }

    /// Creates a call ended broadcast.
    pub fn call_ended(call_id: CallId) -> Self {
        Self::CallEnded { call_id }
    }

    /// Wire name of this message's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Presence { .. } => TYPE_PRESENCE,
            Self::IncomingCall { .. } => TYPE_INCOMING_CALL,
            Self::Busy { .. } => TYPE_BUSY,
            Self::Relay { kind, .. } => kind.as_str(),
            Self::CallEnded { .. } => TYPE_CALL_ENDED,
        }
    }
}

impl From<ServerMessage> for Envelope {
    fn from(msg: ServerMessage) -> Self {
        let mut envelope = Envelope::typed(msg.type_name());
        match msg {
            ServerMessage::Presence { user, online } => {
                envelope.data = Some(serde_json::json!({
                    "user": user,
                    "online": online,
                }));
            }
            ServerMessage::IncomingCall { from, call_id } => {
                envelope.from = Some(from);
                envelope.call_id = Some(call_id);
            }
            ServerMessage::Busy { to } => {
                envelope.to = Some(to);
            }
            ServerMessage::Relay {
                from,
                to,
                call_id,
                data,
                ..
            } => {
                envelope.to = Some(to);
                envelope.from = Some(from);
                envelope.call_id = call_id;
                envelope.data = data;
            }
            ServerMessage::CallEnded { call_id } => {
                envelope.call_id = Some(call_id);
            }
        }
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(json: serde_json::Value) -> Envelope {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_call_request_requires_to_and_call_id() {
        let msg = ClientMessage::try_from(envelope(serde_json::json!({
            "type": "call_request", "to": "bob", "call_id": "c1"
        })))
        .unwrap();
        assert_eq!(msg, ClientMessage::call_request("bob", "c1"));

        let err = ClientMessage::try_from(envelope(serde_json::json!({
            "type": "call_request", "to": "bob"
        })))
        .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MissingField {
                message_type: "call_request".to_string(),
                field: "call_id"
            }
        );
    }

    #[test]
    fn test_empty_fields_count_as_missing() {
        let err = ClientMessage::try_from(envelope(serde_json::json!({
            "type": "sdp_offer", "to": ""
        })))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { field: "to", .. }));

        let err = ClientMessage::try_from(envelope(serde_json::json!({
            "type": "call_request", "to": "   ", "call_id": "c1"
        })))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { field: "to", .. }));

        let err = ClientMessage::try_from(envelope(serde_json::json!({
            "type": "call_end", "call_id": ""
        })))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { field: "call_id", .. }));
    }

    #[test]
    fn test_relay_keeps_payload_and_ignores_sender_from() {
        let msg = ClientMessage::try_from(envelope(serde_json::json!({
            "type": "ice_candidate",
            "to": "bob",
            "from": "mallory",
            "call_id": "c1",
            "data": {"candidate": "candidate:1 1 udp 2122260223 10.0.0.1 54321 typ host"}
        })))
        .unwrap();

        match msg {
            ClientMessage::Relay(relay) => {
                assert_eq!(relay.kind, RelayKind::IceCandidate);
                assert_eq!(relay.to.as_str(), "bob");
                assert_eq!(relay.call_id, Some(CallId::new("c1")));
                assert!(relay.data.unwrap()["candidate"].is_string());
            }
            other => panic!("Expected Relay, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = ClientMessage::try_from(envelope(serde_json::json!({"type": "presence"})))
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("presence".to_string()));
    }

    #[test]
    fn test_relay_kind_names() {
        for kind in RelayKind::ALL {
            assert_eq!(RelayKind::from_type(kind.as_str()), Some(kind));
        }
        assert_eq!(RelayKind::from_type("call_request"), None);
    }

    #[test]
    fn test_presence_envelope_shape() {
        let env = Envelope::from(ServerMessage::presence(Username::new("alice"), false));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "presence", "data": {"user": "alice", "online": false}})
        );
    }

    #[test]
    fn test_busy_and_call_ended_shapes() {
        let busy = serde_json::to_value(Envelope::from(ServerMessage::busy(Username::new("alice"))))
            .unwrap();
        assert_eq!(busy, serde_json::json!({"type": "busy", "to": "alice"}));

        let ended =
            serde_json::to_value(Envelope::from(ServerMessage::call_ended(CallId::new("x"))))
                .unwrap();
        assert_eq!(ended, serde_json::json!({"type": "call_ended", "call_id": "x"}));
    }

    #[test]
    fn test_relayed_message_is_stamped() {
        let relay = RelayMessage {
            kind: RelayKind::SdpAnswer,
            to: Username::new("alice"),
            call_id: None,
            data: Some(serde_json::json!({"sdp": "v=0"})),
        };
        let env = Envelope::from(ServerMessage::relayed(Username::new("bob"), relay));
        assert_eq!(env.kind, "sdp_answer");
        assert_eq!(env.from, Some(Username::new("bob")));
        assert_eq!(env.to, Some(Username::new("alice")));
        assert!(env.call_id.is_none());
    }
}
