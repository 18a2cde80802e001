//! Signaling wire format.
//!
//! JSON objects tagged by `event`, one per WebSocket text frame. Payloads
//! are opaque to the relay: it routes on `roomId` and forwards the rest
//! verbatim.

use crate::peer::types::IceCandidate;
use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    // ── Client → Relay ───────────────────────────────────────────────────

    JoinCallRoom {
        room_id: String,
        user_id: String,
    },

    LeaveCallRoom {
        room_id: String,
    },

    // ── Relayed between room members ─────────────────────────────────────

    WebrtcOffer {
        sdp: RTCSessionDescription,
        room_id: String,
    },

    WebrtcAnswer {
        sdp: RTCSessionDescription,
        room_id: String,
    },

    WebrtcIceCandidate {
        candidate: IceCandidate,
        room_id: String,
    },

    // ── Relay → Client ───────────────────────────────────────────────────

    /// Sent to a joiner: user ids already in the room.
    RoomMembers {
        room_id: String,
        members: Vec<String>,
    },

    PeerJoined {
        room_id: String,
        user_id: String,
    },

    PeerLeft {
        room_id: String,
        user_id: String,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        message: String,
    },
}

impl SignalMessage {
    /// Room the message belongs to; `None` only for relay errors not tied
    /// to a room.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            SignalMessage::JoinCallRoom { room_id, .. }
            | SignalMessage::LeaveCallRoom { room_id }
            | SignalMessage::WebrtcOffer { room_id, .. }
            | SignalMessage::WebrtcAnswer { room_id, .. }
            | SignalMessage::WebrtcIceCandidate { room_id, .. }
            | SignalMessage::RoomMembers { room_id, .. }
            | SignalMessage::PeerJoined { room_id, .. }
            | SignalMessage::PeerLeft { room_id, .. } => Some(room_id),
            SignalMessage::Error { room_id, .. } => room_id.as_deref(),
        }
    }

    /// Offer, answer and candidate messages, the ones the relay forwards.
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            SignalMessage::WebrtcOffer { .. }
                | SignalMessage::WebrtcAnswer { .. }
                | SignalMessage::WebrtcIceCandidate { .. }
        )
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            SignalMessage::JoinCallRoom { .. } => "join-call-room",
            SignalMessage::LeaveCallRoom { .. } => "leave-call-room",
            SignalMessage::WebrtcOffer { .. } => "webrtc-offer",
            SignalMessage::WebrtcAnswer { .. } => "webrtc-answer",
            SignalMessage::WebrtcIceCandidate { .. } => "webrtc-ice-candidate",
            SignalMessage::RoomMembers { .. } => "room-members",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::Error { .. } => "error",
        }
    }

    pub fn error(room_id: Option<&str>, message: impl Into<String>) -> Self {
        SignalMessage::Error {
            room_id: room_id.map(str::to_string),
            message: message.into(),
        }
    }
}
