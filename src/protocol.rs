use serde::{Deserialize, Serialize};
use std::fmt::Formatter;
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Stable identifier of a room participant, as assigned by the relay.
#[repr(transparent)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Arc<str>);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        UserId(Arc::from(value))
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        UserId(Arc::from(value))
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Negotiation payload exchanged between two peer connections. Its content is produced and
/// consumed only by the peer connection handles; the session manager never looks inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Responder asks the initiator to produce a fresh offer (ie. because it attached new tracks).
    Renegotiate,
    Candidate(RTCIceCandidateInit),
    Sdp(RTCSessionDescription),
}

/// Messages exchanged with the relay on a room-scoped channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Outbound: enter the room. Sent on every (re)connect.
    Join {
        room_id: String,
        user_id: UserId,
        user_name: String,
    },
    /// Inbound: another participant entered the room.
    Joined {
        #[serde(default)]
        room_id: String,
        user_id: UserId,
        user_name: String,
    },
    /// Bidirectional negotiation envelope. `user_id` is the target on outbound messages and the
    /// sender on inbound ones.
    Signal {
        #[serde(default)]
        room_id: String,
        #[serde(alias = "target_user_id", alias = "from_user_id")]
        user_id: UserId,
        payload: Signal,
    },
    /// Inbound: participant has left the room.
    Left {
        #[serde(default)]
        room_id: String,
        user_id: UserId,
    },
    /// Outbound: leave the room gracefully.
    Leave { room_id: String, user_id: UserId },
}

impl SignalingMessage {
    pub fn room_id(&self) -> &str {
        match self {
            SignalingMessage::Join { room_id, .. }
            | SignalingMessage::Joined { room_id, .. }
            | SignalingMessage::Signal { room_id, .. }
            | SignalingMessage::Left { room_id, .. }
            | SignalingMessage::Leave { room_id, .. } => room_id,
        }
    }

    pub fn to_json(&self) -> Result<String, crate::Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, crate::Error> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod test {
    use crate::protocol::{Signal, SignalingMessage, UserId};
    use serde_json::json;
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

    #[test]
    fn inbound_signal_accepts_sender_alias() {
        let msg = SignalingMessage::from_json(
            &json!({
                "type": "signal",
                "from_user_id": "u-2",
                "payload": "renegotiate"
            })
            .to_string(),
        )
        .unwrap();
        match msg {
            SignalingMessage::Signal {
                room_id,
                user_id,
                payload: Signal::Renegotiate,
            } => {
                assert!(room_id.is_empty());
                assert_eq!(user_id, UserId::from("u-2"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn join_wire_shape() {
        let msg = SignalingMessage::Join {
            room_id: "room-1".into(),
            user_id: "me".into(),
            user_name: "Me".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "join", "room_id": "room-1", "user_id": "me", "user_name": "Me"})
        );
    }

    #[test]
    fn candidate_payload_shape() {
        let payload = Signal::Candidate(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value["candidate"]["candidate"],
            json!("candidate:1 1 udp 1 127.0.0.1 5000 typ host")
        );
        let back: Signal = serde_json::from_value(value).unwrap();
        assert!(matches!(back, Signal::Candidate(c) if c.sdp_mline_index == Some(0)));
    }
}
