use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Possible reasons for a relay or client error.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum ErrorReason {
    /// The message was malformed and could not be parsed.
    MalformedMessage,
    /// The message was processed successfully, but an internal error occurred.
    Internal(String),
    /// The sender tried to address a room member before joining a room.
    NotInRoom,
    /// The relay or client encountered an unexpected message.
    UnexpectedMessage(String),
}

/// Represents a message exchanged between the signaling relay and room members.
///
/// Messages addressed to a single peer carry a `peer_id`. When sent to the relay by a client, this is
/// the ID of the target peer. The relay rewrites it to the ID of the sending peer before delivering
/// the message, so a received `peer_id` always names the source.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// Sent by a client to enter a room. The room is created implicitly by its first member.
    ///
    /// The relay acknowledges with [`SignalingMessage::RoomJoined`] and broadcasts a
    /// [`SignalingMessage::UserJoined`] to every other member of the room.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        /// Opaque identifier of the room to join.
        room_id: String,
    },
    /// Acknowledgement sent by the relay to a client after it joined a room.
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        /// Identifier of the joined room.
        room_id: String,
        /// Transient connection ID assigned to the joining client.
        peer_id: String,
    },
    /// Sent by a client before a requested disconnect to leave its room gracefully.
    ///
    /// Dropping the connection has the same effect, this message only makes the departure immediate.
    LeaveRoom,
    /// Broadcast by the relay to all existing members of a room when a new member joined.
    ///
    /// Existing members are expected to initiate a connection by sending a [`SignalingMessage::Offer`].
    #[serde(rename_all = "camelCase")]
    UserJoined {
        /// Connection ID of the new member.
        peer_id: String,
    },
    /// A session description offer, initiating the negotiation of a peer connection.
    ///
    /// The receiving client replies with a [`SignalingMessage::Answer`].
    #[serde(rename_all = "camelCase")]
    Offer {
        /// Opaque session description containing the offer.
        sdp: String,
        /// Target peer when sent to the relay, source peer when received from it.
        peer_id: String,
    },
    /// A session description answer in reply to a previously received [`SignalingMessage::Offer`].
    #[serde(rename_all = "camelCase")]
    Answer {
        /// Opaque session description containing the answer.
        sdp: String,
        /// Target peer when sent to the relay, source peer when received from it.
        peer_id: String,
    },
    /// A trickled ICE candidate for the connection with the given peer.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// Opaque ICE candidate, or `None` to signal the end of candidates.
        candidate: Option<String>,
        /// Target peer when sent to the relay, source peer when received from it.
        peer_id: String,
    },
    /// Broadcast by the relay to all remaining members of a room when a member left or disconnected.
    #[serde(rename_all = "camelCase")]
    UserLeft {
        /// Connection ID of the departed member.
        peer_id: String,
    },
    /// Sent by the relay if a message was addressed to a peer that is not a member of the sender's room.
    #[serde(rename_all = "camelCase")]
    PeerNotFound {
        /// ID of the peer that was not found.
        peer_id: String,
    },
    /// Generic error message sent by the relay.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Reason for the error.
        reason: ErrorReason,
        /// Optional ID of the peer that caused the error.
        peer_id: Option<String>,
    },
}

/// Discriminant of a [`SignalingMessage`], used to register listeners for a single message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JoinRoom,
    RoomJoined,
    LeaveRoom,
    UserJoined,
    Offer,
    Answer,
    IceCandidate,
    UserLeft,
    PeerNotFound,
    Error,
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::JoinRoom => "join-room",
            MessageKind::RoomJoined => "room-joined",
            MessageKind::LeaveRoom => "leave-room",
            MessageKind::UserJoined => "user-joined",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::UserLeft => "user-left",
            MessageKind::PeerNotFound => "peer-not-found",
            MessageKind::Error => "error",
        };
        f.write_str(name)
    }
}

impl SignalingMessage {
    /// Serializes a [`SignalingMessage`] into a JSON string.
    pub fn serialize(message: &Self) -> serde_json::error::Result<String> {
        serde_json::to_string(message)
    }

    /// Deserializes a JSON string into a [`SignalingMessage`].
    pub fn deserialize(message: &str) -> serde_json::error::Result<Self> {
        serde_json::from_str(message)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            SignalingMessage::JoinRoom { .. } => MessageKind::JoinRoom,
            SignalingMessage::RoomJoined { .. } => MessageKind::RoomJoined,
            SignalingMessage::LeaveRoom => MessageKind::LeaveRoom,
            SignalingMessage::UserJoined { .. } => MessageKind::UserJoined,
            SignalingMessage::Offer { .. } => MessageKind::Offer,
            SignalingMessage::Answer { .. } => MessageKind::Answer,
            SignalingMessage::IceCandidate { .. } => MessageKind::IceCandidate,
            SignalingMessage::UserLeft { .. } => MessageKind::UserLeft,
            SignalingMessage::PeerNotFound { .. } => MessageKind::PeerNotFound,
            SignalingMessage::Error { .. } => MessageKind::Error,
        }
    }

    /// Returns the peer a message is addressed to (or originates from), if it is a peer-to-peer message.
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { peer_id, .. }
            | SignalingMessage::Answer { peer_id, .. }
            | SignalingMessage::IceCandidate { peer_id, .. } => Some(peer_id),
            _ => None,
        }
    }

    /// Returns a copy of a peer-to-peer message with its `peer_id` replaced.
    ///
    /// Used by relays to exchange the target ID with the source ID before forwarding.
    pub fn with_peer_id(&self, new_peer_id: &str) -> Option<Self> {
        let peer_id = new_peer_id.to_string();
        match self {
            SignalingMessage::Offer { sdp, .. } => Some(SignalingMessage::Offer {
                sdp: sdp.clone(),
                peer_id,
            }),
            SignalingMessage::Answer { sdp, .. } => Some(SignalingMessage::Answer {
                sdp: sdp.clone(),
                peer_id,
            }),
            SignalingMessage::IceCandidate { candidate, .. } => {
                Some(SignalingMessage::IceCandidate {
                    candidate: candidate.clone(),
                    peer_id,
                })
            }
            _ => None,
        }
    }
}
