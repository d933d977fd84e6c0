//! Binary relay protocol.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬─────────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room        │ target       │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ quire/<id>  │ 0 or 16 bytes│ varint   │ variable │
//! └──────────┴───────────┴─────────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! The relay only looks at `msg_type`, `peer_id`, `room` and `target`.
//! Payloads are opaque to it: merge updates and state vectors for the
//! sync messages, a bincode [`PresenceMessage`] for presence, a bincode
//! [`PeerInfo`] for joins.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::{session_color, PresenceMessage};

/// Room name prefix; a project's room is `quire/<project id>`.
pub const ROOM_PREFIX: &str = "quire/";

pub fn room_for(project_id: &str) -> String {
    format!("{ROOM_PREFIX}{project_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector opening a full sync
    SyncStep1 = 1,
    /// Diff answering a `SyncStep1`, addressed to its sender
    SyncStep2 = 2,
    /// Incremental merge update
    Delta = 3,
    /// Ephemeral presence frame
    Presence = 4,
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
}

/// Session identity announced on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// CSS colour, stable for a given session id
    pub color: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: session_color(peer_id),
        }
    }
}

/// Top-level relay frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Deliver only to this session when set
    pub target: Option<Uuid>,
    /// Lamport clock of the sender
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            target: None,
            clock,
            payload,
        }
    }

    pub fn delta(peer_id: Uuid, room: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, room, clock, update)
    }

    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    /// Diff for `target`, who asked with a `SyncStep1`.
    pub fn sync_step2(peer_id: Uuid, room: &str, target: Uuid, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, diff).addressed_to(target)
    }

    pub fn presence(
        peer_id: Uuid,
        room: &str,
        clock: u64,
        message: &PresenceMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Presence, peer_id, room, clock, message.encode()?))
    }

    pub fn peer_joined(info: &PeerInfo, room: &str) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, room, 0, payload))
    }

    pub fn peer_left(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    pub fn addressed_to(mut self, target: Uuid) -> Self {
        self.target = Some(target);
        self
    }

    /// Whether a session should consume this frame.
    pub fn is_for(&self, session: Uuid) -> bool {
        self.peer_id != session && self.target.map_or(true, |t| t == session)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn presence_message(&self) -> Result<PresenceMessage, ProtocolError> {
        if self.msg_type != MessageType::Presence {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        PresenceMessage::decode(&self.payload)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("failed to connect to relay: {0}")]
    Connect(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("offline queue is full")]
    QueueFull,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceState;

    const ROOM: &str = "quire/p1";

    #[test]
    fn test_delta_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::delta(peer, ROOM, 42, vec![1, 2, 3]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.room, ROOM);
        assert_eq!(decoded.target, None);
    }

    #[test]
    fn test_sync_step2_is_addressed() {
        let from = Uuid::new_v4();
        let to = Uuid::new_v4();
        let other = Uuid::new_v4();
        let msg = SyncMessage::sync_step2(from, ROOM, to, vec![9]);

        assert!(msg.is_for(to));
        assert!(!msg.is_for(other));
        assert!(!msg.is_for(from));
    }

    #[test]
    fn test_broadcast_frames_skip_sender_only() {
        let from = Uuid::new_v4();
        let msg = SyncMessage::delta(from, ROOM, 1, Vec::new());
        assert!(msg.is_for(Uuid::new_v4()));
        assert!(!msg.is_for(from));
    }

    #[test]
    fn test_presence_payload() {
        let session = Uuid::new_v4();
        let state = PresenceState::new(session, "Alice").with_editing(Some("c1".into()));
        let msg = SyncMessage::presence(session, ROOM, 3, &PresenceMessage::Update(state.clone()))
            .unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.presence_message().unwrap(), PresenceMessage::Update(state));
    }

    #[test]
    fn test_peer_joined_payload() {
        let info = PeerInfo::new("Bob");
        let msg = SyncMessage::peer_joined(&info, ROOM).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.peer_info().unwrap(), info);
        assert!(decoded.presence_message().is_err());
    }

    #[test]
    fn test_peer_info_color_is_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(PeerInfo::with_id(id, "a").color, PeerInfo::with_id(id, "b").color);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            SyncMessage::decode(&[0xFF, 0xFE, 0xFD]),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::Presence as u8, 4);
        assert_eq!(MessageType::Pong as u8, 8);
    }

    #[test]
    fn test_room_for() {
        assert_eq!(room_for("abc"), "quire/abc");
    }

    #[test]
    fn test_delta_header_stays_small() {
        let msg = SyncMessage::delta(Uuid::new_v4(), ROOM, 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 120, "encoded size {} too large", encoded.len());
    }
}
