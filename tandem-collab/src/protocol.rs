//! Binary envelope for everything sent on a session topic.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ sender    │ topic    │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Presence records travel as bincode inside the payload. Change events carry
//! arbitrary JSON, so their payload is the JSON encoding of the event.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::changes::ChangeEvent;
use crate::presence::CollaboratorPresence;

/// Message types carried on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First announcement after (re)connecting. Peers answer with `Announce`.
    Join = 1,
    /// Full presence record (update, or reply to a `Join`).
    Announce = 2,
    /// Clean detach from the topic.
    Leave = 3,
    /// Diagram change notification.
    Change = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Session key of the publishing user.
    pub sender: Uuid,
    /// Session topic (diagram id).
    pub topic: Uuid,
    /// Per-publisher sequence number. Informational only, never used for ordering.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn presence_message(
        msg_type: MessageType,
        topic: Uuid,
        clock: u64,
        presence: &CollaboratorPresence,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(presence, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type,
            sender: presence.session_key,
            topic,
            clock,
            payload,
        })
    }

    /// First announcement of `presence` on `topic`.
    pub fn join(
        topic: Uuid,
        clock: u64,
        presence: &CollaboratorPresence,
    ) -> Result<Self, ProtocolError> {
        Self::presence_message(MessageType::Join, topic, clock, presence)
    }

    /// Re-announcement of the full presence record.
    pub fn announce(
        topic: Uuid,
        clock: u64,
        presence: &CollaboratorPresence,
    ) -> Result<Self, ProtocolError> {
        Self::presence_message(MessageType::Announce, topic, clock, presence)
    }

    pub fn leave(sender: Uuid, topic: Uuid) -> Self {
        Self {
            msg_type: MessageType::Leave,
            sender,
            topic,
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn change(
        sender: Uuid,
        topic: Uuid,
        clock: u64,
        event: &ChangeEvent,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Change,
            sender,
            topic,
            clock,
            payload,
        })
    }

    pub fn ping(sender: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            sender,
            topic: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(sender: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            sender,
            topic: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the presence record of a `Join` or `Announce`.
    pub fn presence(&self) -> Result<CollaboratorPresence, ProtocolError> {
        if !matches!(self.msg_type, MessageType::Join | MessageType::Announce) {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (presence, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(presence)
    }

    /// Parse the event of a `Change`.
    pub fn change_event(&self) -> Result<ChangeEvent, ProtocolError> {
        if self.msg_type != MessageType::Change {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn is_presence(&self) -> bool {
        matches!(
            self.msg_type,
            MessageType::Join | MessageType::Announce | MessageType::Leave
        )
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_core::Point;

    fn alice() -> CollaboratorPresence {
        let mut p = CollaboratorPresence::new(Uuid::new_v4(), "Alice");
        p.cursor = Some(Point::new(12.5, -4.0));
        p.selected_element_id = Some("node-7".into());
        p
    }

    #[test]
    fn test_join_carries_full_presence() {
        let topic = Uuid::new_v4();
        let me = alice();

        let msg = SyncMessage::join(topic, 1, &me).unwrap();
        assert_eq!(msg.sender, me.session_key);

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Join);
        assert_eq!(decoded.topic, topic);
        assert_eq!(decoded.presence().unwrap(), me);
    }

    #[test]
    fn test_announce_without_optional_fields() {
        let me = CollaboratorPresence::new(Uuid::new_v4(), "Bob");
        let msg = SyncMessage::announce(Uuid::new_v4(), 3, &me).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        let parsed = decoded.presence().unwrap();
        assert!(parsed.cursor.is_none());
        assert!(parsed.avatar_ref.is_none());
        assert_eq!(decoded.clock, 3);
    }

    #[test]
    fn test_change_carries_json_payload() {
        let event = ChangeEvent::new("node.moved", json!({ "id": "a", "x": 4, "nested": [1, 2] }));
        let msg = SyncMessage::change(Uuid::new_v4(), Uuid::new_v4(), 9, &event).unwrap();

        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.change_event().unwrap(), event);
    }

    #[test]
    fn test_leave_has_empty_payload() {
        let sender = Uuid::new_v4();
        let msg = SyncMessage::leave(sender, Uuid::new_v4());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Leave);
        assert_eq!(decoded.sender, sender);
        assert!(decoded.payload.is_empty());
        assert!(decoded.is_presence());
    }

    #[test]
    fn test_payload_accessors_check_type() {
        let ping = SyncMessage::ping(Uuid::new_v4());
        assert!(matches!(
            ping.presence(),
            Err(ProtocolError::InvalidMessageType(MessageType::Ping))
        ));
        assert!(ping.change_event().is_err());
        assert!(!ping.is_presence());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_presence_frame_is_small() {
        let msg = SyncMessage::announce(Uuid::new_v4(), 1, &alice()).unwrap();
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 160, "presence frame is {} bytes", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::Announce as u8, 2);
        assert_eq!(MessageType::Leave as u8, 3);
        assert_eq!(MessageType::Change as u8, 4);
        assert_eq!(MessageType::Ping as u8, 5);
        assert_eq!(MessageType::Pong as u8, 6);
    }
}
