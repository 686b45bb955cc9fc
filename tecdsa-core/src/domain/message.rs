use crate::foundation::{MemberId, Result, SessionId};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

pub const PROTOCOL_MESSAGE_TYPE: &str = "tss/protocol";
pub const READY_MESSAGE_TYPE: &str = "tss/ready";

/// An application message carried by a network channel. Implementations pair
/// a stable type tag with their wire encoding; receivers register an
/// unmarshaler per tag.
pub trait NetMessage: Send + Sync + fmt::Debug {
    fn type_tag(&self) -> &'static str;
    fn marshal(&self) -> Result<Vec<u8>>;
    fn as_any(&self) -> &dyn Any;
}

/// One round message of the underlying threshold protocol, opaque to the
/// network layer. Routed broadcast when `receiver_id` is absent.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub session_id: SessionId,
    pub sender_id: MemberId,
    pub receiver_id: Option<MemberId>,
    pub payload: Vec<u8>,
    pub is_broadcast: bool,
}

impl ProtocolMessage {
    pub fn broadcast(session_id: SessionId, sender_id: MemberId, payload: Vec<u8>) -> Self {
        Self { session_id, sender_id, receiver_id: None, payload, is_broadcast: true }
    }

    pub fn unicast(session_id: SessionId, sender_id: MemberId, receiver_id: MemberId, payload: Vec<u8>) -> Self {
        Self { session_id, sender_id, receiver_id: Some(receiver_id), payload, is_broadcast: false }
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl NetMessage for ProtocolMessage {
    fn type_tag(&self) -> &'static str {
        PROTOCOL_MESSAGE_TYPE
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Pre-protocol announcement. Each member publishes one on the session's
/// broadcast channel and waits for the barrier to complete before starting
/// its party machine. For signing sessions the announcement carries the
/// member's next unused presignature index; the session runs with the
/// highest index any ready member announced.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub session_id: SessionId,
    pub sender_id: MemberId,
    pub presignature_cursor: u64,
}

impl ReadyMessage {
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl NetMessage for ReadyMessage {
    fn type_tag(&self) -> &'static str {
        READY_MESSAGE_TYPE
    }

    fn marshal(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_message_round_trip() {
        let msg = ProtocolMessage::unicast(
            SessionId::keygen("0xabc"),
            MemberId::new(vec![1]),
            MemberId::new(vec![2]),
            vec![1, 2, 3],
        );
        let bytes = msg.marshal().expect("marshal");
        let decoded = ProtocolMessage::unmarshal(&bytes).expect("unmarshal");
        assert_eq!(decoded, msg);
        assert!(!decoded.is_broadcast);
    }

    #[test]
    fn ready_message_round_trip() {
        let msg = ReadyMessage {
            session_id: SessionId::keygen("0xabc"),
            sender_id: MemberId::new(vec![7]),
            presignature_cursor: 3,
        };
        let decoded = ReadyMessage::unmarshal(&msg.marshal().expect("marshal")).expect("unmarshal");
        assert_eq!(decoded, msg);
    }
}
