// Data messages exchanged directly between participants over data links.
// Payloads are opaque to the overlay; only the routing metadata in MessageId is
// read.

use rkyv::{Archive, Deserialize, Serialize};

use crate::{
    error::Error,
    identity::PeerId,
    net::wire::{Frame, MessageType},
};

use super::messages::{RequestId, StreamPartitionKey};

/// Identifies a published message across the whole overlay.
#[derive(
    Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[archive(check_bytes)]
pub struct MessageId {
    pub key: StreamPartitionKey,
    /// Milliseconds since the unix epoch at publish time.
    pub timestamp: i64,
    pub sequence: u32,
    pub publisher_id: PeerId,
    pub chain_id: String,
}

/// Points at the previous message of the same publisher chain.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct MessageRef {
    pub timestamp: i64,
    pub sequence: u32,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct StreamMessage {
    pub id: MessageId,
    pub prev: Option<MessageRef>,
    pub payload: Vec<u8>,
}

impl StreamMessage {
    pub fn key(&self) -> &StreamPartitionKey {
        &self.id.key
    }

    pub fn as_ref(&self) -> MessageRef {
        MessageRef {
            timestamp: self.id.timestamp,
            sequence: self.id.sequence,
        }
    }
}

/// Fanned out along the overlay of the message's key; no reply expected.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct BroadcastMessage {
    /// May be empty.
    pub request_id: RequestId,
    pub message: StreamMessage,
}

/// Sent to exactly one neighbour. A reply carries the request id of the
/// message it answers.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct UnicastMessage {
    pub request_id: RequestId,
    pub message: StreamMessage,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeMessage {
    Broadcast(BroadcastMessage),
    Unicast(UnicastMessage),
}

impl NodeMessage {
    pub fn to_frame(&self) -> Result<Frame, Error> {
        match self {
            NodeMessage::Broadcast(msg) => Frame::encode(MessageType::Broadcast, msg),
            NodeMessage::Unicast(msg) => Frame::encode(MessageType::Unicast, msg),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, Error> {
        Ok(match frame.msg_type {
            MessageType::Broadcast => NodeMessage::Broadcast(frame.decode()?),
            MessageType::Unicast => NodeMessage::Unicast(frame.decode()?),
            other => return Err(Error::ReceivedBadMessage(other)),
        })
    }
}
