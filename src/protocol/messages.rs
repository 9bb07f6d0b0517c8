use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

use crate::{
    error::Error,
    hex::random_uuid,
    identity::{Location, PeerId, PeerInfo},
    net::wire::{Frame, MessageType},
};

/// Correlates replies with the request that caused them. Random UUID text;
/// the empty string means the message is not part of an exchange.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(random_uuid())
    }

    pub fn none() -> Self {
        Self(String::new())
    }

    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Names one data connection attempt between two participants.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(random_uuid())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// One partition of one stream; each key has its own overlay.
#[derive(
    Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[archive(check_bytes)]
pub struct StreamPartitionKey {
    pub stream_id: String,
    pub partition: u32,
}

impl StreamPartitionKey {
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
        }
    }
}

impl fmt::Display for StreamPartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream_id, self.partition)
    }
}

/// A participant's view of its neighbours on one key.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct StreamStatus {
    pub key: StreamPartitionKey,
    pub inbound: Vec<PeerId>,
    pub outbound: Vec<PeerId>,
    /// Freshness counter scoped to (participant, key). Echoes the counter of
    /// the last applied instruction unless the participant changed its
    /// neighbours on its own since.
    pub counter: u64,
}

impl StreamStatus {
    /// Inbound and outbound peers, without duplicates.
    pub fn neighbors(&self) -> Vec<PeerId> {
        let mut all: Vec<PeerId> = self.inbound.iter().chain(&self.outbound).cloned().collect();
        all.sort();
        all.dedup();
        all
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RttSample {
    pub peer: PeerId,
    pub rtt_micros: u64,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[archive(check_bytes)]
pub struct Status {
    pub streams: Vec<StreamStatus>,
    pub rtts: Vec<RttSample>,
    pub location: Option<Location>,
    /// The status only concerns the listed keys; it does not imply the
    /// participant left the keys it omits.
    pub single_stream: bool,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct StatusMessage {
    pub request_id: RequestId,
    pub status: Status,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct InstructionMessage {
    pub request_id: RequestId,
    pub key: StreamPartitionKey,
    pub neighbors: Vec<PeerId>,
    pub counter: u64,
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum ErrorCode {
    /// The relay target has no session with the tracker.
    UnknownPeer,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct ErrorMessage {
    pub request_id: RequestId,
    pub code: ErrorCode,
    pub target: PeerId,
}

/// Connection negotiation data, opaque to the tracker.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum RelayPayload {
    /// Opens a negotiation. The description is the offerer's data address.
    Offer {
        connection_id: ConnectionId,
        description: String,
    },
    /// Accepts an offer with the answerer's data address.
    Answer {
        connection_id: ConnectionId,
        description: String,
    },
    /// Asks the receiver to send an offer.
    Connect { connection_id: ConnectionId },
    /// An additional address the sender can be reached at.
    IceCandidate {
        connection_id: ConnectionId,
        candidate: String,
        mid: String,
    },
}

impl RelayPayload {
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            RelayPayload::Offer { connection_id, .. }
            | RelayPayload::Answer { connection_id, .. }
            | RelayPayload::Connect { connection_id }
            | RelayPayload::IceCandidate { connection_id, .. } => connection_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayPayload::Offer { .. } => "offer",
            RelayPayload::Answer { .. } => "answer",
            RelayPayload::Connect { .. } => "connect",
            RelayPayload::IceCandidate { .. } => "ice-candidate",
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct RelayMessage {
    pub request_id: RequestId,
    /// Stamped by the tracker with the sender's session identity.
    pub originator: PeerInfo,
    pub target: PeerId,
    pub payload: RelayPayload,
}

/// Messages exchanged between participants and trackers after the handshake.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    Status(StatusMessage),
    Instruction(InstructionMessage),
    Relay(RelayMessage),
    Error(ErrorMessage),
}

impl ControlMessage {
    pub fn request_id(&self) -> &RequestId {
        match self {
            ControlMessage::Status(msg) => &msg.request_id,
            ControlMessage::Instruction(msg) => &msg.request_id,
            ControlMessage::Relay(msg) => &msg.request_id,
            ControlMessage::Error(msg) => &msg.request_id,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, Error> {
        match self {
            ControlMessage::Status(msg) => Frame::encode(MessageType::Status, msg),
            ControlMessage::Instruction(msg) => Frame::encode(MessageType::Instruction, msg),
            ControlMessage::Relay(msg) => Frame::encode(MessageType::Relay, msg),
            ControlMessage::Error(msg) => Frame::encode(MessageType::Error, msg),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, Error> {
        Ok(match frame.msg_type {
            MessageType::Status => ControlMessage::Status(frame.decode()?),
            MessageType::Instruction => ControlMessage::Instruction(frame.decode()?),
            MessageType::Relay => ControlMessage::Relay(frame.decode()?),
            MessageType::Error => ControlMessage::Error(frame.decode()?),
            other => return Err(Error::ReceivedBadMessage(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StreamPartitionKey {
        StreamPartitionKey::new("stream-1", 3)
    }

    #[test]
    fn request_ids_are_unique_and_none_is_empty() {
        assert_ne!(RequestId::new(), RequestId::new());
        assert!(RequestId::none().is_none());
        assert!(!RequestId::new().is_none());
        assert_eq!(RequestId::default(), RequestId::none());
    }

    #[test]
    fn key_display() {
        assert_eq!(key().to_string(), "stream-1#3");
    }

    #[test]
    fn status_neighbors_merge_both_directions() {
        let status = StreamStatus {
            key: key(),
            inbound: vec!["b".into(), "a".into()],
            outbound: vec!["a".into(), "c".into()],
            counter: 1,
        };
        let names: Vec<_> = status.neighbors().iter().map(|p| p.to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn control_messages_survive_framing() {
        let messages = vec![
            ControlMessage::Status(StatusMessage {
                request_id: RequestId::new(),
                status: Status {
                    streams: vec![StreamStatus {
                        key: key(),
                        inbound: vec!["a".into()],
                        outbound: vec![],
                        counter: 7,
                    }],
                    rtts: vec![RttSample {
                        peer: "a".into(),
                        rtt_micros: 1200,
                    }],
                    location: Some(Location::from(60.17, 24.94)),
                    single_stream: true,
                },
            }),
            ControlMessage::Relay(RelayMessage {
                request_id: RequestId::none(),
                originator: PeerInfo::new_node("a"),
                target: "b".into(),
                payload: RelayPayload::IceCandidate {
                    connection_id: ConnectionId::from("c-1"),
                    candidate: "127.0.0.1:4000".into(),
                    mid: "0".into(),
                },
            }),
        ];
        for msg in messages {
            let frame = msg.to_frame().unwrap();
            assert_eq!(ControlMessage::from_frame(&frame).unwrap(), msg);
        }
    }

    #[test]
    fn data_frames_are_not_control_messages() {
        let frame = Frame {
            msg_type: MessageType::Broadcast,
            body: vec![],
        };
        assert!(matches!(
            ControlMessage::from_frame(&frame),
            Err(Error::ReceivedBadMessage(MessageType::Broadcast))
        ));
    }
}
