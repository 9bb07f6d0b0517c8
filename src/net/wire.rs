use byteorder::{ByteOrder, LittleEndian};
use quinn::{ReadExactError, RecvStream, SendStream};
use rkyv::{
    de::deserializers::SharedDeserializeMap, ser::serializers::AllocSerializer,
    validation::validators::DefaultValidator, AlignedVec, Archive, CheckBytes, Deserialize,
    Serialize,
};

use crate::{
    error::Error,
    identity::PeerInfo,
    protocol::{messages::ConnectionId, version::NegotiatedVersions},
};

/// A frame is `type (1 byte) | body length (u32 LE) | body`, where the body is
/// an rkyv archive of the message named by the type byte.
pub const HEADER_LEN: usize = 1 + 4;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    // HANDSHAKE MESSAGES
    /// The initiator's identity, sent first on every link
    Hello = 0x01,
    /// The responder's identity and the chosen protocol versions
    Welcome = 0x02,
    /// The responder refuses the link
    Rejected = 0x03,

    // CONTROL MESSAGES
    /// A participant's neighbour report
    Status = 0x10,
    /// A tracker's target neighbour set for one stream partition
    Instruction = 0x11,
    /// Connection negotiation data relayed through the tracker
    Relay = 0x12,
    /// A tracker's error reply
    Error = 0x13,

    // DATA MESSAGES
    /// Stream data fanned out along the overlay
    Broadcast = 0x20,
    /// Stream data for exactly one peer
    Unicast = 0x21,
}

impl MessageType {
    pub fn is_handshake(self) -> bool {
        (self as u8) < 0x10
    }

    pub fn is_control(self) -> bool {
        (0x10..0x20).contains(&(self as u8))
    }

    pub fn is_data(self) -> bool {
        (self as u8) >= 0x20
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        Ok(match value {
            0x01 => MessageType::Hello,
            0x02 => MessageType::Welcome,
            0x03 => MessageType::Rejected,
            0x10 => MessageType::Status,
            0x11 => MessageType::Instruction,
            0x12 => MessageType::Relay,
            0x13 => MessageType::Error,
            0x20 => MessageType::Broadcast,
            0x21 => MessageType::Unicast,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

/// First message of every link.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Hello {
    pub peer_info: PeerInfo,
    /// Set on data links: the connection id agreed during signalling.
    pub connection_id: Option<ConnectionId>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Welcome {
    pub peer_info: PeerInfo,
    pub versions: NegotiatedVersions,
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum RejectReason {
    UnexpectedRole,
    NoCommonVersion,
    /// A data link was opened without the connection id agreed during
    /// signalling.
    MissingConnectionId,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Rejected {
    pub reason: RejectReason,
}

/// A partially decoded wire message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn encode<T>(msg_type: MessageType, msg: &T) -> Result<Self, Error>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        let body = rkyv::to_bytes::<_, 256>(msg).map_err(|_| Error::CouldNotEncodeMessage)?;
        Ok(Self {
            msg_type,
            body: body.into_vec(),
        })
    }

    pub fn decode<T>(&self) -> Result<T, Error>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, SharedDeserializeMap>,
    {
        // archives must be read from an aligned buffer
        let mut aligned = AlignedVec::with_capacity(self.body.len());
        aligned.extend_from_slice(&self.body);
        rkyv::from_bytes::<T>(&aligned).map_err(|_| Error::CouldNotDecodeMessage)
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, self.body.len() as u32);
        buf.push(self.msg_type as u8); // 1 byte
        buf.extend_from_slice(&len); // 4 bytes
        buf.extend_from_slice(&self.body); // len bytes
        buf
    }
}

/// Parses a frame header, refusing bodies longer than `max_len`.
pub fn parse_header(header: &[u8; HEADER_LEN], max_len: usize) -> Result<(MessageType, usize), Error> {
    let msg_type = MessageType::try_from(header[0])?;
    let len = LittleEndian::read_u32(&header[1..]) as usize;
    if len > max_len {
        return Err(Error::MessageTooLarge { len, max: max_len });
    }
    Ok((msg_type, len))
}

pub async fn write_frame(stream: &mut SendStream, frame: &Frame) -> Result<(), Error> {
    stream.write_all(&frame.to_bytes()).await?;
    Ok(())
}

/// Reads the next frame. Returns `None` when the peer finished the stream
/// cleanly at a frame boundary.
pub async fn read_frame(stream: &mut RecvStream, max_len: usize) -> Result<Option<Frame>, Error> {
    let mut header = [0u8; HEADER_LEN];
    match stream.read_exact(&mut header).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly) => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let (msg_type, len) = parse_header(&header, max_len)?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(Frame { msg_type, body }))
}
