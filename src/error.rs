use std::io;

use quinn::{ReadExactError, WriteError};
use quinn_proto::{ConnectError, ConnectionError};
use thiserror::Error;

use crate::{
    identity::{PeerId, PeerRole},
    net::{
        link::ConnectionState,
        wire::{MessageType, RejectReason},
    },
    protocol::messages::StreamPartitionKey,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not start connecting: {0}")]
    Connect(#[from] ConnectError),
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("write failed: {0}")]
    Write(#[from] WriteError),
    #[error("read failed: {0}")]
    ReadExact(#[from] ReadExactError),
    #[error("tls configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
    #[error("could not generate certificate: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error("could not encode message")]
    CouldNotEncodeMessage,
    #[error("could not decode message")]
    CouldNotDecodeMessage,
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),
    #[error("message of {len} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    #[error("unexpected {0:?} message")]
    ReceivedBadMessage(MessageType),
    #[error("stream closed during handshake")]
    HandshakeIncomplete,
    #[error("handshake rejected by peer: {0:?}")]
    HandshakeRejected(RejectReason),
    #[error("no common protocol version with {0}")]
    VersionMismatch(PeerId),
    #[error("peer {peer} has role {actual:?}, expected {expected:?}")]
    UnexpectedRole {
        peer: PeerId,
        expected: PeerRole,
        actual: PeerRole,
    },
    #[error("expected peer {expected} but {actual} answered")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("not connected to {0}")]
    NotConnected(PeerId),
    #[error("operation timed out")]
    Timeout,
    #[error("connection to {0} failed")]
    ConnectionFailed(PeerId),
    #[error("connection cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("not subscribed to {0}")]
    NotSubscribed(StreamPartitionKey),
    #[error("no tracker is configured for stream {0}")]
    NoTracker(String),
    #[error("process has stopped")]
    Stopped,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
