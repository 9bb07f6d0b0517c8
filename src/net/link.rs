use std::{net::SocketAddr, time::Duration};

use futures::{Stream, StreamExt};
use quinn::{Connecting, RecvStream, SendStream, VarInt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, debug_span, trace, Instrument};

use crate::{
    config::TransportSettings,
    error::Error,
    identity::{PeerId, PeerInfo, PeerRole},
    protocol::{
        messages::ConnectionId,
        version::{self, NegotiatedVersions},
    },
};

use super::wire::{read_frame, write_frame, Frame, Hello, MessageType, RejectReason, Rejected, Welcome};

/// Lifecycle of a data connection record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Negotiating,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Negotiating, Connected)
                | (Negotiating, Closing)
                | (Negotiating, Failed)
                | (Connected, Closing)
                | (Connected, Failed)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// What the initiator of a link expects to find on the other side.
#[derive(Clone, Debug)]
pub struct Expect {
    pub role: PeerRole,
    pub peer: Option<PeerId>,
}

impl Expect {
    pub fn tracker(peer: PeerId) -> Self {
        Self {
            role: PeerRole::Tracker,
            peer: Some(peer),
        }
    }

    pub fn node(peer: PeerId) -> Self {
        Self {
            role: PeerRole::Node,
            peer: Some(peer),
        }
    }
}

/// Application close codes.
pub const CLOSE_NORMAL: u32 = 0;
pub const CLOSE_REPLACED: u32 = 1;
pub const CLOSE_REJECTED: u32 = 2;

/// A QUIC connection to a peer whose identity and protocol versions have been
/// established by the Hello/Welcome handshake.
///
/// Can be cloned to obtain another handle to the same connection.
#[derive(Clone, Debug)]
pub struct Link {
    conn: quinn::Connection,
    remote: PeerInfo,
    versions: NegotiatedVersions,
    connection_id: Option<ConnectionId>,
}

impl Link {
    /// Completes an outgoing connection and performs the initiator side of
    /// the handshake.
    pub async fn initiate(
        connecting: Connecting,
        local: &PeerInfo,
        expect: Expect,
        connection_id: Option<ConnectionId>,
        settings: &TransportSettings,
    ) -> Result<(Self, LinkSendStream, LinkRecvStream), Error> {
        let remote_addr = connecting.remote_address();
        let span = debug_span!("link", remote = %remote_addr, role = "initiator");
        let max_len = settings.max_message_bytes;
        let handshake = async move {
            let conn = connecting.await?;
            debug!("connected via QUIC");
            let (raw_tx, raw_rx) = conn.open_bi().await?;
            let mut send = LinkSendStream::new(raw_tx);
            let mut recv = LinkRecvStream::new(raw_rx, max_len);

            let hello = Hello {
                peer_info: local.clone(),
                connection_id: connection_id.clone(),
            };
            send.send(&Frame::encode(MessageType::Hello, &hello)?).await?;
            debug!("sent hello");

            let frame = recv.recv().await?.ok_or(Error::HandshakeIncomplete)?;
            let welcome: Welcome = match frame.msg_type {
                MessageType::Welcome => frame.decode()?,
                MessageType::Rejected => {
                    let rejected: Rejected = frame.decode()?;
                    return Err(Error::HandshakeRejected(rejected.reason));
                }
                other => return Err(Error::ReceivedBadMessage(other)),
            };

            let remote = welcome.peer_info;
            if remote.role != expect.role {
                conn.close(VarInt::from_u32(CLOSE_REJECTED), b"unexpected role");
                return Err(Error::UnexpectedRole {
                    peer: remote.peer_id,
                    expected: expect.role,
                    actual: remote.role,
                });
            }
            if let Some(expected) = expect.peer {
                if expected != remote.peer_id {
                    conn.close(VarInt::from_u32(CLOSE_REJECTED), b"unexpected peer");
                    return Err(Error::UnexpectedPeer {
                        expected,
                        actual: remote.peer_id,
                    });
                }
            }
            if !version::supports(local, welcome.versions) {
                conn.close(VarInt::from_u32(CLOSE_REJECTED), b"unsupported version");
                return Err(Error::VersionMismatch(remote.peer_id));
            }
            debug!(peer = %remote.peer_id, versions = ?welcome.versions, "handshake complete");

            let link = Link {
                conn,
                remote,
                versions: welcome.versions,
                connection_id,
            };
            Ok((link, send, recv))
        }
        .instrument(span);

        with_deadline(settings.handshake_timeout, handshake).await
    }

    /// Completes an incoming connection and performs the responder side of the
    /// handshake. Only peers with `accepted_role` are welcomed.
    pub async fn respond(
        connecting: Connecting,
        local: &PeerInfo,
        accepted_role: PeerRole,
        settings: &TransportSettings,
    ) -> Result<(Self, LinkSendStream, LinkRecvStream), Error> {
        let remote_addr = connecting.remote_address();
        let span = debug_span!("link", remote = %remote_addr, role = "responder");
        let max_len = settings.max_message_bytes;
        let handshake = async move {
            let conn = connecting.await?;
            debug!("waiting for peer to open the link stream");
            let (raw_tx, raw_rx) = conn.accept_bi().await?;
            let mut send = LinkSendStream::new(raw_tx);
            let mut recv = LinkRecvStream::new(raw_rx, max_len);

            let frame = recv.recv().await?.ok_or(Error::HandshakeIncomplete)?;
            if frame.msg_type != MessageType::Hello {
                return Err(Error::ReceivedBadMessage(frame.msg_type));
            }
            let hello: Hello = frame.decode()?;
            let remote = hello.peer_info;
            debug!(peer = %remote.peer_id, "received hello");

            let outcome = if remote.role != accepted_role {
                Err(RejectReason::UnexpectedRole)
            } else if local.is_node() && hello.connection_id.is_none() {
                Err(RejectReason::MissingConnectionId)
            } else {
                version::negotiate(local, &remote).map_err(|_| RejectReason::NoCommonVersion)
            };

            let versions = match outcome {
                Ok(versions) => versions,
                Err(reason) => {
                    debug!(peer = %remote.peer_id, ?reason, "rejecting link");
                    send.send(&Frame::encode(MessageType::Rejected, &Rejected { reason })?)
                        .await?;
                    send.finish().await?;
                    return Err(match reason {
                        RejectReason::UnexpectedRole => Error::UnexpectedRole {
                            peer: remote.peer_id,
                            expected: accepted_role,
                            actual: remote.role,
                        },
                        RejectReason::NoCommonVersion => Error::VersionMismatch(remote.peer_id),
                        RejectReason::MissingConnectionId => Error::HandshakeRejected(reason),
                    });
                }
            };

            let welcome = Welcome {
                peer_info: local.clone(),
                versions,
            };
            send.send(&Frame::encode(MessageType::Welcome, &welcome)?).await?;
            debug!(peer = %remote.peer_id, ?versions, "handshake complete");

            let link = Link {
                conn,
                remote,
                versions,
                connection_id: hello.connection_id,
            };
            Ok((link, send, recv))
        }
        .instrument(span);

        with_deadline(settings.handshake_timeout, handshake).await
    }

    pub fn remote(&self) -> &PeerInfo {
        &self.remote
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.remote.peer_id
    }

    pub fn versions(&self) -> NegotiatedVersions {
        self.versions
    }

    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }

    pub fn id(&self) -> usize {
        self.conn.stable_id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    pub fn rtt(&self) -> Duration {
        self.conn.rtt()
    }

    pub fn close(&self, code: u32, reason: &str) {
        self.conn.close(VarInt::from_u32(code), reason.as_bytes());
    }
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| Error::Timeout)?
}

#[derive(Debug)]
pub struct LinkSendStream(SendStream);

impl LinkSendStream {
    pub fn new(stream: SendStream) -> Self {
        Self(stream)
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), Error> {
        write_frame(&mut self.0, frame).await
    }

    /// Gracefully ends the stream once the peer has acknowledged everything.
    pub async fn finish(&mut self) -> Result<(), Error> {
        self.0.finish().await?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct LinkRecvStream {
    stream: RecvStream,
    max_len: usize,
}

impl LinkRecvStream {
    pub fn new(stream: RecvStream, max_len: usize) -> Self {
        Self { stream, max_len }
    }

    pub async fn recv(&mut self) -> Result<Option<Frame>, Error> {
        read_frame(&mut self.stream, self.max_len).await
    }

    /// Turns the stream into a sequence of frames that ends when the peer
    /// finishes the stream or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Frame, Error>> + Send + Unpin {
        Box::pin(futures::stream::unfold(Some(self), |state| async move {
            let mut this = state?;
            match this.recv().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(this))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        }))
    }
}

/// What the IO tasks of a link report back to the owning loop.
#[derive(Debug)]
pub enum LinkIo {
    Frame(Frame),
    /// A queued frame of this many bytes reached the transport.
    Written(usize),
    /// The link is unusable. `None` means the peer finished cleanly.
    Closed(Option<Error>),
}

/// Reader and writer tasks of one link. Dropping the handle stops both.
#[derive(Debug)]
pub struct LinkTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for LinkTasks {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Spawns the tasks that move frames between a link and the owning loop.
///
/// Frames queued on the returned sender are written in order; every inbound
/// frame and every completed write is reported through `events`, tagged by
/// `wrap`. The writer finishes the stream once the sender is dropped.
pub fn spawn_io<K, E>(
    key: K,
    mut send: LinkSendStream,
    recv: LinkRecvStream,
    events: mpsc::UnboundedSender<E>,
    wrap: fn(K, LinkIo) -> E,
) -> (mpsc::UnboundedSender<Frame>, LinkTasks)
where
    K: Clone + Send + 'static,
    E: Send + 'static,
{
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();

    let reader_key = key.clone();
    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        let mut frames = recv.into_stream();
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(frame) => {
                    trace!(msg_type = ?frame.msg_type, len = frame.body.len(), "received frame");
                    if reader_events
                        .send(wrap(reader_key.clone(), LinkIo::Frame(frame)))
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    let _ = reader_events.send(wrap(reader_key, LinkIo::Closed(Some(e))));
                    return;
                }
            }
        }
        let _ = reader_events.send(wrap(reader_key, LinkIo::Closed(None)));
    });

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let len = frame.wire_len();
            if let Err(e) = send.send(&frame).await {
                let _ = events.send(wrap(key, LinkIo::Closed(Some(e))));
                return;
            }
            if events.send(wrap(key.clone(), LinkIo::Written(len))).is_err() {
                return;
            }
        }
        let _ = send.finish().await;
    });

    (frame_tx, LinkTasks { reader, writer })
}
