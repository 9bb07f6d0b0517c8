use std::{net::SocketAddr, sync::Arc};

use hashbrown::HashMap;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::TransportSettings,
    error::Error,
    identity::{PeerId, PeerInfo, PeerRole},
    net::{
        link::{spawn_io, Link, LinkIo, LinkRecvStream, LinkSendStream, LinkTasks, CLOSE_NORMAL, CLOSE_REPLACED},
        tls,
        wire::Frame,
    },
};

use super::{
    messages::{
        ControlMessage, ErrorCode, ErrorMessage, InstructionMessage, RelayMessage, RequestId,
        StatusMessage, StreamPartitionKey,
    },
    version::VersionNegotiator,
};

/// What the tracker loop learns from its participants.
#[derive(Debug)]
pub enum TrackerServerEvent {
    NodeConnected(PeerInfo),
    NodeDisconnected(PeerId),
    Status {
        from: PeerId,
        message: StatusMessage,
    },
    /// A relay whose originator has already been stamped with the sender's
    /// session identity.
    Relay {
        from: PeerId,
        message: RelayMessage,
    },
}

enum RawEvent {
    Established(Link, LinkSendStream, LinkRecvStream),
    Io { peer: PeerId, link_id: usize, io: LinkIo },
}

fn tag_io((peer, link_id): (PeerId, usize), io: LinkIo) -> RawEvent {
    RawEvent::Io { peer, link_id, io }
}

struct Session {
    link: Link,
    frames: mpsc::UnboundedSender<Frame>,
    _tasks: LinkTasks,
}

/// Tracker side of the control protocol. Owns one session per connected
/// participant; a participant reconnecting under the same id replaces its
/// previous session.
pub struct TrackerServer {
    local: PeerInfo,
    endpoint: quinn::Endpoint,
    sessions: HashMap<PeerId, Session>,
    negotiator: VersionNegotiator,
    raw_tx: mpsc::UnboundedSender<RawEvent>,
    raw_rx: mpsc::UnboundedReceiver<RawEvent>,
    acceptor: JoinHandle<()>,
}

impl TrackerServer {
    pub fn bind(
        local: PeerInfo,
        addr: SocketAddr,
        settings: TransportSettings,
    ) -> Result<Self, Error> {
        let endpoint = tls::server_endpoint(addr, &settings)?;
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(Self::accept_links(
            endpoint.clone(),
            Arc::new(local.clone()),
            settings,
            raw_tx.clone(),
        ));
        Ok(Self {
            negotiator: VersionNegotiator::new(local.clone()),
            local,
            endpoint,
            sessions: HashMap::new(),
            raw_tx,
            raw_rx,
            acceptor,
        })
    }

    /// Accepts incoming links until the endpoint is closed. Each handshake
    /// runs in its own task so a slow peer cannot hold up the others.
    async fn accept_links(
        endpoint: quinn::Endpoint,
        local: Arc<PeerInfo>,
        settings: TransportSettings,
        raw_tx: mpsc::UnboundedSender<RawEvent>,
    ) {
        while let Some(connecting) = endpoint.accept().await {
            let local = local.clone();
            let settings = settings.clone();
            let raw_tx = raw_tx.clone();
            tokio::spawn(async move {
                match Link::respond(connecting, &local, PeerRole::Node, &settings).await {
                    Ok((link, send, recv)) => {
                        let _ = raw_tx.send(RawEvent::Established(link, send, recv));
                    }
                    Err(e) => debug!("inbound control link failed: {e}"),
                }
            });
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn local(&self) -> &PeerInfo {
        &self.local
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn connected_nodes(&self) -> impl Iterator<Item = &PeerId> {
        self.sessions.keys()
    }

    /// Waits for the next event. Cancel safe: nothing is lost if the returned
    /// future is dropped before it completes.
    pub async fn next_event(&mut self) -> Option<TrackerServerEvent> {
        loop {
            let raw = self.raw_rx.recv().await?;
            if let Some(event) = self.handle_raw(raw) {
                return Some(event);
            }
        }
    }

    fn handle_raw(&mut self, raw: RawEvent) -> Option<TrackerServerEvent> {
        match raw {
            RawEvent::Established(link, send, recv) => {
                let peer = link.peer_id().clone();
                if let Err(e) = self.negotiator.accept(&peer, link.versions()) {
                    warn!(%peer, "dropping control link: {e}");
                    link.close(CLOSE_NORMAL, "version");
                    return None;
                }
                let (frames, tasks) = spawn_io(
                    (peer.clone(), link.id()),
                    send,
                    recv,
                    self.raw_tx.clone(),
                    tag_io,
                );
                let remote = link.remote().clone();
                let session = Session {
                    link,
                    frames,
                    _tasks: tasks,
                };
                if let Some(old) = self.sessions.insert(peer.clone(), session) {
                    info!(%peer, "participant reconnected, replacing its session");
                    old.link.close(CLOSE_REPLACED, "replaced");
                } else {
                    info!(%peer, "participant connected");
                }
                Some(TrackerServerEvent::NodeConnected(remote))
            }
            RawEvent::Io { peer, link_id, io } => {
                // events from a replaced session are stale
                let session = self.sessions.get(&peer).filter(|s| s.link.id() == link_id)?;
                match io {
                    LinkIo::Written(_) => None,
                    LinkIo::Frame(frame) => match ControlMessage::from_frame(&frame) {
                        Ok(ControlMessage::Status(message)) => Some(TrackerServerEvent::Status {
                            from: peer,
                            message,
                        }),
                        Ok(ControlMessage::Relay(mut message)) => {
                            message.originator = session.link.remote().clone();
                            Some(TrackerServerEvent::Relay {
                                from: peer,
                                message,
                            })
                        }
                        Ok(other) => {
                            warn!(%peer, "ignoring unexpected control message {other:?}");
                            None
                        }
                        Err(e) => {
                            warn!(%peer, "dropping malformed control message: {e}");
                            None
                        }
                    },
                    LinkIo::Closed(reason) => {
                        match reason {
                            Some(e) => info!(%peer, "participant disconnected: {e}"),
                            None => info!(%peer, "participant disconnected"),
                        }
                        self.remove_session(&peer);
                        Some(TrackerServerEvent::NodeDisconnected(peer))
                    }
                }
            }
        }
    }

    fn remove_session(&mut self, peer: &PeerId) {
        if let Some(session) = self.sessions.remove(peer) {
            session.link.close(CLOSE_NORMAL, "closed");
        }
        self.negotiator.forget(peer);
    }

    fn send(&self, peer: &PeerId, msg: &ControlMessage) -> Result<(), Error> {
        let session = self
            .sessions
            .get(peer)
            .ok_or_else(|| Error::NotConnected(peer.clone()))?;
        session
            .frames
            .send(msg.to_frame()?)
            .map_err(|_| Error::NotConnected(peer.clone()))
    }

    pub fn send_instruction(
        &self,
        peer: &PeerId,
        key: StreamPartitionKey,
        neighbors: Vec<PeerId>,
        counter: u64,
    ) -> Result<(), Error> {
        let msg = ControlMessage::Instruction(InstructionMessage {
            request_id: RequestId::new(),
            key,
            neighbors,
            counter,
        });
        self.send(peer, &msg)
    }

    /// Forwards a relay to its target. Fails with `UnknownPeer` when the
    /// target has no session.
    pub fn send_relay(&self, message: RelayMessage) -> Result<(), Error> {
        if !self.sessions.contains_key(&message.target) {
            return Err(Error::UnknownPeer(message.target));
        }
        let target = message.target.clone();
        self.send(&target, &ControlMessage::Relay(message))
    }

    pub fn send_unknown_peer_error(
        &self,
        peer: &PeerId,
        request_id: RequestId,
        unknown_target: PeerId,
    ) -> Result<(), Error> {
        let msg = ControlMessage::Error(ErrorMessage {
            request_id,
            code: ErrorCode::UnknownPeer,
            target: unknown_target,
        });
        self.send(peer, &msg)
    }

    /// Closes every session and stops accepting links.
    pub fn shutdown(&mut self) {
        self.acceptor.abort();
        for (peer, session) in self.sessions.drain() {
            debug!(%peer, "closing control session");
            session.link.close(CLOSE_NORMAL, "shutdown");
        }
        self.endpoint.close(quinn::VarInt::from_u32(CLOSE_NORMAL), b"shutdown");
    }
}

impl Drop for TrackerServer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}
