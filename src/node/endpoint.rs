use std::{net::SocketAddr, sync::Arc};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, debug_span, Instrument};

use crate::{
    config::TransportSettings,
    error::Error,
    identity::{PeerId, PeerInfo, PeerRole},
    net::{
        link::{spawn_io, Expect, Link, LinkIo, LinkRecvStream, LinkSendStream, LinkTasks, CLOSE_NORMAL},
        tls,
        wire::Frame,
        SERVER_NAME,
    },
    protocol::messages::ConnectionId,
};

pub type Established = (Link, LinkSendStream, LinkRecvStream);

/// What the data endpoint reports to the node loop.
#[derive(Debug)]
pub enum DataEvent {
    /// A peer dialed us and completed the handshake.
    Inbound(Link, LinkSendStream, LinkRecvStream),
    /// A dial started by [`DataEndpoint::dial`] finished.
    Dialed {
        peer: PeerId,
        connection_id: ConnectionId,
        outcome: Result<Established, Error>,
    },
    Io {
        peer: PeerId,
        link_id: usize,
        io: LinkIo,
    },
}

fn tag_io((peer, link_id): (PeerId, usize), io: LinkIo) -> DataEvent {
    DataEvent::Io { peer, link_id, io }
}

/// QUIC endpoint for participant-to-participant data links. Accepts links
/// from other participants and dials the addresses learned during
/// signalling.
pub struct DataEndpoint {
    local: Arc<PeerInfo>,
    endpoint: quinn::Endpoint,
    settings: TransportSettings,
    raw_tx: mpsc::UnboundedSender<DataEvent>,
    raw_rx: mpsc::UnboundedReceiver<DataEvent>,
    acceptor: JoinHandle<()>,
}

impl DataEndpoint {
    pub fn bind(local: PeerInfo, addr: SocketAddr, settings: TransportSettings) -> Result<Self, Error> {
        let endpoint = tls::server_endpoint(addr, &settings)?;
        let local = Arc::new(local);
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(Self::accept_links(
            endpoint.clone(),
            local.clone(),
            settings.clone(),
            raw_tx.clone(),
        ));
        Ok(Self {
            local,
            endpoint,
            settings,
            raw_tx,
            raw_rx,
            acceptor,
        })
    }

    async fn accept_links(
        endpoint: quinn::Endpoint,
        local: Arc<PeerInfo>,
        settings: TransportSettings,
        raw_tx: mpsc::UnboundedSender<DataEvent>,
    ) {
        while let Some(connecting) = endpoint.accept().await {
            let local = local.clone();
            let settings = settings.clone();
            let raw_tx = raw_tx.clone();
            tokio::spawn(async move {
                match Link::respond(connecting, &local, PeerRole::Node, &settings).await {
                    Ok((link, send, recv)) => {
                        let _ = raw_tx.send(DataEvent::Inbound(link, send, recv));
                    }
                    Err(e) => debug!("inbound data link failed: {e}"),
                }
            });
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Dials `peer` in a background task, trying each candidate address in
    /// turn until one completes the handshake.
    pub fn dial(&self, peer: PeerId, connection_id: ConnectionId, candidates: Vec<SocketAddr>) {
        let endpoint = self.endpoint.clone();
        let local = self.local.clone();
        let settings = self.settings.clone();
        let raw_tx = self.raw_tx.clone();
        let span = debug_span!("dial", %peer, %connection_id);
        tokio::spawn(
            async move {
                let mut outcome = Err(Error::ConnectionFailed(peer.clone()));
                for addr in candidates {
                    debug!(%addr, "dialing candidate");
                    let attempt = match endpoint.connect(addr, SERVER_NAME) {
                        Ok(connecting) => {
                            Link::initiate(
                                connecting,
                                &local,
                                Expect::node(peer.clone()),
                                Some(connection_id.clone()),
                                &settings,
                            )
                            .await
                        }
                        Err(e) => Err(e.into()),
                    };
                    match attempt {
                        Ok(established) => {
                            outcome = Ok(established);
                            break;
                        }
                        Err(e) => {
                            debug!(%addr, "candidate failed: {e}");
                            outcome = Err(e);
                        }
                    }
                }
                let _ = raw_tx.send(DataEvent::Dialed {
                    peer,
                    connection_id,
                    outcome,
                });
            }
            .instrument(span),
        );
    }

    /// Starts the IO tasks of an established link; their events arrive
    /// through [`DataEndpoint::next_event`].
    pub fn spawn_io(
        &self,
        link: &Link,
        send: LinkSendStream,
        recv: LinkRecvStream,
    ) -> (mpsc::UnboundedSender<Frame>, LinkTasks) {
        spawn_io(
            (link.peer_id().clone(), link.id()),
            send,
            recv,
            self.raw_tx.clone(),
            tag_io,
        )
    }

    /// Waits for the next event. Cancel safe.
    pub async fn next_event(&mut self) -> Option<DataEvent> {
        self.raw_rx.recv().await
    }

    pub fn shutdown(&mut self) {
        self.acceptor.abort();
        self.endpoint
            .close(quinn::VarInt::from_u32(CLOSE_NORMAL), b"shutdown");
    }
}

impl Drop for DataEndpoint {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}
