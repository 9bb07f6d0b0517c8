use std::{sync::Arc, time::Duration};

use hashbrown::HashMap;
use rand::Rng;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::TransportSettings,
    error::Error,
    identity::{PeerId, PeerInfo},
    net::{
        link::{spawn_io, Expect, Link, LinkIo, LinkRecvStream, LinkSendStream, LinkTasks, CLOSE_NORMAL},
        tls,
        wire::Frame,
        SERVER_NAME,
    },
    registry::TrackerInfo,
};

use super::{
    messages::{
        ControlMessage, ErrorMessage, InstructionMessage, RelayMessage, RelayPayload, RequestId,
        Status, StatusMessage,
    },
    version::VersionNegotiator,
};

/// What a participant learns from its trackers.
#[derive(Debug)]
pub enum ControlEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    ConnectFailed { tracker: PeerId, error: Error },
    Instruction {
        tracker: PeerId,
        message: InstructionMessage,
    },
    Relay {
        tracker: PeerId,
        message: RelayMessage,
    },
    Error {
        tracker: PeerId,
        message: ErrorMessage,
    },
}

enum RawEvent {
    Established(Link, LinkSendStream, LinkRecvStream),
    Failed { tracker: PeerId, error: Error },
    Io { tracker: PeerId, link_id: usize, io: LinkIo },
}

fn tag_io((tracker, link_id): (PeerId, usize), io: LinkIo) -> RawEvent {
    RawEvent::Io {
        tracker,
        link_id,
        io,
    }
}

struct Session {
    link: Link,
    frames: mpsc::UnboundedSender<Frame>,
    _tasks: LinkTasks,
}

/// Participant side of the control protocol. Keeps one session per tracker
/// it has been asked to connect to; connection attempts run in background
/// tasks and report back through [`ParticipantControlClient::next_event`].
pub struct ParticipantControlClient {
    local: Arc<PeerInfo>,
    endpoint: quinn::Endpoint,
    settings: TransportSettings,
    sessions: HashMap<PeerId, Session>,
    connecting: HashMap<PeerId, JoinHandle<()>>,
    negotiator: VersionNegotiator,
    raw_tx: mpsc::UnboundedSender<RawEvent>,
    raw_rx: mpsc::UnboundedReceiver<RawEvent>,
}

impl ParticipantControlClient {
    pub fn new(local: PeerInfo, settings: TransportSettings) -> Result<Self, Error> {
        let endpoint = tls::client_endpoint(&settings)?;
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        Ok(Self {
            negotiator: VersionNegotiator::new(local.clone()),
            local: Arc::new(local),
            endpoint,
            settings,
            sessions: HashMap::new(),
            connecting: HashMap::new(),
            raw_tx,
            raw_rx,
        })
    }

    pub fn is_connected(&self, tracker: &PeerId) -> bool {
        self.sessions.contains_key(tracker)
    }

    pub fn is_connecting(&self, tracker: &PeerId) -> bool {
        self.connecting.contains_key(tracker)
    }

    /// Starts connecting to `tracker` unless a session or an attempt exists.
    pub fn connect(&mut self, tracker: &TrackerInfo) {
        if self.is_connected(&tracker.id) || self.is_connecting(&tracker.id) {
            return;
        }
        let connecting = match self.endpoint.connect(tracker.addr, SERVER_NAME) {
            Ok(connecting) => connecting,
            Err(e) => {
                let _ = self.raw_tx.send(RawEvent::Failed {
                    tracker: tracker.id.clone(),
                    error: e.into(),
                });
                return;
            }
        };
        debug!(tracker = %tracker.id, addr = %tracker.addr, "connecting to tracker");
        let local = self.local.clone();
        let settings = self.settings.clone();
        let raw_tx = self.raw_tx.clone();
        let id = tracker.id.clone();
        let task = tokio::spawn(async move {
            let outcome =
                Link::initiate(connecting, &local, Expect::tracker(id.clone()), None, &settings)
                    .await;
            let _ = raw_tx.send(match outcome {
                Ok((link, send, recv)) => RawEvent::Established(link, send, recv),
                Err(error) => RawEvent::Failed { tracker: id, error },
            });
        });
        self.connecting.insert(tracker.id.clone(), task);
    }

    /// Drops the session with `tracker`, or abandons a pending attempt.
    pub fn disconnect(&mut self, tracker: &PeerId) {
        if let Some(task) = self.connecting.remove(tracker) {
            task.abort();
        }
        if let Some(session) = self.sessions.remove(tracker) {
            session.link.close(CLOSE_NORMAL, "disconnect");
        }
        self.negotiator.forget(tracker);
    }

    /// Waits for the next event. Cancel safe.
    pub async fn next_event(&mut self) -> Option<ControlEvent> {
        loop {
            let raw = self.raw_rx.recv().await?;
            if let Some(event) = self.handle_raw(raw) {
                return Some(event);
            }
        }
    }

    fn handle_raw(&mut self, raw: RawEvent) -> Option<ControlEvent> {
        match raw {
            RawEvent::Established(link, send, recv) => {
                let tracker = link.peer_id().clone();
                // an attempt abandoned by disconnect() may still have completed
                self.connecting.remove(&tracker)?;
                if let Err(error) = self.negotiator.accept(&tracker, link.versions()) {
                    link.close(CLOSE_NORMAL, "version");
                    return Some(ControlEvent::ConnectFailed { tracker, error });
                }
                let (frames, tasks) = spawn_io(
                    (tracker.clone(), link.id()),
                    send,
                    recv,
                    self.raw_tx.clone(),
                    tag_io,
                );
                info!(%tracker, "connected to tracker");
                self.sessions.insert(
                    tracker.clone(),
                    Session {
                        link,
                        frames,
                        _tasks: tasks,
                    },
                );
                Some(ControlEvent::Connected(tracker))
            }
            RawEvent::Failed { tracker, error } => {
                self.connecting.remove(&tracker);
                debug!(%tracker, "could not connect to tracker: {error}");
                Some(ControlEvent::ConnectFailed { tracker, error })
            }
            RawEvent::Io {
                tracker,
                link_id,
                io,
            } => {
                self.sessions
                    .get(&tracker)
                    .filter(|s| s.link.id() == link_id)?;
                match io {
                    LinkIo::Written(_) => None,
                    LinkIo::Frame(frame) => match ControlMessage::from_frame(&frame) {
                        Ok(ControlMessage::Instruction(message)) => {
                            Some(ControlEvent::Instruction { tracker, message })
                        }
                        Ok(ControlMessage::Relay(message)) => {
                            Some(ControlEvent::Relay { tracker, message })
                        }
                        Ok(ControlMessage::Error(message)) => {
                            Some(ControlEvent::Error { tracker, message })
                        }
                        Ok(ControlMessage::Status(_)) => {
                            warn!(%tracker, "tracker sent a status message, ignoring");
                            None
                        }
                        Err(e) => {
                            warn!(%tracker, "dropping malformed control message: {e}");
                            None
                        }
                    },
                    LinkIo::Closed(reason) => {
                        match reason {
                            Some(e) => info!(%tracker, "lost tracker connection: {e}"),
                            None => info!(%tracker, "tracker closed the connection"),
                        }
                        self.sessions.remove(&tracker);
                        self.negotiator.forget(&tracker);
                        Some(ControlEvent::Disconnected(tracker))
                    }
                }
            }
        }
    }

    fn send(&self, tracker: &PeerId, msg: &ControlMessage) -> Result<(), Error> {
        let session = self
            .sessions
            .get(tracker)
            .ok_or_else(|| Error::NotConnected(tracker.clone()))?;
        session
            .frames
            .send(msg.to_frame()?)
            .map_err(|_| Error::NotConnected(tracker.clone()))
    }

    pub fn send_status(&self, tracker: &PeerId, status: Status) -> Result<RequestId, Error> {
        let request_id = RequestId::new();
        let msg = ControlMessage::Status(StatusMessage {
            request_id: request_id.clone(),
            status,
        });
        self.send(tracker, &msg)?;
        Ok(request_id)
    }

    /// Sends negotiation data to `target` through `tracker`.
    pub fn send_relay(
        &self,
        tracker: &PeerId,
        request_id: RequestId,
        target: PeerId,
        payload: RelayPayload,
    ) -> Result<(), Error> {
        let msg = ControlMessage::Relay(RelayMessage {
            request_id,
            originator: (*self.local).clone(),
            target,
            payload,
        });
        self.send(tracker, &msg)
    }

    /// Closes every session and abandons pending attempts.
    pub fn shutdown(&mut self) {
        for (_, task) in self.connecting.drain() {
            task.abort();
        }
        for (tracker, session) in self.sessions.drain() {
            debug!(%tracker, "closing control session");
            session.link.close(CLOSE_NORMAL, "shutdown");
        }
        self.endpoint
            .close(quinn::VarInt::from_u32(CLOSE_NORMAL), b"shutdown");
    }
}

impl Drop for ParticipantControlClient {
    fn drop(&mut self) {
        for (_, task) in self.connecting.drain() {
            task.abort();
        }
    }
}

/// Capped exponential backoff with jitter for reconnect attempts.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    /// Delay before the next attempt: a random point in the upper half of
    /// `min(max, base * 2^attempts)`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts.min(16)).unwrap_or(u32::MAX);
        let ceiling = self.base.saturating_mul(factor).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        let half = ceiling / 2;
        let jitter = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
