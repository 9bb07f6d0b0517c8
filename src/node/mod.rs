// The participant process. One task owns the stream states, the connection
// records and both endpoints. It applies tracker instructions, negotiates data
// connections through the tracker, reports its neighbours and relays stream
// messages along the overlay.

pub mod connection;
pub mod endpoint;
pub mod expiring;
pub mod signaller;

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    time::Duration,
};

use chrono::Utc;
use hashbrown::HashMap;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use crate::{
    config::NodeConfig,
    error::Error,
    hex::random_uuid,
    identity::{PeerId, PeerInfo},
    metrics,
    net::{
        link::{Link, LinkIo, LinkRecvStream, LinkSendStream, CLOSE_REJECTED, CLOSE_REPLACED},
        wire::{Frame, MessageType},
    },
    protocol::{
        control_client::{Backoff, ControlEvent, ParticipantControlClient},
        messages::{
            ConnectionId, ErrorMessage, InstructionMessage, RequestId, RttSample, Status,
            StreamPartitionKey, StreamStatus,
        },
        node_to_node::{
            BroadcastMessage, MessageId, MessageRef, NodeMessage, StreamMessage, UnicastMessage,
        },
        requests::PendingRequests,
    },
};

use self::{
    connection::{BackPressureSignal, ConnectionInfo, ConnectionRecord, Direction, SendQueue},
    endpoint::{DataEndpoint, DataEvent},
    expiring::ExpiringSet,
    signaller::{is_offerer, RtcSignaller, Signal},
};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(100);

/// Notifications for the layer above the overlay, delivered at most once per
/// occurrence.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
    ConnectedToTracker(PeerId),
    DisconnectedFromTracker(PeerId),
    NodeConnected(PeerId),
    NodeDisconnected(PeerId),
    InstructionApplied {
        key: StreamPartitionKey,
        neighbors: Vec<PeerId>,
        counter: u64,
    },
    /// Upstream production towards this peer should pause.
    BackPressureHigh(PeerId),
    BackPressureLow(PeerId),
    BroadcastReceived {
        from: PeerId,
        message: BroadcastMessage,
    },
    /// A unicast that does not answer one of our requests.
    UnicastReceived {
        from: PeerId,
        message: UnicastMessage,
    },
    /// The tracker could not relay negotiation data to `target`.
    RelayError { tracker: PeerId, target: PeerId },
}

type Reply<T> = oneshot::Sender<Result<T, Error>>;

enum Command {
    Subscribe(StreamPartitionKey, Reply<()>),
    Unsubscribe(StreamPartitionKey, Reply<()>),
    Publish {
        key: StreamPartitionKey,
        payload: Vec<u8>,
        reply: Reply<MessageId>,
    },
    Broadcast(BroadcastMessage, Reply<()>),
    SendUnicast {
        peer: PeerId,
        message: UnicastMessage,
        reply: Reply<()>,
    },
    Request {
        peer: PeerId,
        key: StreamPartitionKey,
        payload: Vec<u8>,
        reply: Reply<UnicastMessage>,
    },
    ConnectToNode {
        key: StreamPartitionKey,
        peer: PeerId,
        reply: Reply<()>,
    },
    DisconnectFromNode(PeerId, Reply<()>),
    Neighbors(StreamPartitionKey, Reply<Vec<PeerId>>),
    Connections(Reply<Vec<ConnectionInfo>>),
    Stop(Reply<()>),
}

/// Handle to a running participant.
pub struct Node {
    id: PeerId,
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl Node {
    /// Binds the data endpoint and starts the node loop. Trackers are
    /// connected to lazily, on the first subscription to one of their
    /// streams.
    pub async fn start(
        config: NodeConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NodeEvent>), Error> {
        config.validate()?;
        let local = PeerInfo::new_node(config.id.clone()).with_location(config.location.clone());
        let endpoint = DataEndpoint::bind(local.clone(), config.listen_addr, config.transport.clone())?;
        let local_addr = endpoint.local_addr()?;
        let control = ParticipantControlClient::new(local, config.transport.clone())?;
        let addresses = if config.advertised_addrs.is_empty() {
            vec![local_addr]
        } else {
            config.advertised_addrs.clone()
        };
        info!(id = %config.id, %local_addr, ?addresses, "node listening");

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let span = debug_span!("node", id = %config.id);
        let id = config.id.clone();
        let task = tokio::spawn(
            NodeLoop {
                signaller: RtcSignaller::new(id.clone(), addresses, config.negotiation_timeout),
                chain_id: random_uuid(),
                config,
                control,
                endpoint,
                events,
                streams: BTreeMap::new(),
                connections: HashMap::new(),
                requests: PendingRequests::new(),
                seen: ExpiringSet::new(),
                chains: HashMap::new(),
                reconnects: HashMap::new(),
            }
            .run(commands_rx)
            .instrument(span),
        );

        Ok((
            Self {
                id,
                local_addr,
                commands,
                task,
            },
            events_rx,
        ))
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Bound address of the data endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    /// Joins the overlay of `key` and reports to its tracker.
    pub async fn subscribe(&self, key: StreamPartitionKey) -> Result<(), Error> {
        self.call(|reply| Command::Subscribe(key, reply)).await
    }

    /// Leaves the overlay of `key`, closing connections no other stream
    /// needs.
    pub async fn unsubscribe(&self, key: StreamPartitionKey) -> Result<(), Error> {
        self.call(|reply| Command::Unsubscribe(key, reply)).await
    }

    /// Publishes `payload` to every neighbour of `key` as a broadcast without
    /// a request id.
    pub async fn publish(
        &self,
        key: StreamPartitionKey,
        payload: impl Into<Vec<u8>>,
    ) -> Result<MessageId, Error> {
        let payload = payload.into();
        self.call(|reply| Command::Publish {
            key,
            payload,
            reply,
        })
        .await
    }

    /// Sends a prepared broadcast to every neighbour of its key.
    pub async fn broadcast(&self, message: BroadcastMessage) -> Result<(), Error> {
        self.call(|reply| Command::Broadcast(message, reply)).await
    }

    /// Sends `message` to one connected peer. Replying to a received
    /// unicast means sending one with the same request id.
    pub async fn send_unicast(&self, peer: PeerId, message: UnicastMessage) -> Result<(), Error> {
        self.call(|reply| Command::SendUnicast {
            peer,
            message,
            reply,
        })
        .await
    }

    /// Sends a unicast with a fresh request id and waits for the reply that
    /// carries it.
    pub async fn request(
        &self,
        peer: PeerId,
        key: StreamPartitionKey,
        payload: impl Into<Vec<u8>>,
    ) -> Result<UnicastMessage, Error> {
        let payload = payload.into();
        self.call(|reply| Command::Request {
            peer,
            key,
            payload,
            reply,
        })
        .await
    }

    /// Adds `peer` as a neighbour for `key` and resolves once the data
    /// connection is up.
    pub async fn connect_to_node(&self, key: StreamPartitionKey, peer: PeerId) -> Result<(), Error> {
        self.call(|reply| Command::ConnectToNode { key, peer, reply })
            .await
    }

    pub async fn disconnect_from_node(&self, peer: PeerId) -> Result<(), Error> {
        self.call(|reply| Command::DisconnectFromNode(peer, reply))
            .await
    }

    /// Neighbours of `key` with an established connection.
    pub async fn neighbors(&self, key: StreamPartitionKey) -> Result<Vec<PeerId>, Error> {
        self.call(|reply| Command::Neighbors(key, reply)).await
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, Error> {
        self.call(Command::Connections).await
    }

    /// Closes every connection and stops the loop and its timers.
    pub async fn stop(self) -> Result<(), Error> {
        self.call(Command::Stop).await?;
        let _ = self.task.await;
        Ok(())
    }
}

struct StreamState {
    tracker: PeerId,
    /// Highest instruction counter applied, or our own bump since.
    counter: u64,
    neighbors: BTreeSet<PeerId>,
}

struct Reconnect {
    backoff: Backoff,
    at: Option<Instant>,
}

type Waiter = oneshot::Sender<Result<(), Error>>;

struct NodeLoop {
    config: NodeConfig,
    control: ParticipantControlClient,
    endpoint: DataEndpoint,
    signaller: RtcSignaller,
    events: mpsc::UnboundedSender<NodeEvent>,
    streams: BTreeMap<StreamPartitionKey, StreamState>,
    /// At most one record per remote peer, negotiating or connected.
    connections: HashMap<PeerId, ConnectionRecord>,
    requests: PendingRequests<Reply<UnicastMessage>>,
    seen: ExpiringSet<MessageId>,
    chain_id: String,
    chains: HashMap<StreamPartitionKey, MessageRef>,
    reconnects: HashMap<PeerId, Reconnect>,
}

impl NodeLoop {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut housekeeping = time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        // the handle was dropped without stop()
                        self.shutdown();
                        return;
                    };
                    if !self.handle_command(command) {
                        return;
                    }
                }
                Some(event) = self.control.next_event() => self.handle_control(event),
                Some(event) = self.endpoint.next_event() => self.handle_data(event),
                _ = housekeeping.tick() => self.housekeeping(Instant::now()),
            }
        }
    }

    /// Returns false once the loop should exit.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Subscribe(key, reply) => {
                let _ = reply.send(self.subscribe(key));
            }
            Command::Unsubscribe(key, reply) => {
                let _ = reply.send(self.unsubscribe(&key));
            }
            Command::Publish {
                key,
                payload,
                reply,
            } => {
                let _ = reply.send(self.publish(key, payload));
            }
            Command::Broadcast(message, reply) => {
                let _ = reply.send(self.broadcast(message));
            }
            Command::SendUnicast {
                peer,
                message,
                reply,
            } => {
                let _ = reply.send(self.send_message(&peer, &NodeMessage::Unicast(message)));
            }
            Command::Request {
                peer,
                key,
                payload,
                reply,
            } => self.request(peer, key, payload, reply),
            Command::ConnectToNode { key, peer, reply } => self.connect_to_node(key, peer, reply),
            Command::DisconnectFromNode(peer, reply) => {
                self.disconnect_from_node(&peer);
                let _ = reply.send(Ok(()));
            }
            Command::Neighbors(key, reply) => {
                let _ = reply.send(Ok(self.connected_neighbors(&key)));
            }
            Command::Connections(reply) => {
                let infos = self.connections.values().map(ConnectionRecord::info).collect();
                let _ = reply.send(Ok(infos));
            }
            Command::Stop(reply) => {
                self.shutdown();
                info!("node stopped");
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn subscribe(&mut self, key: StreamPartitionKey) -> Result<(), Error> {
        if self.streams.contains_key(&key) {
            return Ok(());
        }
        let tracker = self
            .config
            .trackers
            .tracker_for(&key.stream_id)
            .cloned()
            .ok_or_else(|| Error::NoTracker(key.stream_id.clone()))?;
        info!(%key, tracker = %tracker.id, "subscribed");
        self.streams.insert(
            key.clone(),
            StreamState {
                tracker: tracker.id.clone(),
                counter: 0,
                neighbors: BTreeSet::new(),
            },
        );
        if self.control.is_connected(&tracker.id) {
            self.report(&key);
        } else if !self.reconnects.contains_key(&tracker.id) {
            // the full status goes out once the session is up
            self.control.connect(&tracker);
        }
        Ok(())
    }

    fn unsubscribe(&mut self, key: &StreamPartitionKey) -> Result<(), Error> {
        let state = self
            .streams
            .remove(key)
            .ok_or_else(|| Error::NotSubscribed(key.clone()))?;
        info!(%key, "unsubscribed");
        for peer in &state.neighbors {
            if !self.is_neighbor(peer) {
                self.retire(peer, "unsubscribed");
            }
        }
        // a full snapshot without the key tells the tracker we left
        self.report_all(&state.tracker);
        Ok(())
    }

    fn is_neighbor(&self, peer: &PeerId) -> bool {
        self.streams.values().any(|s| s.neighbors.contains(peer))
    }

    fn connected_neighbors(&self, key: &StreamPartitionKey) -> Vec<PeerId> {
        let Some(state) = self.streams.get(key) else {
            return Vec::new();
        };
        state
            .neighbors
            .iter()
            .filter(|peer| self.connections.get(*peer).map_or(false, ConnectionRecord::is_connected))
            .cloned()
            .collect()
    }

    fn stream_status(&self, key: &StreamPartitionKey, state: &StreamState) -> StreamStatus {
        let mut inbound = Vec::new();
        let mut outbound = Vec::new();
        for peer in &state.neighbors {
            match self.connections.get(peer) {
                Some(record) if record.is_connected() => match record.direction {
                    Direction::Inbound => inbound.push(peer.clone()),
                    Direction::Outbound => outbound.push(peer.clone()),
                },
                _ => {}
            }
        }
        StreamStatus {
            key: key.clone(),
            inbound,
            outbound,
            counter: state.counter,
        }
    }

    fn rtts(&self) -> Vec<RttSample> {
        self.connections
            .values()
            .filter_map(|record| {
                record.link().map(|link| RttSample {
                    peer: record.peer.clone(),
                    rtt_micros: link.rtt().as_micros() as u64,
                })
            })
            .collect()
    }

    /// Reports the current neighbours of one key.
    fn report(&self, key: &StreamPartitionKey) {
        let Some(state) = self.streams.get(key) else {
            return;
        };
        let status = Status {
            streams: vec![self.stream_status(key, state)],
            rtts: self.rtts(),
            location: self.config.location.clone(),
            single_stream: true,
        };
        self.send_status(&state.tracker, status);
    }

    /// Reports every key `tracker` coordinates for us, as a full snapshot.
    fn report_all(&self, tracker: &PeerId) {
        let streams = self
            .streams
            .iter()
            .filter(|(_, state)| &state.tracker == tracker)
            .map(|(key, state)| self.stream_status(key, state))
            .collect();
        let status = Status {
            streams,
            rtts: self.rtts(),
            location: self.config.location.clone(),
            single_stream: false,
        };
        self.send_status(tracker, status);
    }

    fn send_status(&self, tracker: &PeerId, status: Status) {
        trace!(%tracker, streams = status.streams.len(), "sending status");
        if let Err(e) = self.control.send_status(tracker, status) {
            debug!(%tracker, "status not sent: {e}");
        }
    }

    /// Records a neighbour change we made ourselves.
    fn bump(&mut self, keys: &[StreamPartitionKey]) {
        for key in keys {
            if let Some(state) = self.streams.get_mut(key) {
                state.counter += 1;
            }
            self.report(key);
        }
    }

    /// Removes `peer` from the neighbours of every key and reports the
    /// change.
    fn drop_neighbor(&mut self, peer: &PeerId) {
        let keys: Vec<StreamPartitionKey> = self
            .streams
            .iter_mut()
            .filter_map(|(key, state)| state.neighbors.remove(peer).then(|| key.clone()))
            .collect();
        self.bump(&keys);
    }

    /// Closes the connection with `peer` without touching neighbour sets.
    fn retire(&mut self, peer: &PeerId, reason: &str) {
        if let Some(mut record) = self.connections.remove(peer) {
            let was_connected = record.is_connected();
            debug!(%peer, connection_id = %record.connection_id, reason, "closing connection");
            record.close(reason);
            self.signaller.forget(peer);
            if was_connected {
                self.emit(NodeEvent::NodeDisconnected(peer.clone()));
            }
        }
    }

    /// Fails the record of `peer` and forgets it as a neighbour.
    fn fail_connection(&mut self, peer: &PeerId, error: impl Fn() -> Error) {
        if let Some(mut record) = self.connections.remove(peer) {
            let was_connected = record.is_connected();
            record.fail(error);
            self.signaller.forget(peer);
            if was_connected {
                self.emit(NodeEvent::NodeDisconnected(peer.clone()));
            }
        }
        self.drop_neighbor(peer);
    }

    fn send_queue(&self) -> SendQueue {
        SendQueue::new(
            self.config.transport.high_water_mark,
            self.config.transport.low_water_mark,
        )
    }

    fn negotiating_record(
        &self,
        peer: &PeerId,
        connection_id: ConnectionId,
        tracker: &PeerId,
        direction: Direction,
        now: Instant,
    ) -> ConnectionRecord {
        ConnectionRecord::negotiating(
            peer.clone(),
            connection_id,
            tracker.clone(),
            direction,
            now + self.config.negotiation_timeout,
            self.send_queue(),
        )
    }

    /// Starts negotiating with `peer` unless a record exists already.
    fn ensure_connection(&mut self, peer: &PeerId, tracker: &PeerId, waiter: Option<Waiter>) {
        if let Some(record) = self.connections.get_mut(peer) {
            if let Some(waiter) = waiter {
                record.add_waiter(waiter);
            }
            return;
        }
        let now = Instant::now();
        let connection_id = ConnectionId::new();
        let offerer = is_offerer(&self.config.id, peer);
        let direction = if offerer {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        let mut record = self.negotiating_record(peer, connection_id.clone(), tracker, direction, now);
        if let Some(waiter) = waiter {
            record.add_waiter(waiter);
        }
        let sent = if offerer {
            self.signaller
                .offer(&self.control, tracker, peer, &connection_id, now)
        } else {
            self.signaller
                .connect(&self.control, tracker, peer, &connection_id, now)
        };
        match sent {
            Ok(()) => {
                debug!(%peer, %connection_id, offerer, "negotiating connection");
                self.connections.insert(peer.clone(), record);
            }
            Err(e) => {
                debug!(%peer, "could not start negotiation: {e}");
                let tracker = tracker.clone();
                record.fail(move || Error::NotConnected(tracker.clone()));
            }
        }
    }

    fn connect_to_node(&mut self, key: StreamPartitionKey, peer: PeerId, reply: Reply<()>) {
        let Some(state) = self.streams.get_mut(&key) else {
            let _ = reply.send(Err(Error::NotSubscribed(key)));
            return;
        };
        let added = state.neighbors.insert(peer.clone());
        let tracker = state.tracker.clone();
        let connected = self
            .connections
            .get(&peer)
            .map_or(false, ConnectionRecord::is_connected);
        self.ensure_connection(&peer, &tracker, Some(reply));
        if connected && added {
            self.bump(&[key]);
        }
    }

    fn disconnect_from_node(&mut self, peer: &PeerId) {
        self.retire(peer, "disconnect requested");
        self.drop_neighbor(peer);
    }

    fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Connected(tracker) => {
                self.reconnects.remove(&tracker);
                self.emit(NodeEvent::ConnectedToTracker(tracker.clone()));
                if self.streams.values().any(|s| s.tracker == tracker) {
                    self.report_all(&tracker);
                }
            }
            ControlEvent::Disconnected(tracker) => {
                self.emit(NodeEvent::DisconnectedFromTracker(tracker.clone()));
                self.schedule_reconnect(tracker);
            }
            ControlEvent::ConnectFailed { tracker, error } => {
                debug!(%tracker, "tracker connection failed: {error}");
                self.schedule_reconnect(tracker);
            }
            ControlEvent::Instruction { tracker, message } => {
                self.handle_instruction(tracker, message)
            }
            ControlEvent::Relay { tracker, message } => {
                if let Some(signal) = self.signaller.handle_relay(message) {
                    self.handle_signal(tracker, signal);
                }
            }
            ControlEvent::Error { tracker, message } => self.handle_relay_error(tracker, message),
        }
    }

    fn schedule_reconnect(&mut self, tracker: PeerId) {
        if !self.streams.values().any(|s| s.tracker == tracker) {
            self.reconnects.remove(&tracker);
            return;
        }
        let (base, max) = (
            self.config.reconnect_base_delay,
            self.config.reconnect_max_delay,
        );
        let reconnect = self
            .reconnects
            .entry(tracker.clone())
            .or_insert_with(|| Reconnect {
                backoff: Backoff::new(base, max),
                at: None,
            });
        let delay = reconnect.backoff.next_delay();
        reconnect.at = Some(Instant::now() + delay);
        debug!(%tracker, ?delay, attempt = reconnect.backoff.attempts(), "scheduling tracker reconnect");
    }

    fn handle_instruction(&mut self, tracker: PeerId, message: InstructionMessage) {
        let InstructionMessage {
            key,
            neighbors,
            counter,
            ..
        } = message;
        let local = &self.config.id;
        let Some(state) = self.streams.get_mut(&key) else {
            debug!(%key, "instruction for a stream we are not in");
            return;
        };
        if counter < state.counter {
            debug!(%key, counter, current = state.counter, "ignoring stale instruction");
            return;
        }
        let target: BTreeSet<PeerId> = neighbors.into_iter().filter(|peer| peer != local).collect();
        let removed: Vec<PeerId> = state.neighbors.difference(&target).cloned().collect();
        state.counter = counter;
        state.neighbors = target.clone();
        let coordinator = state.tracker.clone();
        if coordinator != tracker {
            warn!(%key, %tracker, %coordinator, "instruction from a tracker not coordinating this stream");
        }

        for peer in removed {
            if !self.is_neighbor(&peer) {
                self.retire(&peer, "no longer a neighbour");
            }
        }
        for peer in &target {
            self.ensure_connection(peer, &coordinator, None);
        }
        // echoes the counter so the tracker sees the instruction arrived
        self.report(&key);

        debug!(%key, counter, neighbors = ?target, "applied instruction");
        self.config
            .metrics
            .increment(metrics::NODE_INSTRUCTIONS_APPLIED, 1);
        self.emit(NodeEvent::InstructionApplied {
            key,
            neighbors: target.into_iter().collect(),
            counter,
        });
    }

    fn handle_signal(&mut self, tracker: PeerId, signal: Signal) {
        match signal {
            Signal::Offer {
                from,
                connection_id,
                addr,
                request_id,
            } => {
                let peer = from.peer_id;
                debug!(%peer, %connection_id, %addr, "received offer");
                let reusable = self
                    .connections
                    .get(&peer)
                    .map_or(false, |r| r.connection_id == connection_id && r.is_negotiating());
                if !reusable {
                    let mut waiters = Vec::new();
                    if let Some(mut old) = self.connections.remove(&peer) {
                        // the remote started over; the old link is gone for it
                        waiters = old.take_waiters();
                        let was_connected = old.is_connected();
                        old.close("replaced");
                        if was_connected {
                            self.emit(NodeEvent::NodeDisconnected(peer.clone()));
                        }
                    }
                    let mut record = self.negotiating_record(
                        &peer,
                        connection_id.clone(),
                        &tracker,
                        Direction::Inbound,
                        Instant::now(),
                    );
                    for waiter in waiters {
                        record.add_waiter(waiter);
                    }
                    self.connections.insert(peer.clone(), record);
                }
                if let Err(e) =
                    self.signaller
                        .answer(&self.control, &tracker, &peer, &connection_id, request_id)
                {
                    debug!(%peer, "could not answer offer: {e}");
                    let tracker = tracker.clone();
                    self.fail_connection(&peer, move || Error::NotConnected(tracker.clone()));
                }
            }
            Signal::Answer {
                from,
                connection_id,
                addr,
            } => match self.connections.get_mut(&from) {
                Some(record)
                    if record.connection_id == connection_id
                        && record.is_negotiating()
                        && !record.dialing =>
                {
                    record.dialing = true;
                    let mut candidates = vec![addr];
                    candidates.extend(record.candidates.drain(..).filter(|c| *c != addr));
                    debug!(peer = %from, %connection_id, ?candidates, "answer received, dialing");
                    self.endpoint.dial(from, connection_id, candidates);
                }
                _ => debug!(peer = %from, %connection_id, "answer for a retired connection"),
            },
            Signal::Candidate {
                from,
                connection_id,
                addr,
            } => match self.connections.get_mut(&from) {
                Some(record)
                    if record.connection_id == connection_id
                        && record.is_negotiating()
                        && !record.dialing =>
                {
                    if !record.candidates.contains(&addr) {
                        record.candidates.push(addr);
                    }
                }
                _ => trace!(peer = %from, %connection_id, "dropping late candidate"),
            },
            Signal::Connect {
                from,
                connection_id,
            } => {
                match self.connections.get(&from).map(ConnectionRecord::is_connected) {
                    Some(true) => {
                        // the remote lost its side of the link without us noticing
                        debug!(peer = %from, %connection_id, "connect request over a live link, replacing it");
                        self.retire(&from, "replaced");
                    }
                    Some(false) => {
                        debug!(peer = %from, "connect request while already connecting");
                        return;
                    }
                    None => {}
                }
                let now = Instant::now();
                let record = self.negotiating_record(
                    &from,
                    connection_id.clone(),
                    &tracker,
                    Direction::Outbound,
                    now,
                );
                match self
                    .signaller
                    .offer(&self.control, &tracker, &from, &connection_id, now)
                {
                    Ok(()) => {
                        debug!(peer = %from, %connection_id, "offering on request");
                        self.connections.insert(from, record);
                    }
                    Err(e) => debug!(peer = %from, "could not offer: {e}"),
                }
            }
        }
    }

    fn handle_relay_error(&mut self, tracker: PeerId, message: ErrorMessage) {
        match self.signaller.handle_error(&message) {
            Some((peer, connection_id)) => {
                debug!(%peer, %connection_id, code = ?message.code, "negotiation could not be relayed");
                let current = self
                    .connections
                    .get(&peer)
                    .map_or(false, |r| r.connection_id == connection_id && r.is_negotiating());
                if current {
                    let target = peer.clone();
                    self.fail_connection(&peer, move || Error::UnknownPeer(target.clone()));
                }
            }
            None => debug!(target = %message.target, "error for a request that is no longer pending"),
        }
        self.emit(NodeEvent::RelayError {
            tracker,
            target: message.target,
        });
    }

    fn handle_data(&mut self, event: DataEvent) {
        match event {
            DataEvent::Inbound(link, send, recv) => {
                let peer = link.peer_id().clone();
                let expected = link.connection_id().map_or(false, |cid| {
                    self.connections
                        .get(&peer)
                        .map_or(false, |r| &r.connection_id == cid && r.is_negotiating())
                });
                if expected {
                    self.establish(link, send, recv);
                } else {
                    debug!(%peer, "inbound link for no pending connection");
                    link.close(CLOSE_REJECTED, "unexpected connection");
                }
            }
            DataEvent::Dialed {
                peer,
                connection_id,
                outcome,
            } => {
                let current = self
                    .connections
                    .get(&peer)
                    .map_or(false, |r| r.connection_id == connection_id && r.is_negotiating());
                match outcome {
                    Ok((link, send, recv)) if current => self.establish(link, send, recv),
                    Ok((link, _, _)) => link.close(CLOSE_REPLACED, "retired"),
                    Err(e) if current => {
                        debug!(%peer, %connection_id, "dial failed: {e}");
                        let target = peer.clone();
                        self.fail_connection(&peer, move || Error::ConnectionFailed(target.clone()));
                    }
                    Err(e) => trace!(%peer, "dial for a retired connection failed: {e}"),
                }
            }
            DataEvent::Io { peer, link_id, io } => {
                let live = self
                    .connections
                    .get(&peer)
                    .map_or(false, |r| r.link_id() == Some(link_id));
                if !live {
                    return;
                }
                match io {
                    LinkIo::Written(len) => {
                        let signal = self.connections.get_mut(&peer).and_then(|r| r.written(len));
                        if let Some(signal) = signal {
                            self.back_pressure(&peer, signal);
                        }
                    }
                    LinkIo::Frame(frame) => self.handle_frame(peer, frame),
                    LinkIo::Closed(reason) => {
                        match reason {
                            Some(e) => info!(%peer, "lost connection: {e}"),
                            None => info!(%peer, "connection closed by peer"),
                        }
                        if let Some(mut record) = self.connections.remove(&peer) {
                            record.close("closed");
                        }
                        self.signaller.forget(&peer);
                        self.emit(NodeEvent::NodeDisconnected(peer.clone()));
                        self.drop_neighbor(&peer);
                    }
                }
            }
        }
    }

    fn establish(&mut self, link: Link, send: LinkSendStream, recv: LinkRecvStream) {
        let peer = link.peer_id().clone();
        let versions = link.versions();
        let (frames, tasks) = self.endpoint.spawn_io(&link, send, recv);
        let Some(record) = self.connections.get_mut(&peer) else {
            return;
        };
        if let Err(e) = record.attach(link, frames, tasks) {
            warn!(%peer, "could not attach link: {e}");
            return;
        }
        info!(%peer, connection_id = %record.connection_id, ?versions, "connected to node");
        self.emit(NodeEvent::NodeConnected(peer.clone()));
        let keys: Vec<StreamPartitionKey> = self
            .streams
            .iter()
            .filter(|(_, state)| state.neighbors.contains(&peer))
            .map(|(key, _)| key.clone())
            .collect();
        self.bump(&keys);
    }

    fn back_pressure(&self, peer: &PeerId, signal: BackPressureSignal) {
        match signal {
            BackPressureSignal::High => {
                debug!(%peer, "back pressure high");
                self.config
                    .metrics
                    .increment(metrics::NODE_BACK_PRESSURE_HIGH, 1);
                self.emit(NodeEvent::BackPressureHigh(peer.clone()));
            }
            BackPressureSignal::Low => {
                debug!(%peer, "back pressure low");
                self.emit(NodeEvent::BackPressureLow(peer.clone()));
            }
        }
    }

    /// Refuses frames the remote reader would reject, which would cost us the
    /// link.
    fn check_size(&self, frame: &Frame) -> Result<(), Error> {
        let max = self.config.transport.max_message_bytes;
        if frame.body.len() > max {
            return Err(Error::MessageTooLarge {
                len: frame.body.len(),
                max,
            });
        }
        Ok(())
    }

    fn send_frame(&mut self, peer: &PeerId, frame: Frame) -> Result<(), Error> {
        self.check_size(&frame)?;
        let record = self
            .connections
            .get_mut(peer)
            .ok_or_else(|| Error::NotConnected(peer.clone()))?;
        let signal = record.send(frame)?;
        if let Some(signal) = signal {
            self.back_pressure(peer, signal);
        }
        Ok(())
    }

    fn send_message(&mut self, peer: &PeerId, message: &NodeMessage) -> Result<(), Error> {
        self.send_frame(peer, message.to_frame()?)
    }

    /// Sends a broadcast to every connected neighbour of `key` except
    /// `source`.
    fn propagate(
        &mut self,
        key: &StreamPartitionKey,
        message: &BroadcastMessage,
        source: Option<&PeerId>,
    ) -> Result<(), Error> {
        let frame = Frame::encode(MessageType::Broadcast, message)?;
        self.check_size(&frame)?;
        let targets: Vec<PeerId> = self
            .connected_neighbors(key)
            .into_iter()
            .filter(|peer| Some(peer) != source)
            .collect();
        for peer in targets {
            if let Err(e) = self.send_frame(&peer, frame.clone()) {
                debug!(%peer, "could not forward broadcast: {e}");
            }
        }
        Ok(())
    }

    fn next_message(&mut self, key: StreamPartitionKey, payload: Vec<u8>) -> StreamMessage {
        let now = Utc::now().timestamp_millis();
        let prev = self.chains.get(&key).copied();
        let (timestamp, sequence) = match prev {
            Some(prev) if prev.timestamp >= now => (prev.timestamp, prev.sequence.saturating_add(1)),
            _ => (now, 0),
        };
        self.chains.insert(key.clone(), MessageRef { timestamp, sequence });
        StreamMessage {
            id: MessageId {
                key,
                timestamp,
                sequence,
                publisher_id: self.config.id.clone(),
                chain_id: self.chain_id.clone(),
            },
            prev,
            payload,
        }
    }

    fn publish(&mut self, key: StreamPartitionKey, payload: Vec<u8>) -> Result<MessageId, Error> {
        if !self.streams.contains_key(&key) {
            return Err(Error::NotSubscribed(key));
        }
        let previous = self.chains.get(&key).copied();
        let message = self.next_message(key.clone(), payload);
        let id = message.id.clone();
        let sent = self.broadcast(BroadcastMessage {
            request_id: RequestId::none(),
            message,
        });
        if let Err(e) = sent {
            // nothing went out, so the chain does not advance
            match previous {
                Some(prev) => self.chains.insert(key, prev),
                None => self.chains.remove(&key),
            };
            return Err(e);
        }
        Ok(id)
    }

    fn broadcast(&mut self, message: BroadcastMessage) -> Result<(), Error> {
        let key = message.message.key().clone();
        if !self.streams.contains_key(&key) {
            return Err(Error::NotSubscribed(key));
        }
        self.propagate(&key, &message, None)?;
        self.seen
            .insert(message.message.id.clone(), self.config.duplicate_ttl, Instant::now());
        Ok(())
    }

    fn request(
        &mut self,
        peer: PeerId,
        key: StreamPartitionKey,
        payload: Vec<u8>,
        reply: Reply<UnicastMessage>,
    ) {
        let message = self.next_message(key, payload);
        let request_id = self
            .requests
            .insert(reply, Instant::now() + self.config.request_timeout);
        let unicast = NodeMessage::Unicast(UnicastMessage {
            request_id: request_id.clone(),
            message,
        });
        if let Err(e) = self.send_message(&peer, &unicast) {
            if let Some(reply) = self.requests.resolve(&request_id) {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn handle_frame(&mut self, from: PeerId, frame: Frame) {
        self.config
            .metrics
            .increment(metrics::NODE_MESSAGES_RECEIVED, 1);
        match NodeMessage::from_frame(&frame) {
            Ok(NodeMessage::Broadcast(message)) => self.handle_broadcast(from, message),
            Ok(NodeMessage::Unicast(message)) => {
                match self.requests.resolve(&message.request_id) {
                    Some(reply) => {
                        let _ = reply.send(Ok(message));
                    }
                    None => self.emit(NodeEvent::UnicastReceived { from, message }),
                }
            }
            Err(e) => warn!(peer = %from, "dropping malformed data message: {e}"),
        }
    }

    fn handle_broadcast(&mut self, from: PeerId, message: BroadcastMessage) {
        let key = message.message.key().clone();
        if !self.streams.contains_key(&key) {
            debug!(%key, peer = %from, "broadcast for a stream we are not in");
            return;
        }
        let id = &message.message.id;
        if self.seen.contains(id) {
            trace!(%key, sequence = id.sequence, "duplicate broadcast");
            self.config.metrics.increment(metrics::NODE_DUPLICATES, 1);
            return;
        }
        self.seen
            .insert(id.clone(), self.config.duplicate_ttl, Instant::now());
        if let Err(e) = self.propagate(&key, &message, Some(&from)) {
            warn!(%key, "could not propagate broadcast: {e}");
        }
        self.emit(NodeEvent::BroadcastReceived { from, message });
    }

    fn housekeeping(&mut self, now: Instant) {
        let expired: Vec<PeerId> = self
            .connections
            .values()
            .filter(|record| record.is_negotiating() && record.deadline <= now)
            .map(|record| record.peer.clone())
            .collect();
        for peer in expired {
            debug!(%peer, "negotiation timed out");
            self.fail_connection(&peer, || Error::Timeout);
        }
        self.signaller.expire(now);
        for (request_id, reply) in self.requests.expire(now) {
            trace!(%request_id, "request timed out");
            let _ = reply.send(Err(Error::Timeout));
        }

        let due: Vec<PeerId> = self
            .reconnects
            .iter_mut()
            .filter_map(|(tracker, reconnect)| match reconnect.at {
                Some(at) if at <= now => {
                    reconnect.at = None;
                    Some(tracker.clone())
                }
                _ => None,
            })
            .collect();
        for tracker in due {
            if let Some(info) = self.config.trackers.get(&tracker).cloned() {
                debug!(%tracker, "reconnecting to tracker");
                self.control.connect(&info);
            }
        }

        self.seen.remove_expired(now);
        let connected = self.connections.values().filter(|r| r.is_connected()).count();
        let queued: usize = self.connections.values().map(ConnectionRecord::buffered).sum();
        self.config
            .metrics
            .gauge(metrics::NODE_CONNECTIONS, connected as f64);
        self.config
            .metrics
            .gauge(metrics::NODE_QUEUED_BYTES, queued as f64);
    }

    fn shutdown(&mut self) {
        for (peer, mut record) in self.connections.drain() {
            debug!(%peer, "closing connection");
            record.close("shutdown");
        }
        for (_, reply) in self.requests.drain() {
            let _ = reply.send(Err(Error::Stopped));
        }
        self.reconnects.clear();
        self.control.shutdown();
        self.endpoint.shutdown();
    }
}
