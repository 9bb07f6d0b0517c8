// The tracker process. One task owns the overlay state and the control server
// and reacts to participant events, prune timer ticks and commands from the
// Tracker handle, in that single loop.

pub mod overlay;
pub mod summary;
pub mod topology;

use std::net::SocketAddr;

use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{
    config::TrackerConfig,
    error::Error,
    identity::{PeerId, PeerInfo},
    metrics,
    protocol::{
        messages::{RelayMessage, StatusMessage},
        tracker_server::{TrackerServer, TrackerServerEvent},
    },
    registry::TrackerInfo,
};

use self::{overlay::TrackerCore, summary::TopologySummary};

enum Command {
    Summary(oneshot::Sender<TopologySummary>),
    Stop(oneshot::Sender<()>),
}

/// Handle to a running tracker.
pub struct Tracker {
    id: PeerId,
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl Tracker {
    /// Binds the control endpoint and starts the tracker loop.
    pub async fn start(config: TrackerConfig) -> Result<Self, Error> {
        config.validate()?;
        let local = PeerInfo::new_tracker(config.id.clone());
        let server = TrackerServer::bind(local, config.listen_addr, config.transport.clone())?;
        let local_addr = server.local_addr()?;
        info!(id = %config.id, %local_addr, "tracker listening");

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let core = TrackerCore::new(
            config.max_neighbors_per_node,
            config.topology.clone(),
            config.metrics.clone(),
        );
        let span = debug_span!("tracker", id = %config.id);
        let id = config.id.clone();
        let task = tokio::spawn(
            TrackerLoop {
                config,
                core,
                server,
            }
            .run(commands_rx)
            .instrument(span),
        );

        Ok(Self {
            id,
            local_addr,
            commands,
            task,
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registry entry for reaching this tracker.
    pub fn info(&self) -> TrackerInfo {
        TrackerInfo::new(self.id.clone(), self.local_addr)
    }

    pub async fn summary(&self) -> Result<TopologySummary, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Summary(tx))
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }

    /// Closes every participant session and stops the loop and its timers.
    pub async fn stop(self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stop(tx))
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?;
        let _ = self.task.await;
        Ok(())
    }
}

struct TrackerLoop {
    config: TrackerConfig,
    core: TrackerCore,
    server: TrackerServer,
}

impl TrackerLoop {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut prune = time::interval(self.config.prune_interval);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                command = commands.recv() => match command {
                    Some(Command::Summary(reply)) => {
                        let _ = reply.send(self.core.summary());
                    }
                    Some(Command::Stop(reply)) => {
                        self.server.shutdown();
                        info!("tracker stopped");
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        // the handle was dropped without stop()
                        self.server.shutdown();
                        return;
                    }
                },
                Some(event) = self.server.next_event() => self.handle_event(event),
                _ = prune.tick() => {
                    let pruned = self.core.prune_idle(Instant::now(), self.config.overlay_idle_timeout);
                    if !pruned.is_empty() {
                        debug!(count = pruned.len(), "pruned idle overlays");
                    }
                    self.config.metrics.gauge(metrics::OVERLAYS, self.core.overlay_count() as f64);
                }
            }
        }
    }

    fn handle_event(&mut self, event: TrackerServerEvent) {
        match event {
            TrackerServerEvent::NodeConnected(info) => {
                debug!(peer = %info.peer_id, "node session opened");
                self.report_sessions();
            }
            TrackerServerEvent::NodeDisconnected(peer) => {
                let affected = self.core.remove_participant(&peer, Instant::now());
                debug!(%peer, keys = affected.len(), "removed participant from overlays");
                self.report_sessions();
                self.send_instructions();
            }
            TrackerServerEvent::Status { from, message } => self.handle_status(from, message),
            TrackerServerEvent::Relay { from, message } => self.handle_relay(from, message),
        }
    }

    fn handle_status(&mut self, from: PeerId, message: StatusMessage) {
        self.core.submit_status(&from, &message.status, Instant::now());
        self.send_instructions();
    }

    fn send_instructions(&mut self) {
        for key in self.core.pending_keys() {
            for instruction in self.core.compute_instructions(&key) {
                debug!(
                    peer = %instruction.participant,
                    key = %instruction.key,
                    counter = instruction.counter,
                    neighbors = ?instruction.neighbors,
                    "sending instruction"
                );
                match self.server.send_instruction(
                    &instruction.participant,
                    instruction.key,
                    instruction.neighbors,
                    instruction.counter,
                ) {
                    Ok(()) => self.config.metrics.increment(metrics::INSTRUCTIONS_SENT, 1),
                    Err(e) => debug!(peer = %instruction.participant, "could not send instruction: {e}"),
                }
            }
        }
    }

    fn handle_relay(&mut self, from: PeerId, message: RelayMessage) {
        let request_id = message.request_id.clone();
        let target = message.target.clone();
        debug!(%from, %target, kind = message.payload.kind(), "relaying");
        match self.server.send_relay(message) {
            Ok(()) => self.config.metrics.increment(metrics::RELAYS_FORWARDED, 1),
            Err(Error::UnknownPeer(target)) => {
                self.config.metrics.increment(metrics::UNKNOWN_PEER_ERRORS, 1);
                if let Err(e) = self.server.send_unknown_peer_error(&from, request_id, target) {
                    debug!(%from, "could not report unknown relay target: {e}");
                }
            }
            Err(e) => warn!(%from, %target, "relay failed: {e}"),
        }
    }

    fn report_sessions(&self) {
        let count = self.server.connected_nodes().count();
        self.config.metrics.gauge(metrics::CONNECTED_NODES, count as f64);
    }
}
