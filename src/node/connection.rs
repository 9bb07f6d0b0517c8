use std::{net::SocketAddr, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use crate::{
    error::Error,
    identity::PeerId,
    net::{
        link::{Link, LinkTasks, CLOSE_NORMAL},
        wire::Frame,
    },
    protocol::{messages::ConnectionId, version::NegotiatedVersions},
};

pub use crate::net::link::ConnectionState;

/// Send-side congestion of one connection, derived from the number of bytes
/// queued but not yet handed to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackPressure {
    Normal,
    High,
    /// Below the high water mark after being above it, not yet below the low
    /// water mark.
    Recovering,
}

/// Emitted once per crossing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackPressureSignal {
    High,
    Low,
}

#[derive(Debug)]
pub struct SendQueue {
    buffered: usize,
    high_water_mark: usize,
    low_water_mark: usize,
    state: BackPressure,
}

impl SendQueue {
    pub fn new(high_water_mark: usize, low_water_mark: usize) -> Self {
        Self {
            buffered: 0,
            high_water_mark,
            low_water_mark,
            state: BackPressure::Normal,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn state(&self) -> BackPressure {
        self.state
    }

    pub fn enqueued(&mut self, len: usize) -> Option<BackPressureSignal> {
        self.buffered = self.buffered.saturating_add(len);
        self.update()
    }

    pub fn written(&mut self, len: usize) -> Option<BackPressureSignal> {
        self.buffered = self.buffered.saturating_sub(len);
        self.update()
    }

    fn update(&mut self) -> Option<BackPressureSignal> {
        use BackPressure::*;
        let above_high = self.buffered >= self.high_water_mark;
        let below_low = self.buffered < self.low_water_mark;
        let (next, signal) = match self.state {
            Normal if above_high => (High, Some(BackPressureSignal::High)),
            High | Recovering if below_low => (Normal, Some(BackPressureSignal::Low)),
            High if !above_high => (Recovering, None),
            Recovering if above_high => (High, None),
            state => (state, None),
        };
        self.state = next;
        signal
    }
}

/// Which side dialed the data link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Snapshot of a connection for callers of the node API.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionInfo {
    pub peer: PeerId,
    pub connection_id: ConnectionId,
    pub state: ConnectionState,
    pub direction: Direction,
    pub versions: Option<NegotiatedVersions>,
    pub buffered: usize,
    pub back_pressure: BackPressure,
    pub rtt: Option<Duration>,
}

type Waiter = oneshot::Sender<Result<(), Error>>;

struct Active {
    link: Link,
    frames: mpsc::UnboundedSender<Frame>,
    _tasks: LinkTasks,
}

/// The single data connection a participant holds with one remote peer,
/// from the first signalling message until it is closed or fails.
pub struct ConnectionRecord {
    pub peer: PeerId,
    pub connection_id: ConnectionId,
    /// Tracker through which negotiation data is relayed.
    pub tracker: PeerId,
    pub direction: Direction,
    /// Addresses the remote announced, tried in order when dialing.
    pub candidates: Vec<SocketAddr>,
    /// Set once the answer arrived and a dial was started.
    pub dialing: bool,
    pub deadline: Instant,
    state: ConnectionState,
    active: Option<Active>,
    queue: SendQueue,
    waiters: Vec<Waiter>,
}

impl ConnectionRecord {
    pub fn negotiating(
        peer: PeerId,
        connection_id: ConnectionId,
        tracker: PeerId,
        direction: Direction,
        deadline: Instant,
        queue: SendQueue,
    ) -> Self {
        Self {
            peer,
            connection_id,
            tracker,
            direction,
            candidates: Vec::new(),
            dialing: false,
            deadline,
            state: ConnectionState::Negotiating,
            active: None,
            queue,
            waiters: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_negotiating(&self) -> bool {
        self.state == ConnectionState::Negotiating
    }

    pub fn link(&self) -> Option<&Link> {
        self.active.as_ref().map(|active| &active.link)
    }

    pub fn link_id(&self) -> Option<usize> {
        self.link().map(Link::id)
    }

    pub fn transition(&mut self, to: ConnectionState) -> Result<(), Error> {
        if !self.state.can_transition(to) {
            return Err(Error::IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Moves to `Connected` with an established link and wakes every waiter.
    pub fn attach(
        &mut self,
        link: Link,
        frames: mpsc::UnboundedSender<Frame>,
        tasks: LinkTasks,
    ) -> Result<(), Error> {
        self.transition(ConnectionState::Connected)?;
        self.active = Some(Active {
            link,
            frames,
            _tasks: tasks,
        });
        self.resolve_waiters(|| Ok(()));
        Ok(())
    }

    /// Queues a frame for the writer task and accounts for its bytes.
    pub fn send(&mut self, frame: Frame) -> Result<Option<BackPressureSignal>, Error> {
        let active = self
            .active
            .as_ref()
            .filter(|_| self.state == ConnectionState::Connected)
            .ok_or_else(|| Error::NotConnected(self.peer.clone()))?;
        let len = frame.wire_len();
        active
            .frames
            .send(frame)
            .map_err(|_| Error::NotConnected(self.peer.clone()))?;
        Ok(self.queue.enqueued(len))
    }

    pub fn buffered(&self) -> usize {
        self.queue.buffered()
    }

    pub fn written(&mut self, len: usize) -> Option<BackPressureSignal> {
        self.queue.written(len)
    }

    pub fn add_waiter(&mut self, waiter: Waiter) {
        if self.is_connected() {
            let _ = waiter.send(Ok(()));
        } else {
            self.waiters.push(waiter);
        }
    }

    /// Hands the callers waiting on this record over to its replacement.
    pub fn take_waiters(&mut self) -> Vec<Waiter> {
        std::mem::take(&mut self.waiters)
    }

    pub fn resolve_waiters(&mut self, result: impl Fn() -> Result<(), Error>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result());
        }
    }

    /// Fails the record and everyone waiting on it.
    pub fn fail(&mut self, error: impl Fn() -> Error) {
        if self.state.can_transition(ConnectionState::Failed) {
            self.state = ConnectionState::Failed;
        }
        self.resolve_waiters(|| Err(error()));
        self.drop_link();
    }

    /// Closes the link gracefully. Waiters still pending learn the
    /// connection is gone.
    pub fn close(&mut self, reason: &str) {
        if self.transition(ConnectionState::Closing).is_ok() {
            if let Some(active) = &self.active {
                active.link.close(CLOSE_NORMAL, reason);
            }
            let _ = self.transition(ConnectionState::Closed);
        }
        let peer = self.peer.clone();
        self.resolve_waiters(|| Err(Error::ConnectionFailed(peer.clone())));
        self.drop_link();
    }

    fn drop_link(&mut self) {
        if let Some(active) = self.active.take() {
            active.link.close(CLOSE_NORMAL, "closed");
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer: self.peer.clone(),
            connection_id: self.connection_id.clone(),
            state: self.state,
            direction: self.direction,
            versions: self.link().map(Link::versions),
            buffered: self.queue.buffered(),
            back_pressure: self.queue.state(),
            rtt: self.link().map(Link::rtt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> SendQueue {
        SendQueue::new(100, 20)
    }

    #[test]
    fn high_fires_once_per_crossing() {
        let mut queue = queue();
        assert_eq!(queue.enqueued(60), None);
        assert_eq!(queue.enqueued(60), Some(BackPressureSignal::High));
        // further sends above the mark stay quiet
        assert_eq!(queue.enqueued(500), None);
        assert_eq!(queue.enqueued(1), None);
        assert_eq!(queue.state(), BackPressure::High);
    }

    #[test]
    fn low_fires_once_after_draining() {
        let mut queue = queue();
        queue.enqueued(150);
        assert_eq!(queue.written(100), None);
        assert_eq!(queue.state(), BackPressure::Recovering);
        assert_eq!(queue.written(40), Some(BackPressureSignal::Low));
        assert_eq!(queue.state(), BackPressure::Normal);
        assert_eq!(queue.written(10), None);
    }

    #[test]
    fn recovering_back_to_high_is_silent() {
        let mut queue = queue();
        queue.enqueued(120);
        queue.written(30);
        assert_eq!(queue.state(), BackPressure::Recovering);
        assert_eq!(queue.enqueued(50), None);
        assert_eq!(queue.state(), BackPressure::High);
        assert_eq!(queue.written(140), Some(BackPressureSignal::Low));
    }

    #[test]
    fn single_large_write_goes_high_then_low() {
        let mut queue = SendQueue::new(131072, 32768);
        assert_eq!(queue.enqueued(262144), Some(BackPressureSignal::High));
        assert_eq!(queue.written(262144), Some(BackPressureSignal::Low));
    }

    #[tokio::test]
    async fn illegal_transitions_are_errors() {
        let mut record = ConnectionRecord::negotiating(
            "b".into(),
            ConnectionId::from("c"),
            "t".into(),
            Direction::Outbound,
            Instant::now(),
            queue(),
        );
        assert!(matches!(
            record.transition(ConnectionState::Closed),
            Err(Error::IllegalTransition {
                from: ConnectionState::Negotiating,
                to: ConnectionState::Closed
            })
        ));
        assert!(matches!(record.send(Frame {
            msg_type: crate::net::wire::MessageType::Broadcast,
            body: vec![],
        }), Err(Error::NotConnected(_))));

        let (tx, rx) = oneshot::channel();
        record.add_waiter(tx);
        record.fail(|| Error::Timeout);
        assert_eq!(record.state(), ConnectionState::Failed);
        assert!(matches!(rx.await, Ok(Err(Error::Timeout))));
    }
}
