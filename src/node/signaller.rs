// Connection negotiation between two participants, relayed through a tracker.
//
// The peer with the lexicographically smaller id offers. The other side either
// answers an offer or, when it wants the connection first, sends Connect so
// the smaller peer offers. The offerer dials. Offer and answer each carry the
// sender's primary data address; the answerer's further addresses precede its
// answer as ICE candidates so the offerer holds every fallback when it dials.

use std::{net::SocketAddr, time::Duration};

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    error::Error,
    identity::{PeerId, PeerInfo},
    protocol::{
        control_client::ParticipantControlClient,
        messages::{ConnectionId, ErrorMessage, RelayMessage, RelayPayload, RequestId},
        requests::PendingRequests,
    },
};

pub fn is_offerer(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

/// An inbound negotiation message, demultiplexed by remote peer and
/// connection id.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    Offer {
        from: PeerInfo,
        connection_id: ConnectionId,
        addr: SocketAddr,
        request_id: RequestId,
    },
    Answer {
        from: PeerId,
        connection_id: ConnectionId,
        addr: SocketAddr,
    },
    Connect {
        from: PeerId,
        connection_id: ConnectionId,
    },
    Candidate {
        from: PeerId,
        connection_id: ConnectionId,
        addr: SocketAddr,
    },
}

pub struct RtcSignaller {
    local: PeerId,
    /// Our data addresses, primary first.
    addresses: Vec<SocketAddr>,
    timeout: Duration,
    /// Offers and connect requests awaiting an answer or an error.
    pending: PendingRequests<(PeerId, ConnectionId)>,
}

impl RtcSignaller {
    pub fn new(local: PeerId, addresses: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self {
            local,
            addresses,
            timeout,
            pending: PendingRequests::new(),
        }
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    fn primary(&self) -> String {
        self.addresses
            .first()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    /// Sends an offer to `peer`.
    pub fn offer(
        &mut self,
        control: &ParticipantControlClient,
        tracker: &PeerId,
        peer: &PeerId,
        connection_id: &ConnectionId,
        now: Instant,
    ) -> Result<(), Error> {
        let request_id = self
            .pending
            .insert((peer.clone(), connection_id.clone()), now + self.timeout);
        let payload = RelayPayload::Offer {
            connection_id: connection_id.clone(),
            description: self.primary(),
        };
        control
            .send_relay(tracker, request_id.clone(), peer.clone(), payload)
            .map_err(|e| {
                self.pending.resolve(&request_id);
                e
            })
    }

    /// Asks `peer` to offer a connection to us.
    pub fn connect(
        &mut self,
        control: &ParticipantControlClient,
        tracker: &PeerId,
        peer: &PeerId,
        connection_id: &ConnectionId,
        now: Instant,
    ) -> Result<(), Error> {
        let request_id = self
            .pending
            .insert((peer.clone(), connection_id.clone()), now + self.timeout);
        let payload = RelayPayload::Connect {
            connection_id: connection_id.clone(),
        };
        control
            .send_relay(tracker, request_id.clone(), peer.clone(), payload)
            .map_err(|e| {
                self.pending.resolve(&request_id);
                e
            })
    }

    /// Sends our additional addresses, then answers the offer reusing its
    /// request id.
    pub fn answer(
        &self,
        control: &ParticipantControlClient,
        tracker: &PeerId,
        peer: &PeerId,
        connection_id: &ConnectionId,
        request_id: RequestId,
    ) -> Result<(), Error> {
        let payload = RelayPayload::Answer {
            connection_id: connection_id.clone(),
            description: self.primary(),
        };
        self.send_candidates(control, tracker, peer, connection_id)?;
        control.send_relay(tracker, request_id, peer.clone(), payload)
    }

    fn send_candidates(
        &self,
        control: &ParticipantControlClient,
        tracker: &PeerId,
        peer: &PeerId,
        connection_id: &ConnectionId,
    ) -> Result<(), Error> {
        for (mid, addr) in self.addresses.iter().enumerate().skip(1) {
            let payload = RelayPayload::IceCandidate {
                connection_id: connection_id.clone(),
                candidate: addr.to_string(),
                mid: mid.to_string(),
            };
            control.send_relay(tracker, RequestId::none(), peer.clone(), payload)?;
        }
        Ok(())
    }

    /// Interprets a relay addressed to us. Malformed data and answers that no
    /// offer of ours is waiting for are dropped.
    pub fn handle_relay(&mut self, message: RelayMessage) -> Option<Signal> {
        if message.target != self.local {
            warn!(target = %message.target, "relay for another peer, dropping");
            return None;
        }
        let from = message.originator;
        match message.payload {
            RelayPayload::Offer {
                connection_id,
                description,
            } => {
                // the offer settles any connect request we sent
                self.pending.remove_where(|(peer, _)| *peer == from.peer_id);
                Some(Signal::Offer {
                    addr: parse_addr(&from.peer_id, &description)?,
                    from,
                    connection_id,
                    request_id: message.request_id,
                })
            }
            RelayPayload::Answer {
                connection_id,
                description,
            } => {
                match self.pending.resolve(&message.request_id) {
                    Some((peer, expected)) if peer == from.peer_id && expected == connection_id => {}
                    _ => {
                        debug!(peer = %from.peer_id, %connection_id, "dropping unsolicited answer");
                        return None;
                    }
                }
                Some(Signal::Answer {
                    addr: parse_addr(&from.peer_id, &description)?,
                    from: from.peer_id,
                    connection_id,
                })
            }
            RelayPayload::Connect { connection_id } => Some(Signal::Connect {
                from: from.peer_id,
                connection_id,
            }),
            RelayPayload::IceCandidate {
                connection_id,
                candidate,
                ..
            } => Some(Signal::Candidate {
                addr: parse_addr(&from.peer_id, &candidate)?,
                from: from.peer_id,
                connection_id,
            }),
        }
    }

    /// Matches a tracker error to the negotiation it concerns, if it is one of
    /// ours.
    pub fn handle_error(&mut self, message: &ErrorMessage) -> Option<(PeerId, ConnectionId)> {
        self.pending.resolve(&message.request_id)
    }

    /// Drops every pending exchange with `peer`.
    pub fn forget(&mut self, peer: &PeerId) {
        self.pending.remove_where(|(p, _)| p == peer);
    }

    pub fn expire(&mut self, now: Instant) -> Vec<(PeerId, ConnectionId)> {
        self.pending
            .expire(now)
            .into_iter()
            .map(|(_, value)| value)
            .collect()
    }
}

fn parse_addr(peer: &PeerId, description: &str) -> Option<SocketAddr> {
    match description.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            warn!(%peer, %description, "unparseable address in negotiation data");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signaller() -> RtcSignaller {
        RtcSignaller::new(
            "b".into(),
            vec!["127.0.0.1:4000".parse().unwrap()],
            Duration::from_secs(5),
        )
    }

    fn relay(payload: RelayPayload, request_id: RequestId) -> RelayMessage {
        RelayMessage {
            request_id,
            originator: PeerInfo::new_node("a"),
            target: "b".into(),
            payload,
        }
    }

    #[test]
    fn smaller_id_offers() {
        assert!(is_offerer(&"a".into(), &"b".into()));
        assert!(!is_offerer(&"b".into(), &"a".into()));
        // byte order, not numeric order
        assert!(is_offerer(&"node-10".into(), &"node-2".into()));
    }

    #[test]
    fn offers_are_demultiplexed_with_their_request_id() {
        let mut signaller = signaller();
        let request_id = RequestId::new();
        let signal = signaller.handle_relay(relay(
            RelayPayload::Offer {
                connection_id: ConnectionId::from("c1"),
                description: "127.0.0.1:5000".into(),
            },
            request_id.clone(),
        ));
        assert_eq!(
            signal,
            Some(Signal::Offer {
                from: PeerInfo::new_node("a"),
                connection_id: ConnectionId::from("c1"),
                addr: "127.0.0.1:5000".parse().unwrap(),
                request_id,
            })
        );
    }

    #[test]
    fn unsolicited_answer_is_dropped() {
        let mut signaller = signaller();
        let answer = RelayPayload::Answer {
            connection_id: ConnectionId::from("c1"),
            description: "127.0.0.1:5000".into(),
        };
        assert_eq!(signaller.handle_relay(relay(answer, RequestId::new())), None);
    }

    #[test]
    fn answer_resolves_matching_offer_once() {
        let mut signaller = signaller();
        let deadline = Instant::now() + Duration::from_secs(5);
        let request_id = signaller
            .pending
            .insert(("a".into(), ConnectionId::from("c1")), deadline);
        let answer = || RelayPayload::Answer {
            connection_id: ConnectionId::from("c1"),
            description: "127.0.0.1:5000".into(),
        };
        assert_eq!(
            signaller.handle_relay(relay(answer(), request_id.clone())),
            Some(Signal::Answer {
                from: "a".into(),
                connection_id: ConnectionId::from("c1"),
                addr: "127.0.0.1:5000".parse().unwrap(),
            })
        );
        // a duplicate finds nothing pending
        assert_eq!(signaller.handle_relay(relay(answer(), request_id)), None);
    }

    #[test]
    fn offer_settles_our_connect_request() {
        let mut signaller = signaller();
        let deadline = Instant::now() + Duration::from_secs(5);
        let request_id = signaller
            .pending
            .insert(("a".into(), ConnectionId::from("c1")), deadline);
        let offer = RelayPayload::Offer {
            connection_id: ConnectionId::from("c1"),
            description: "127.0.0.1:5000".into(),
        };
        assert!(signaller.handle_relay(relay(offer, RequestId::new())).is_some());
        assert!(!signaller.pending.contains(&request_id));
    }

    #[test]
    fn late_candidates_still_parse_and_garbage_is_dropped() {
        let mut signaller = signaller();
        let candidate = |text: &str| RelayPayload::IceCandidate {
            connection_id: ConnectionId::from("old"),
            candidate: text.into(),
            mid: "1".into(),
        };
        assert!(matches!(
            signaller.handle_relay(relay(candidate("10.0.0.1:7"), RequestId::none())),
            Some(Signal::Candidate { .. })
        ));
        assert_eq!(signaller.handle_relay(relay(candidate("nonsense"), RequestId::none())), None);
    }

    #[test]
    fn pending_negotiations_expire() {
        let mut signaller = signaller();
        let now = Instant::now();
        let id = signaller
            .pending
            .insert(("a".into(), ConnectionId::from("c")), now + Duration::from_secs(1));
        assert!(signaller.expire(now).is_empty());
        assert_eq!(
            signaller.expire(now + Duration::from_secs(1)),
            vec![(PeerId::from("a"), ConnectionId::from("c"))]
        );
        assert!(!signaller.pending.contains(&id));
    }
}
