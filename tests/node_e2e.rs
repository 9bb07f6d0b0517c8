//! Participants and a tracker on 127.0.0.1 over real QUIC links: overlay
//! formation, data propagation, request/response, back pressure and
//! negotiation failures.

use std::time::Duration;

use streamnet::{
    config::{local_addr, NodeConfig, TrackerConfig, TransportSettings},
    node::{connection::ConnectionState, Node, NodeEvent},
    protocol::{
        control_client::{ControlEvent, ParticipantControlClient},
        messages::{ConnectionId, RelayPayload, RequestId},
        node_to_node::{BroadcastMessage, MessageId, StreamMessage, UnicastMessage},
    },
    registry::TrackerRegistry,
    tracker::Tracker,
    Error, PeerId, PeerInfo, StreamPartitionKey,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    time::{sleep, timeout},
};

const DEADLINE: Duration = Duration::from_secs(15);

type Events = UnboundedReceiver<NodeEvent>;

fn key() -> StreamPartitionKey {
    StreamPartitionKey::new("e2e", 0)
}

async fn tracker() -> Tracker {
    Tracker::start(
        TrackerConfig::builder()
            .id("tracker")
            .listen_addr(local_addr())
            .build(),
    )
    .await
    .unwrap()
}

async fn node(id: &str, tracker: &Tracker) -> (Node, Events) {
    Node::start(
        NodeConfig::builder()
            .id(id)
            .trackers(TrackerRegistry::single(tracker.info()))
            .build(),
    )
    .await
    .unwrap()
}

async fn next_matching(events: &mut Events, mut pred: impl FnMut(&NodeEvent) -> bool) -> NodeEvent {
    timeout(DEADLINE, async {
        loop {
            let event = events.recv().await.expect("node stopped");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for node event")
}

async fn wait_for_neighbors(node: &Node, key: &StreamPartitionKey, count: usize) {
    timeout(DEADLINE, async {
        while node.neighbors(key.clone()).await.unwrap().len() < count {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("overlay did not form");
}

/// A bare control session registered with the tracker under `id`. It never
/// answers negotiation on its own.
async fn silent_participant(id: &str, tracker: &Tracker) -> ParticipantControlClient {
    let mut client =
        ParticipantControlClient::new(PeerInfo::new_node(id), TransportSettings::default()).unwrap();
    client.connect(&tracker.info());
    next_control(&mut client, |e| matches!(e, ControlEvent::Connected(_))).await;
    client
}

async fn next_control(
    client: &mut ParticipantControlClient,
    mut pred: impl FnMut(&ControlEvent) -> bool,
) -> ControlEvent {
    timeout(DEADLINE, async {
        loop {
            let event = client.next_event().await.expect("client closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for control event")
}

/// Two subscribed nodes linked through the tracker's instructions.
async fn linked_pair(tracker: &Tracker) -> ((Node, Events), (Node, Events)) {
    let a = node("node-a", tracker).await;
    let b = node("node-b", tracker).await;
    a.0.subscribe(key()).await.unwrap();
    b.0.subscribe(key()).await.unwrap();
    wait_for_neighbors(&a.0, &key(), 1).await;
    wait_for_neighbors(&b.0, &key(), 1).await;
    (a, b)
}

fn stream_message(publisher: &str, sequence: u32, payload: Vec<u8>) -> StreamMessage {
    StreamMessage {
        id: MessageId {
            key: key(),
            timestamp: 1_700_000_000_000,
            sequence,
            publisher_id: publisher.into(),
            chain_id: "chain".into(),
        },
        prev: None,
        payload,
    }
}

#[tokio::test]
async fn broadcast_arrives_with_request_id_and_identical_payload() {
    let tracker = tracker().await;
    let ((a, _a_events), (b, mut b_events)) = linked_pair(&tracker).await;

    let payload: Vec<u8> = (0..=255).collect();
    let sent = BroadcastMessage {
        request_id: RequestId::from("req-42"),
        message: stream_message("node-a", 0, payload),
    };
    a.broadcast(sent.clone()).await.unwrap();

    match next_matching(&mut b_events, |e| matches!(e, NodeEvent::BroadcastReceived { .. })).await {
        NodeEvent::BroadcastReceived { from, message } => {
            assert_eq!(from, PeerId::from("node-a"));
            assert_eq!(message, sent);
        }
        _ => unreachable!(),
    }

    // published messages carry no request id
    let id = a.publish(key(), b"second".to_vec()).await.unwrap();
    match next_matching(&mut b_events, |e| matches!(e, NodeEvent::BroadcastReceived { .. })).await {
        NodeEvent::BroadcastReceived { message, .. } => {
            assert!(message.request_id.is_none());
            assert_eq!(message.message.id, id);
            assert_eq!(message.message.payload, b"second");
        }
        _ => unreachable!(),
    }

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn broadcast_propagates_across_the_overlay_once() {
    let tracker = tracker().await;
    let mut nodes = Vec::new();
    for i in 0..4 {
        let (node, events) = node(&format!("node-{i}"), &tracker).await;
        node.subscribe(key()).await.unwrap();
        nodes.push((node, events));
    }
    for (node, _) in &nodes {
        wait_for_neighbors(node, &key(), 1).await;
    }
    timeout(DEADLINE, async {
        loop {
            let summary = tracker.summary().await.unwrap();
            let symmetric = nodes.iter().all(|(node, _)| {
                summary
                    .neighbors(&key(), node.id())
                    .iter()
                    .all(|peer| summary.neighbors(&key(), peer).contains(node.id()))
            });
            if summary.node_count(&key()) == 4 && summary.is_connected(&key()) && symmetric {
                assert!(summary.max_degree(&key()) <= 4);
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("overlay never connected");

    let id = nodes[0].0.publish(key(), b"fan out".to_vec()).await.unwrap();
    for (node, events) in nodes.iter_mut().skip(1) {
        let event = next_matching(events, |e| matches!(e, NodeEvent::BroadcastReceived { .. })).await;
        let NodeEvent::BroadcastReceived { message, .. } = event else {
            unreachable!()
        };
        assert_eq!(message.message.id, id, "at {}", node.id());
    }
    // nobody sees it twice
    sleep(Duration::from_millis(300)).await;
    for (_, events) in nodes.iter_mut() {
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, NodeEvent::BroadcastReceived { .. }));
        }
    }

    for (node, _) in nodes {
        node.stop().await.unwrap();
    }
    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn request_resolves_with_matching_unicast_reply() {
    let tracker = tracker().await;
    let ((a, _a_events), (b, mut b_events)) = linked_pair(&tracker).await;

    let answer = async {
        match next_matching(&mut b_events, |e| matches!(e, NodeEvent::UnicastReceived { .. })).await {
            NodeEvent::UnicastReceived { from, message } => {
                assert_eq!(message.message.payload, b"ping");
                let reply = UnicastMessage {
                    request_id: message.request_id.clone(),
                    message: stream_message("node-b", 7, b"pong".to_vec()),
                };
                b.send_unicast(from, reply).await.unwrap();
                message.request_id
            }
            _ => unreachable!(),
        }
    };
    let (reply, request_id) = tokio::join!(a.request("node-b".into(), key(), b"ping".to_vec()), answer);
    let reply = reply.unwrap();
    assert_eq!(reply.request_id, request_id);
    assert_eq!(reply.message.payload, b"pong");

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn large_send_raises_then_clears_back_pressure_once() {
    let tracker = tracker().await;
    let ((a, mut a_events), (b, _b_events)) = linked_pair(&tracker).await;

    a.publish(key(), vec![0x5a; 256 * 1024]).await.unwrap();

    let high = next_matching(&mut a_events, |e| {
        matches!(e, NodeEvent::BackPressureHigh(_) | NodeEvent::BackPressureLow(_))
    })
    .await;
    assert_eq!(high, NodeEvent::BackPressureHigh("node-b".into()));
    let low = next_matching(&mut a_events, |e| {
        matches!(e, NodeEvent::BackPressureHigh(_) | NodeEvent::BackPressureLow(_))
    })
    .await;
    assert_eq!(low, NodeEvent::BackPressureLow("node-b".into()));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn connecting_to_unknown_peer_fails_without_a_record() {
    let tracker = tracker().await;
    let (a, mut a_events) = node("node-a", &tracker).await;
    a.subscribe(key()).await.unwrap();
    next_matching(&mut a_events, |e| matches!(e, NodeEvent::ConnectedToTracker(_))).await;

    let result = a.connect_to_node(key(), "ghost".into()).await;
    assert!(matches!(result, Err(Error::UnknownPeer(peer)) if peer == PeerId::from("ghost")));
    let event = next_matching(&mut a_events, |e| matches!(e, NodeEvent::RelayError { .. })).await;
    assert_eq!(
        event,
        NodeEvent::RelayError {
            tracker: "tracker".into(),
            target: "ghost".into(),
        }
    );
    assert!(a
        .connections()
        .await
        .unwrap()
        .iter()
        .all(|c| c.peer != PeerId::from("ghost")));

    a.stop().await.unwrap();
    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn connections_report_negotiated_versions() {
    let tracker = tracker().await;
    let ((a, _a_events), (b, _b_events)) = linked_pair(&tracker).await;

    let connections = a.connections().await.unwrap();
    let to_b = connections
        .iter()
        .find(|c| c.peer == PeerId::from("node-b"))
        .expect("no record for node-b");
    assert_eq!(to_b.state, ConnectionState::Connected);
    let versions = to_b.versions.expect("connected records carry versions");
    assert_eq!((versions.control, versions.message), (2, 32));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn operations_on_unsubscribed_keys_fail() {
    let tracker = tracker().await;
    let (a, _events) = node("node-a", &tracker).await;
    let other = StreamPartitionKey::new("elsewhere", 1);
    assert!(matches!(
        a.publish(other.clone(), b"x".to_vec()).await,
        Err(Error::NotSubscribed(_))
    ));
    assert!(matches!(
        a.connect_to_node(other.clone(), "node-b".into()).await,
        Err(Error::NotSubscribed(_))
    ));
    assert!(matches!(a.unsubscribe(other).await, Err(Error::NotSubscribed(_))));

    a.stop().await.unwrap();
    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_publish_fails_locally_and_keeps_links() {
    let tracker = tracker().await;
    let ((a, mut a_events), (b, mut b_events)) = linked_pair(&tracker).await;

    let too_large = vec![7u8; TransportSettings::default().max_message_bytes + 1];
    let result = a.publish(key(), too_large).await;
    assert!(matches!(result, Err(Error::MessageTooLarge { .. })));

    // the link survives and still carries traffic
    let id = a.publish(key(), b"after".to_vec()).await.unwrap();
    match next_matching(&mut b_events, |e| matches!(e, NodeEvent::BroadcastReceived { .. })).await {
        NodeEvent::BroadcastReceived { message, .. } => {
            assert_eq!(message.message.id, id);
            assert_eq!(id.sequence, 0);
        }
        _ => unreachable!(),
    }
    while let Ok(event) = a_events.try_recv() {
        assert!(!matches!(event, NodeEvent::NodeDisconnected(_)), "{event:?}");
    }
    assert_eq!(a.neighbors(key()).await.unwrap(), vec![PeerId::from("node-b")]);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn unanswered_negotiation_times_out_and_leaves_no_record() {
    let tracker = tracker().await;
    let (a, mut a_events) = Node::start(
        NodeConfig::builder()
            .id("node-a")
            .trackers(TrackerRegistry::single(tracker.info()))
            .negotiation_timeout(Duration::from_millis(300))
            .build(),
    )
    .await
    .unwrap();
    a.subscribe(key()).await.unwrap();
    next_matching(&mut a_events, |e| matches!(e, NodeEvent::ConnectedToTracker(_))).await;
    // known to the tracker, so the offer is relayed, but it never answers
    let mut silent = silent_participant("node-z", &tracker).await;

    let result = a.connect_to_node(key(), "node-z".into()).await;
    assert!(matches!(result, Err(Error::Timeout)), "{result:?}");
    let offered = next_control(&mut silent, |e| matches!(e, ControlEvent::Relay { .. })).await;
    assert!(matches!(
        offered,
        ControlEvent::Relay { message, .. } if matches!(message.payload, RelayPayload::Offer { .. })
    ));
    assert!(a
        .connections()
        .await
        .unwrap()
        .iter()
        .all(|c| c.peer != PeerId::from("node-z")));

    silent.shutdown();
    a.stop().await.unwrap();
    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn connect_request_replaces_a_stale_link() {
    let tracker = tracker().await;
    let (a, mut a_events) = node("node-a", &tracker).await;
    // slow to reconnect, so the session that replaces it below stays in place
    let (b, _b_events) = Node::start(
        NodeConfig::builder()
            .id("node-b")
            .trackers(TrackerRegistry::single(tracker.info()))
            .reconnect_base_delay(Duration::from_secs(20))
            .build(),
    )
    .await
    .unwrap();
    a.subscribe(key()).await.unwrap();
    b.subscribe(key()).await.unwrap();
    wait_for_neighbors(&a, &key(), 1).await;
    wait_for_neighbors(&b, &key(), 1).await;

    // node-b comes back on a new session while node-a still holds the old link
    let mut restarted = silent_participant("node-b", &tracker).await;
    let connection_id = ConnectionId::new();
    restarted
        .send_relay(
            tracker.id(),
            RequestId::new(),
            "node-a".into(),
            RelayPayload::Connect {
                connection_id: connection_id.clone(),
            },
        )
        .unwrap();

    let offer = next_control(&mut restarted, |e| {
        matches!(e, ControlEvent::Relay { message, .. } if matches!(message.payload, RelayPayload::Offer { .. }))
    })
    .await;
    let ControlEvent::Relay { message, .. } = offer else {
        unreachable!()
    };
    assert_eq!(message.originator.peer_id, PeerId::from("node-a"));
    assert_eq!(message.payload.connection_id(), &connection_id);
    next_matching(&mut a_events, |e| *e == NodeEvent::NodeDisconnected("node-b".into())).await;

    restarted.shutdown();
    a.stop().await.unwrap();
    b.stop().await.unwrap();
    tracker.stop().await.unwrap();
}
