//! Control protocol against a real tracker over QUIC on 127.0.0.1, with
//! bare control clients standing in for participants.

use std::time::Duration;

use streamnet::{
    config::{local_addr, TrackerConfig, TransportSettings},
    protocol::{
        control_client::{ControlEvent, ParticipantControlClient},
        messages::{
            ConnectionId, ErrorCode, InstructionMessage, RelayPayload, RequestId, Status,
            StreamStatus,
        },
    },
    tracker::Tracker,
    PeerId, PeerInfo, StreamPartitionKey,
};
use tokio::time::{sleep, timeout};

const DEADLINE: Duration = Duration::from_secs(10);

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

async fn participant(id: &str, tracker: &Tracker) -> ParticipantControlClient {
    let mut client =
        ParticipantControlClient::new(PeerInfo::new_node(id), TransportSettings::default()).unwrap();
    client.connect(&tracker.info());
    let event = next_matching(&mut client, |e| matches!(e, ControlEvent::Connected(_))).await;
    assert!(matches!(event, ControlEvent::Connected(t) if t == *tracker.id()));
    client
}

async fn next_matching(
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

async fn next_instruction(client: &mut ParticipantControlClient) -> InstructionMessage {
    match next_matching(client, |e| matches!(e, ControlEvent::Instruction { .. })).await {
        ControlEvent::Instruction { message, .. } => message,
        _ => unreachable!(),
    }
}

fn status(key: &StreamPartitionKey, counter: u64, outbound: &[&str]) -> Status {
    Status {
        streams: vec![StreamStatus {
            key: key.clone(),
            inbound: vec![],
            outbound: outbound.iter().map(|p| PeerId::from(*p)).collect(),
            counter,
        }],
        rtts: vec![],
        location: None,
        single_stream: true,
    }
}

#[tokio::test]
async fn tracker_pairs_two_participants_and_ignores_stale_status() {
    let tracker = tracker().await;
    let mut a = participant("a", &tracker).await;
    let mut b = participant("b", &tracker).await;
    let key = StreamPartitionKey::new("stream", 0);
    let tracker_id = tracker.id().clone();

    a.send_status(&tracker_id, status(&key, 0, &[])).unwrap();
    b.send_status(&tracker_id, status(&key, 0, &[])).unwrap();

    let to_a = next_instruction(&mut a).await;
    let to_b = next_instruction(&mut b).await;
    assert_eq!(to_a.key, key);
    assert_eq!(to_a.neighbors, vec![PeerId::from("b")]);
    assert_eq!(to_b.neighbors, vec![PeerId::from("a")]);
    assert_eq!(to_a.counter, 1);

    // both echo the instruction with the link in place
    a.send_status(&tracker_id, status(&key, to_a.counter, &["b"])).unwrap();
    b.send_status(&tracker_id, status(&key, to_b.counter, &["a"])).unwrap();

    let mut summary = tracker.summary().await.unwrap();
    for _ in 0..100 {
        if summary.neighbors(&key, &"a".into()) == vec![PeerId::from("b")] {
            break;
        }
        sleep(Duration::from_millis(20)).await;
        summary = tracker.summary().await.unwrap();
    }
    assert!(summary.is_connected(&key));
    assert_eq!(summary.node_count(&key), 2);

    // an older counter must not undo the link; a later status on another key
    // on the same ordered stream tells us the stale one has been handled
    a.send_status(&tracker_id, status(&key, 0, &[])).unwrap();
    let marker = StreamPartitionKey::new("marker", 0);
    a.send_status(&tracker_id, status(&marker, 0, &[])).unwrap();
    for _ in 0..100 {
        if tracker.summary().await.unwrap().node_count(&marker) == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    let summary = tracker.summary().await.unwrap();
    assert_eq!(summary.node_count(&marker), 1);
    assert_eq!(summary.neighbors(&key, &"a".into()), vec![PeerId::from("b")]);

    a.shutdown();
    b.shutdown();
    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn relay_to_unknown_peer_returns_error_with_request_id() {
    let tracker = tracker().await;
    let mut a = participant("a", &tracker).await;
    let request_id = RequestId::new();

    a.send_relay(
        tracker.id(),
        request_id.clone(),
        "ghost".into(),
        RelayPayload::Connect {
            connection_id: ConnectionId::new(),
        },
    )
    .unwrap();

    match next_matching(&mut a, |e| matches!(e, ControlEvent::Error { .. })).await {
        ControlEvent::Error { tracker: from, message } => {
            assert_eq!(&from, tracker.id());
            assert_eq!(message.code, ErrorCode::UnknownPeer);
            assert_eq!(message.target, PeerId::from("ghost"));
            assert_eq!(message.request_id, request_id);
        }
        _ => unreachable!(),
    }

    a.shutdown();
    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn relay_reaches_target_with_originator_stamped() {
    let tracker = tracker().await;
    let a = participant("a", &tracker).await;
    let mut b = participant("b", &tracker).await;
    let connection_id = ConnectionId::new();
    let payload = RelayPayload::Offer {
        connection_id: connection_id.clone(),
        description: "127.0.0.1:4000".into(),
    };

    a.send_relay(tracker.id(), RequestId::new(), "b".into(), payload.clone())
        .unwrap();

    match next_matching(&mut b, |e| matches!(e, ControlEvent::Relay { .. })).await {
        ControlEvent::Relay { message, .. } => {
            assert_eq!(message.originator.peer_id, PeerId::from("a"));
            assert!(message.originator.is_node());
            assert_eq!(message.target, PeerId::from("b"));
            assert_eq!(message.payload, payload);
            assert_eq!(message.payload.connection_id(), &connection_id);
        }
        _ => unreachable!(),
    }

    tracker.stop().await.unwrap();
}

#[tokio::test]
async fn disconnect_removes_participant_from_overlay() {
    let tracker = tracker().await;
    let mut a = participant("a", &tracker).await;
    let mut b = participant("b", &tracker).await;
    let key = StreamPartitionKey::new("stream", 3);
    let tracker_id = tracker.id().clone();

    a.send_status(&tracker_id, status(&key, 0, &[])).unwrap();
    b.send_status(&tracker_id, status(&key, 0, &[])).unwrap();
    next_instruction(&mut a).await;
    next_instruction(&mut b).await;

    b.shutdown();
    for _ in 0..100 {
        if tracker.summary().await.unwrap().node_count(&key) == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(tracker.summary().await.unwrap().node_count(&key), 1);

    a.shutdown();
    tracker.stop().await.unwrap();
}
