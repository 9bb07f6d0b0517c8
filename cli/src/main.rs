use std::time::Duration;

use chrono::{TimeZone, Utc};
use streamnet::{
    config::{local_addr, NodeConfig, TrackerConfig},
    node::{Node, NodeEvent},
    registry::TrackerRegistry,
    tracker::Tracker,
    StreamPartitionKey,
};
use tokio::{sync::mpsc, time::timeout};
use tracing::info;

const NODES: usize = 3;

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<NodeEvent>,
    mut matches: impl FnMut(&NodeEvent) -> bool,
) -> Option<NodeEvent> {
    timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let tracker = Tracker::start(
        TrackerConfig::builder()
            .id("tracker-0")
            .listen_addr(local_addr())
            .build(),
    )
    .await
    .unwrap();
    info!(addr = %tracker.local_addr(), "tracker up");

    let key = StreamPartitionKey::new("demo-stream", 0);
    let mut nodes = Vec::new();
    for i in 0..NODES {
        let config = NodeConfig::builder()
            .id(format!("node-{i}"))
            .trackers(TrackerRegistry::single(tracker.info()))
            .build();
        let (node, events) = Node::start(config).await.unwrap();
        node.subscribe(key.clone()).await.unwrap();
        nodes.push((node, events));
    }

    // every node has to hear about at least one neighbour before publishing
    for (node, events) in nodes.iter_mut() {
        let connected = wait_for(events, |e| matches!(e, NodeEvent::NodeConnected(_))).await;
        info!(node = %node.id(), ?connected, "joined overlay");
    }

    let (publisher, _) = &nodes[0];
    let id = publisher
        .publish(key.clone(), b"hello overlay".to_vec())
        .await
        .unwrap();
    let published_at = Utc
        .timestamp_millis_opt(id.timestamp)
        .single()
        .map(|t| t.to_rfc3339());
    info!(publisher = %publisher.id(), sequence = id.sequence, ?published_at, "published");

    for (node, events) in nodes.iter_mut().skip(1) {
        match wait_for(events, |e| matches!(e, NodeEvent::BroadcastReceived { .. })).await {
            Some(NodeEvent::BroadcastReceived { from, message }) => info!(
                node = %node.id(),
                %from,
                payload = %String::from_utf8_lossy(&message.message.payload),
                "received"
            ),
            _ => info!(node = %node.id(), "no message within the deadline"),
        }
    }

    let summary = tracker.summary().await.unwrap();
    for stream in summary.keys() {
        info!(
            %stream,
            nodes = summary.node_count(stream),
            connected = summary.is_connected(stream),
            max_degree = summary.max_degree(stream),
            "overlay"
        );
    }

    for (node, _) in nodes {
        node.stop().await.unwrap();
    }
    tracker.stop().await.unwrap();
}
