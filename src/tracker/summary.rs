use std::collections::BTreeMap;

use petgraph::{algo::kosaraju_scc, graphmap::UnGraphMap};

use crate::{
    identity::{Location, PeerId},
    protocol::messages::StreamPartitionKey,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NeighborSummary {
    pub peer_id: PeerId,
    /// Latest round trip time the member reported for this neighbour.
    pub rtt_micros: Option<u64>,
}

/// Read-only snapshot of every overlay as its members last reported it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TopologySummary {
    pub streams: BTreeMap<StreamPartitionKey, BTreeMap<PeerId, Vec<NeighborSummary>>>,
    pub locations: BTreeMap<PeerId, Location>,
}

impl TopologySummary {
    pub fn keys(&self) -> impl Iterator<Item = &StreamPartitionKey> {
        self.streams.keys()
    }

    pub fn neighbors(&self, key: &StreamPartitionKey, peer: &PeerId) -> Vec<PeerId> {
        self.streams
            .get(key)
            .and_then(|nodes| nodes.get(peer))
            .map(|neighbors| neighbors.iter().map(|n| n.peer_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn node_count(&self, key: &StreamPartitionKey) -> usize {
        self.streams.get(key).map_or(0, BTreeMap::len)
    }

    /// Undirected graph of the overlay for `key`. An edge is present when
    /// either end reports it.
    pub fn graph(&self, key: &StreamPartitionKey) -> UnGraphMap<&str, ()> {
        let mut graph = UnGraphMap::new();
        if let Some(nodes) = self.streams.get(key) {
            for (node, neighbors) in nodes {
                graph.add_node(node.as_str());
                for neighbor in neighbors {
                    graph.add_edge(node.as_str(), neighbor.peer_id.as_str(), ());
                }
            }
        }
        graph
    }

    pub fn is_connected(&self, key: &StreamPartitionKey) -> bool {
        kosaraju_scc(&self.graph(key)).len() <= 1
    }

    /// Largest neighbour count of any member of `key`.
    pub fn max_degree(&self, key: &StreamPartitionKey) -> usize {
        self.streams
            .get(key)
            .and_then(|nodes| nodes.values().map(Vec::len).max())
            .unwrap_or(0)
    }
}
