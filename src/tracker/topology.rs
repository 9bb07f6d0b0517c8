use std::collections::{BTreeMap, BTreeSet};

use petgraph::unionfind::UnionFind;

use crate::identity::PeerId;

/// Symmetric neighbour sets keyed by member. Every member of the overlay is a
/// key, including members without neighbours.
pub type Adjacency = BTreeMap<PeerId, BTreeSet<PeerId>>;

/// Chooses target neighbour sets for one overlay.
///
/// `current` holds the edges both ends currently agree on. Implementations must
/// return an entry for every member, never pair a member with itself, keep
/// the result symmetric and give no member more than `max_degree` neighbours.
/// Planning runs on the tracker loop and must not block.
pub trait TopologyStrategy: Send + Sync + 'static {
    fn plan(&self, current: &Adjacency, max_degree: usize) -> Adjacency;
}

/// Keeps existing edges where possible, fills free slots by pairing the least
/// connected members and stitches components together so the overlay stays
/// connected whenever `max_degree >= 2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BalancedTopology;

impl TopologyStrategy for BalancedTopology {
    fn plan(&self, current: &Adjacency, max_degree: usize) -> Adjacency {
        let members: Vec<&PeerId> = current.keys().collect();
        let index: BTreeMap<&PeerId, usize> =
            members.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut graph = Graph::new(members.len(), max_degree);
        for (id, neighbors) in current {
            let a = index[id];
            for neighbor in neighbors {
                if let Some(&b) = index.get(neighbor) {
                    graph.add(a, b);
                }
            }
        }

        graph.trim();
        graph.fill();
        if max_degree >= 2 {
            graph.merge_components();
            graph.fill();
        }

        members
            .iter()
            .enumerate()
            .map(|(a, id)| {
                let neighbors = graph.adj[a].iter().map(|&b| members[b].clone()).collect();
                ((*id).clone(), neighbors)
            })
            .collect()
    }
}

struct Graph {
    adj: Vec<BTreeSet<usize>>,
    max_degree: usize,
}

impl Graph {
    fn new(len: usize, max_degree: usize) -> Self {
        Self {
            adj: vec![BTreeSet::new(); len],
            max_degree,
        }
    }

    fn degree(&self, a: usize) -> usize {
        self.adj[a].len()
    }

    fn has_room(&self, a: usize) -> bool {
        self.degree(a) < self.max_degree
    }

    fn add(&mut self, a: usize, b: usize) {
        if a != b {
            self.adj[a].insert(b);
            self.adj[b].insert(a);
        }
    }

    fn remove(&mut self, a: usize, b: usize) {
        self.adj[a].remove(&b);
        self.adj[b].remove(&a);
    }

    /// Drops edges of over-full members, starting with their busiest
    /// neighbours.
    fn trim(&mut self) {
        for a in 0..self.adj.len() {
            while self.degree(a) > self.max_degree {
                let busiest = self.adj[a]
                    .iter()
                    .copied()
                    .max_by_key(|&b| (self.degree(b), b));
                match busiest {
                    Some(b) => self.remove(a, b),
                    None => break,
                }
            }
        }
    }

    /// Repeatedly connects the least connected member that still has room to
    /// the least connected non-adjacent member with room.
    ///
    /// Members with room are kept ordered by degree. A member only ever skips
    /// its own neighbours while looking for a partner, so each step costs
    /// O(max_degree log n). Degrees only grow here, so a member that finds no
    /// partner never will and leaves the order for good.
    fn fill(&mut self) {
        let mut open: BTreeSet<(usize, usize)> = (0..self.adj.len())
            .filter(|&a| self.has_room(a))
            .map(|a| (self.degree(a), a))
            .collect();
        while let Some(&(degree_a, a)) = open.iter().next() {
            let partner = open
                .iter()
                .map(|&(_, b)| b)
                .find(|&b| b != a && !self.adj[a].contains(&b));
            let Some(b) = partner else {
                open.remove(&(degree_a, a));
                continue;
            };
            open.remove(&(degree_a, a));
            open.remove(&(self.degree(b), b));
            self.add(a, b);
            for c in [a, b] {
                if self.has_room(c) {
                    open.insert((self.degree(c), c));
                }
            }
        }
    }

    /// Members grouped by component, each group sorted and the groups ordered
    /// by their smallest member.
    fn components(&self) -> Vec<Vec<usize>> {
        let mut sets = UnionFind::new(self.adj.len());
        for a in 0..self.adj.len() {
            for &b in self.adj[a].range(a + 1..) {
                sets.union(a, b);
            }
        }
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for a in 0..self.adj.len() {
            groups.entry(sets.find(a)).or_default().push(a);
        }
        let mut components: Vec<Vec<usize>> = groups.into_values().collect();
        components.sort_unstable_by_key(|component| component[0]);
        components
    }

    /// An edge on a cycle of the component containing `start`, so removing
    /// it keeps the component connected. Found as the first non-tree edge of a
    /// depth-first walk.
    fn cycle_edge(&self, start: usize) -> Option<(usize, usize)> {
        let mut parent: BTreeMap<usize, usize> = BTreeMap::new();
        parent.insert(start, start);
        let mut stack = vec![start];
        while let Some(a) = stack.pop() {
            for &b in &self.adj[a] {
                match parent.get(&b) {
                    None => {
                        parent.insert(b, a);
                        stack.push(b);
                    }
                    Some(_) if parent[&a] == b => {}
                    Some(_) => return Some((a.min(b), a.max(b))),
                }
            }
        }
        None
    }

    fn least_connected_with_room(&self, component: &[usize]) -> Option<usize> {
        component
            .iter()
            .copied()
            .filter(|&a| self.has_room(a))
            .min_by_key(|&a| (self.degree(a), a))
    }

    /// Folds every component into the first one that has a free slot, or the
    /// first one if none has. Each step either spends free slots or swaps a
    /// cycle edge on each side for two crossing edges, so no degree grows past
    /// the bound. The swap leaves both crossing edges on a cycle, and the next
    /// step reuses one of them instead of searching the merged component
    /// again.
    fn merge_components(&mut self) {
        let mut components = self.components();
        if components.len() < 2 {
            return;
        }
        let first = components
            .iter()
            .position(|component| self.least_connected_with_room(component).is_some())
            .unwrap_or(0);
        let merged = components.remove(first);
        let root = merged[0];
        let mut free = self.least_connected_with_room(&merged);
        let mut spare: Option<(usize, usize)> = None;

        for component in components {
            let other_free = self.least_connected_with_room(&component);
            match (free, other_free) {
                (Some(a), Some(b)) => {
                    self.add(a, b);
                    free = [a, b].into_iter().find(|&c| self.has_room(c));
                }
                (Some(a), None) => {
                    let Some((x, y)) = self.cycle_edge(component[0]) else {
                        continue;
                    };
                    self.remove(x, y);
                    self.add(a, x);
                    // y gave up an edge and has room now
                    free = Some(if self.has_room(a) { a } else { y });
                }
                (None, other) => {
                    let Some((p, q)) = spare.take().or_else(|| self.cycle_edge(root)) else {
                        continue;
                    };
                    match other {
                        Some(b) => {
                            self.remove(p, q);
                            self.add(b, p);
                            free = Some(if self.has_room(b) { b } else { q });
                        }
                        None => {
                            let Some((x, y)) = self.cycle_edge(component[0]) else {
                                spare = Some((p, q));
                                continue;
                            };
                            self.remove(p, q);
                            self.remove(x, y);
                            self.add(p, x);
                            self.add(q, y);
                            spare = Some((p, x));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use petgraph::{algo::kosaraju_scc, graphmap::UnGraphMap};
    use proptest::prelude::*;

    use super::*;

    fn peer(i: usize) -> PeerId {
        PeerId::new(format!("node-{i:02}"))
    }

    fn adjacency(len: usize, edges: &[(usize, usize)]) -> Adjacency {
        let mut adj: Adjacency = (0..len).map(|i| (peer(i), BTreeSet::new())).collect();
        for &(a, b) in edges {
            if a == b || a >= len || b >= len {
                continue;
            }
            if let Some(neighbors) = adj.get_mut(&peer(a)) {
                neighbors.insert(peer(b));
            }
            if let Some(neighbors) = adj.get_mut(&peer(b)) {
                neighbors.insert(peer(a));
            }
        }
        adj
    }

    fn is_connected(adj: &Adjacency) -> bool {
        let mut graph = UnGraphMap::<&str, ()>::new();
        for (id, neighbors) in adj {
            graph.add_node(id.as_str());
            for neighbor in neighbors {
                graph.add_edge(id.as_str(), neighbor.as_str(), ());
            }
        }
        kosaraju_scc(&graph).len() <= 1
    }

    fn assert_well_formed(current: &Adjacency, planned: &Adjacency, max_degree: usize) {
        assert_eq!(
            planned.keys().collect::<Vec<_>>(),
            current.keys().collect::<Vec<_>>()
        );
        for (id, neighbors) in planned {
            assert!(!neighbors.contains(id), "{id} is its own neighbour");
            assert!(neighbors.len() <= max_degree, "{id} has {} neighbours", neighbors.len());
            for neighbor in neighbors {
                assert!(planned[neighbor].contains(id), "{id} -> {neighbor} is one-sided");
            }
        }
    }

    #[test]
    fn new_members_are_connected_to_the_least_connected() {
        // a path 0-1-2 plus a newcomer 3
        let current = adjacency(4, &[(0, 1), (1, 2)]);
        let planned = BalancedTopology.plan(&current, 2);
        assert_well_formed(&current, &planned, 2);
        assert!(is_connected(&planned));
        assert!(!planned[&peer(3)].is_empty());
        // existing edges with room are kept
        assert!(planned[&peer(0)].contains(&peer(1)));
    }

    #[test]
    fn over_full_members_are_trimmed() {
        let star: Vec<_> = (1..8).map(|i| (0, i)).collect();
        let current = adjacency(8, &star);
        let planned = BalancedTopology.plan(&current, 3);
        assert_well_formed(&current, &planned, 3);
        assert!(is_connected(&planned));
    }

    #[test]
    fn full_components_are_rewired() {
        // two disjoint 4-cliques with degree bound 3: every member is full
        let mut edges = vec![];
        for base in [0, 4] {
            for a in base..base + 4 {
                for b in a + 1..base + 4 {
                    edges.push((a, b));
                }
            }
        }
        let current = adjacency(8, &edges);
        let planned = BalancedTopology.plan(&current, 3);
        assert_well_formed(&current, &planned, 3);
        assert!(is_connected(&planned));
    }

    #[test]
    fn many_full_cliques_are_chained_together() {
        // 300 disjoint 5-cliques with degree bound 4 leave no free slot anywhere
        let mut edges = vec![];
        for base in (0..1500).step_by(5) {
            for a in base..base + 5 {
                for b in a + 1..base + 5 {
                    edges.push((a, b));
                }
            }
        }
        let current = adjacency(1500, &edges);
        let planned = BalancedTopology.plan(&current, 4);
        assert_well_formed(&current, &planned, 4);
        assert!(is_connected(&planned));
    }

    #[test]
    fn large_overlays_plan_without_stalling() {
        let current = adjacency(20_000, &[]);
        let started = Instant::now();
        let planned = BalancedTopology.plan(&current, 4);
        let elapsed = started.elapsed();
        assert_well_formed(&current, &planned, 4);
        assert!(is_connected(&planned));
        // a quadratic planner needs minutes here
        assert!(elapsed < Duration::from_secs(20), "planning took {elapsed:?}");
    }

    #[test]
    fn lone_and_empty_overlays() {
        let planned = BalancedTopology.plan(&Adjacency::new(), 4);
        assert!(planned.is_empty());
        let current = adjacency(1, &[]);
        let planned = BalancedTopology.plan(&current, 4);
        assert!(planned[&peer(0)].is_empty());
    }

    proptest! {
        #[test]
        fn plans_are_bounded_and_connected(
            len in 0usize..14,
            max_degree in 1usize..6,
            edges in proptest::collection::vec((0usize..14, 0usize..14), 0..40),
        ) {
            let current = adjacency(len, &edges);
            let planned = BalancedTopology.plan(&current, max_degree);
            assert_well_formed(&current, &planned, max_degree);
            if max_degree >= 2 {
                prop_assert!(is_connected(&planned));
            }
        }
    }
}
