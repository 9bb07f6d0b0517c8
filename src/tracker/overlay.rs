// Overlay state of one tracker. Everything here is synchronous and owned by the
// tracker loop: statuses go in through submit_status, instructions come out of
// compute_instructions, and the summary is the only read access.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use hashbrown::HashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    identity::{Location, PeerId},
    metrics::{self, MetricsSink},
    protocol::messages::{Status, StreamPartitionKey},
};

use super::{
    summary::{NeighborSummary, TopologySummary},
    topology::{Adjacency, TopologyStrategy},
};

/// Target neighbour set for one participant on one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub participant: PeerId,
    pub key: StreamPartitionKey,
    pub neighbors: Vec<PeerId>,
    pub counter: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Member {
    /// Highest of the last accepted status counter and the last issued
    /// instruction counter. Statuses below it are stale.
    threshold: u64,
    /// Neighbours as last reported, unfiltered.
    reported: BTreeSet<PeerId>,
    /// Set last handed out, while the member has not contradicted it with a
    /// newer report.
    instructed: Option<BTreeSet<PeerId>>,
    /// Peers of `instructed` the member has reported connected since the
    /// instruction. Losing one of them contradicts the instruction; reporting
    /// only part of the set while links come up does not.
    confirmed: BTreeSet<PeerId>,
}

impl Member {
    fn new(threshold: u64, reported: BTreeSet<PeerId>) -> Self {
        Self {
            threshold,
            reported,
            instructed: None,
            confirmed: BTreeSet::new(),
        }
    }

    // a report still on the way to the instructed set keeps it valid
    fn accept_report(&mut self, reported: BTreeSet<PeerId>) {
        let on_track = self.instructed.as_ref().map_or(false, |instructed| {
            reported.is_subset(instructed) && self.confirmed.is_subset(&reported)
        });
        if on_track {
            self.confirmed.extend(reported.iter().cloned());
        } else {
            self.instructed = None;
            self.confirmed.clear();
        }
        self.reported = reported;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Overlay {
    members: BTreeMap<PeerId, Member>,
    pending: bool,
    empty_since: Option<Instant>,
}

impl Overlay {
    fn new() -> Self {
        Self {
            members: BTreeMap::new(),
            pending: false,
            empty_since: None,
        }
    }

    fn filtered(&self, id: &PeerId, set: &BTreeSet<PeerId>) -> BTreeSet<PeerId> {
        set.iter()
            .filter(|n| *n != id && self.members.contains_key(*n))
            .cloned()
            .collect()
    }

    // each member's view: what it was told if still valid, else what it said
    fn working_graph(&self) -> Adjacency {
        let views: BTreeMap<&PeerId, BTreeSet<PeerId>> = self
            .members
            .iter()
            .map(|(id, m)| (id, self.filtered(id, m.instructed.as_ref().unwrap_or(&m.reported))))
            .collect();
        views
            .iter()
            .map(|(id, view)| {
                let agreed = view
                    .iter()
                    .filter(|n| views.get(n).map_or(false, |other| other.contains(*id)))
                    .cloned()
                    .collect();
                ((*id).clone(), agreed)
            })
            .collect()
    }
}

pub struct TrackerCore {
    overlays: HashMap<StreamPartitionKey, Overlay>,
    rtts: HashMap<PeerId, HashMap<PeerId, u64>>,
    locations: HashMap<PeerId, Location>,
    max_degree: usize,
    topology: Arc<dyn TopologyStrategy>,
    metrics: Arc<dyn MetricsSink>,
}

impl TrackerCore {
    pub fn new(
        max_degree: usize,
        topology: Arc<dyn TopologyStrategy>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            overlays: HashMap::new(),
            rtts: HashMap::new(),
            locations: HashMap::new(),
            max_degree,
            topology,
            metrics,
        }
    }

    /// Applies a participant's status, key by key. Stale keys are dropped
    /// silently while the other keys of the same status are still applied.
    pub fn submit_status(&mut self, participant: &PeerId, status: &Status, now: Instant) {
        self.metrics.increment(metrics::STATUS_RECEIVED, 1);

        for stream in &status.streams {
            let reported: BTreeSet<PeerId> = stream
                .neighbors()
                .into_iter()
                .filter(|n| n != participant)
                .collect();
            let overlay = self
                .overlays
                .entry(stream.key.clone())
                .or_insert_with(Overlay::new);
            overlay.empty_since = None;

            match overlay.members.get_mut(participant) {
                None => {
                    debug!(%participant, key = %stream.key, counter = stream.counter, "participant joined");
                    overlay
                        .members
                        .insert(participant.clone(), Member::new(stream.counter, reported));
                    overlay.pending = true;
                }
                Some(member) if stream.counter < member.threshold => {
                    debug!(
                        %participant,
                        key = %stream.key,
                        counter = stream.counter,
                        threshold = member.threshold,
                        "ignoring stale status"
                    );
                    self.metrics.increment(metrics::STATUS_STALE, 1);
                }
                Some(member) if stream.counter == member.threshold => {
                    trace!(%participant, key = %stream.key, "status refresh");
                    if let Some(instructed) = &member.instructed {
                        member
                            .confirmed
                            .extend(reported.intersection(instructed).cloned());
                    }
                    member.reported = reported;
                }
                Some(member) => {
                    member.threshold = stream.counter;
                    member.accept_report(reported);
                    overlay.pending = true;
                }
            }
        }

        if !status.single_stream {
            let listed: BTreeSet<&StreamPartitionKey> =
                status.streams.iter().map(|s| &s.key).collect();
            for (key, overlay) in self.overlays.iter_mut() {
                if listed.contains(key) {
                    continue;
                }
                if overlay.members.remove(participant).is_some() {
                    debug!(%participant, %key, "participant left");
                    overlay.pending = true;
                    if overlay.members.is_empty() {
                        overlay.empty_since = Some(now);
                    }
                }
            }
        }

        if !status.rtts.is_empty() {
            let samples = status
                .rtts
                .iter()
                .map(|s| (s.peer.clone(), s.rtt_micros))
                .collect();
            self.rtts.insert(participant.clone(), samples);
        }
        if let Some(location) = &status.location {
            self.locations.insert(participant.clone(), location.clone());
        }
    }

    /// Keys whose overlay changed since instructions were last computed.
    pub fn pending_keys(&self) -> Vec<StreamPartitionKey> {
        let mut keys: Vec<_> = self
            .overlays
            .iter()
            .filter(|(_, overlay)| overlay.pending)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Plans the overlay of `key` and returns, ordered by participant, an
    /// instruction for every member whose target differs from what it was last
    /// told. Does nothing unless the overlay changed since the last call.
    pub fn compute_instructions(&mut self, key: &StreamPartitionKey) -> Vec<Instruction> {
        let Some(overlay) = self.overlays.get_mut(key) else {
            return Vec::new();
        };
        if !overlay.pending {
            return Vec::new();
        }
        overlay.pending = false;
        if overlay.members.len() < 2 {
            return Vec::new();
        }

        let planned = self.topology.plan(&overlay.working_graph(), self.max_degree);
        let mut instructions = Vec::new();
        for (participant, member) in overlay.members.iter_mut() {
            let target = planned.get(participant).cloned().unwrap_or_default();
            if member.instructed.as_ref() == Some(&target) {
                continue;
            }
            member.threshold += 1;
            instructions.push(Instruction {
                participant: participant.clone(),
                key: key.clone(),
                neighbors: target.iter().cloned().collect(),
                counter: member.threshold,
            });
            member.instructed = Some(target);
            member.confirmed.clear();
        }
        debug!(%key, count = instructions.len(), "computed instructions");
        instructions
    }

    /// Removes a participant from every overlay. Returns the affected keys,
    /// which are marked for recomputation.
    pub fn remove_participant(&mut self, participant: &PeerId, now: Instant) -> Vec<StreamPartitionKey> {
        let mut affected = Vec::new();
        for (key, overlay) in self.overlays.iter_mut() {
            if overlay.members.remove(participant).is_some() {
                overlay.pending = true;
                if overlay.members.is_empty() {
                    overlay.empty_since = Some(now);
                }
                affected.push(key.clone());
            }
        }
        self.rtts.remove(participant);
        self.locations.remove(participant);
        affected.sort();
        affected
    }

    /// Drops overlays that have had no members for at least `idle`.
    pub fn prune_idle(&mut self, now: Instant, idle: Duration) -> Vec<StreamPartitionKey> {
        let expired: Vec<StreamPartitionKey> = self
            .overlays
            .iter()
            .filter(|(_, overlay)| {
                overlay.members.is_empty()
                    && overlay
                        .empty_since
                        .map_or(true, |since| now.saturating_duration_since(since) >= idle)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            debug!(%key, "pruning idle overlay");
            self.overlays.remove(key);
        }
        expired
    }

    pub fn overlay_count(&self) -> usize {
        self.overlays.len()
    }

    pub fn members(&self, key: &StreamPartitionKey) -> Vec<PeerId> {
        self.overlays
            .get(key)
            .map(|overlay| overlay.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The freshness threshold stored for a participant on a key.
    pub fn counter(&self, key: &StreamPartitionKey, participant: &PeerId) -> Option<u64> {
        self.overlays
            .get(key)
            .and_then(|overlay| overlay.members.get(participant))
            .map(|member| member.threshold)
    }

    /// Reported neighbours of a participant, limited to current members.
    pub fn reported_neighbors(&self, key: &StreamPartitionKey, participant: &PeerId) -> Vec<PeerId> {
        self.overlays
            .get(key)
            .and_then(|overlay| {
                let member = overlay.members.get(participant)?;
                Some(overlay.filtered(participant, &member.reported).into_iter().collect())
            })
            .unwrap_or_default()
    }

    pub fn summary(&self) -> TopologySummary {
        let streams = self
            .overlays
            .iter()
            .map(|(key, overlay)| {
                let nodes = overlay
                    .members
                    .iter()
                    .map(|(id, member)| {
                        let rtts = self.rtts.get(id);
                        let neighbors = overlay
                            .filtered(id, &member.reported)
                            .into_iter()
                            .map(|peer_id| NeighborSummary {
                                rtt_micros: rtts.and_then(|r| r.get(&peer_id).copied()),
                                peer_id,
                            })
                            .collect();
                        (id.clone(), neighbors)
                    })
                    .collect();
                (key.clone(), nodes)
            })
            .collect();
        let locations = self
            .locations
            .iter()
            .map(|(id, location)| (id.clone(), location.clone()))
            .collect();
        TopologySummary { streams, locations }
    }
}
