use std::net::SocketAddr;

use crate::identity::PeerId;

/// Where a tracker can be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
}

impl TrackerInfo {
    pub fn new(id: impl Into<PeerId>, addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            addr,
        }
    }
}

/// Static partitioning of streams over a fixed set of trackers. Every
/// partition of a stream is coordinated by the same tracker.
#[derive(Clone, Debug, Default)]
pub struct TrackerRegistry {
    trackers: Vec<TrackerInfo>,
}

impl TrackerRegistry {
    pub fn new(trackers: Vec<TrackerInfo>) -> Self {
        Self { trackers }
    }

    pub fn single(tracker: TrackerInfo) -> Self {
        Self::new(vec![tracker])
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn all(&self) -> &[TrackerInfo] {
        &self.trackers
    }

    pub fn get(&self, id: &PeerId) -> Option<&TrackerInfo> {
        self.trackers.iter().find(|tracker| &tracker.id == id)
    }

    /// Returns the tracker responsible for `stream_id`.
    pub fn tracker_for(&self, stream_id: &str) -> Option<&TrackerInfo> {
        if self.trackers.is_empty() {
            return None;
        }
        let digest = blake3::hash(stream_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        let index = u64::from_le_bytes(prefix) % self.trackers.len() as u64;
        self.trackers.get(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TrackerRegistry {
        TrackerRegistry::new(
            (0..3)
                .map(|i| TrackerInfo::new(format!("tracker-{i}"), ([127, 0, 0, 1], 30300 + i).into()))
                .collect(),
        )
    }

    #[test]
    fn mapping_is_stable() {
        let registry = registry();
        let first = registry.tracker_for("stream-1").cloned();
        assert!(first.is_some());
        for _ in 0..10 {
            assert_eq!(registry.tracker_for("stream-1").cloned(), first);
        }
    }

    #[test]
    fn spreads_streams_over_trackers() {
        let registry = registry();
        let used: std::collections::HashSet<_> = (0..64)
            .filter_map(|i| registry.tracker_for(&format!("stream-{i}")))
            .map(|tracker| tracker.id.clone())
            .collect();
        assert!(used.len() > 1);
    }

    #[test]
    fn empty_registry_has_no_tracker() {
        assert!(TrackerRegistry::default().tracker_for("stream").is_none());
    }
}
