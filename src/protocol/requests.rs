use hashbrown::HashMap;
use tokio::time::Instant;

use super::messages::RequestId;

/// Outstanding requests keyed by request id. Replies are matched by id, never
/// by arrival order, so several exchanges with the same peer may be in flight.
#[derive(Debug)]
pub struct PendingRequests<T> {
    pending: HashMap<RequestId, (Instant, T)>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` under a fresh request id that expires at `deadline`.
    pub fn insert(&mut self, value: T, deadline: Instant) -> RequestId {
        let id = RequestId::new();
        self.pending.insert(id.clone(), (deadline, value));
        id
    }

    pub fn resolve(&mut self, id: &RequestId) -> Option<T> {
        if id.is_none() {
            return None;
        }
        self.pending.remove(id).map(|(_, value)| value)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    /// Removes and returns every request whose deadline is not after `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(RequestId, T)> {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|(_, value)| (id, value)))
            .collect()
    }

    /// Removes every request whose value matches `pred`.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, (_, value))| pred(value))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.pending.remove(id).map(|(_, value)| value))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(deadline, _)| *deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (RequestId, T)> + '_ {
        self.pending.drain().map(|(id, (_, value))| (id, value))
    }
}
