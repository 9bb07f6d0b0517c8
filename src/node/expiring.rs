use std::{cmp::Reverse, collections::BinaryHeap, hash::Hash, time::Duration};

use hashbrown::HashMap;
use tokio::time::Instant;

/// A set whose entries expire after a per-entry time to live.
#[derive(Debug)]
pub struct ExpiringSet<T: Hash + Eq + Ord + Clone> {
    /// Latest expiry of every live entry, used for membership checks.
    expiries: HashMap<T, Instant>,
    /// Expiry times in ascending order. May hold outdated entries for values
    /// that were re-inserted later.
    queue: BinaryHeap<Reverse<(Instant, T)>>,
}

impl<T: Hash + Eq + Ord + Clone> Default for ExpiringSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Hash + Eq + Ord + Clone> ExpiringSet<T> {
    pub fn new() -> Self {
        Self {
            expiries: HashMap::new(),
            queue: BinaryHeap::new(),
        }
    }

    pub fn insert(&mut self, value: T, ttl: Duration, now: Instant) {
        let expiry = now + ttl;
        self.expiries.insert(value.clone(), expiry);
        self.queue.push(Reverse((expiry, value)));
    }

    pub fn contains(&self, value: &T) -> bool {
        self.expiries.contains_key(value)
    }

    pub fn remove_expired(&mut self, now: Instant) {
        while self
            .queue
            .peek()
            .map_or(false, |Reverse((expiry, _))| *expiry <= now)
        {
            let Some(Reverse((expiry, value))) = self.queue.pop() else {
                break;
            };
            // only the latest insertion decides when a value expires
            if self.expiries.get(&value) == Some(&expiry) {
                self.expiries.remove(&value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.expiries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_after_their_ttl() {
        let now = Instant::now();
        let mut set = ExpiringSet::new();
        set.insert(1, Duration::from_secs(1), now);
        set.insert(2, Duration::from_secs(10), now);

        set.remove_expired(now + Duration::from_millis(999));
        assert!(set.contains(&1));

        set.remove_expired(now + Duration::from_secs(1));
        assert!(!set.contains(&1));
        assert!(set.contains(&2));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn reinsertion_extends_lifetime() {
        let now = Instant::now();
        let mut set = ExpiringSet::new();
        set.insert("id", Duration::from_secs(1), now);
        set.insert("id", Duration::from_secs(5), now);
        set.remove_expired(now + Duration::from_secs(2));
        assert!(set.contains(&"id"));
        set.remove_expired(now + Duration::from_secs(5));
        assert!(set.is_empty());
    }
}
