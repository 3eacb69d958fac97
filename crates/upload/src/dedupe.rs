//! In-flight dedupe set.
//!
//! Concurrent uploads of the same id race for one claim; losers are told the
//! item already exists (202) with no side effects. Entries expire so a
//! crashed request can never wedge an id, and the set is capacity-bounded so
//! an abusive client cannot grow it without limit.

use std::time::{Duration, Instant};

use anchorage_primitives::DataItemId;
use dashmap::DashMap;

#[derive(Debug)]
pub struct InFlightSet {
    entries: DashMap<DataItemId, Instant>,
    capacity: usize,
    ttl: Duration,
}

impl Default for InFlightSet {
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(60))
    }
}

impl InFlightSet {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Claims `id` for the calling upload. Returns false when a live claim
    /// already exists.
    pub fn try_claim(&self, id: DataItemId) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().elapsed() < self.ttl {
                    return false;
                }
                occupied.insert(Instant::now());
                true
            }
            Entry::Vacant(vacant) => {
                if self.entries.len() >= self.capacity {
                    drop(vacant);
                    self.sweep_expired();
                    if self.entries.len() >= self.capacity {
                        // Full of live claims: refuse rather than grow.
                        return false;
                    }
                    return match self.entries.entry(id) {
                        Entry::Occupied(_) => false,
                        Entry::Vacant(vacant) => {
                            vacant.insert(Instant::now());
                            true
                        }
                    };
                }
                vacant.insert(Instant::now());
                true
            }
        }
    }

    /// Releases a claim; the upload reached a terminal state.
    pub fn release(&self, id: &DataItemId) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, claimed_at| claimed_at.elapsed() < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> DataItemId {
        DataItemId::from_bytes([seed; 32])
    }

    #[test]
    fn second_claim_loses() {
        let set = InFlightSet::default();
        assert!(set.try_claim(id(1)));
        assert!(!set.try_claim(id(1)));
        set.release(&id(1));
        assert!(set.try_claim(id(1)));
    }

    #[test]
    fn expired_claims_can_be_retaken() {
        let set = InFlightSet::new(10, Duration::from_millis(0));
        assert!(set.try_claim(id(1)));
        // TTL zero: the claim is immediately stale.
        assert!(set.try_claim(id(1)));
    }

    #[test]
    fn capacity_is_enforced_against_live_claims() {
        let set = InFlightSet::new(3, Duration::from_secs(60));
        for seed in 0..3 {
            assert!(set.try_claim(id(seed)));
        }
        assert!(!set.try_claim(id(9)));
        set.release(&id(0));
        assert!(set.try_claim(id(9)));
    }

    #[test]
    fn sweeping_makes_room_at_capacity() {
        let set = InFlightSet::new(2, Duration::from_millis(0));
        assert!(set.try_claim(id(1)));
        assert!(set.try_claim(id(2)));
        // Both are expired, so a new claim sweeps and succeeds.
        assert!(set.try_claim(id(3)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn concurrent_claims_have_exactly_one_winner() {
        let set = std::sync::Arc::new(InFlightSet::default());
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let set = set.clone();
                    scope.spawn(move || usize::from(set.try_claim(id(7))))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }
}
