use fnv::FnvHashMap;

use packet::ConnectionId;

/// Connection IDs issued to the peer and still routable to this session.
///
/// The size of this set is the embedder's signal that the session may
/// migrate: a peer can only switch paths while it holds a spare ID.
pub struct ConnectionIdSet {
    ids: FnvHashMap<u64, ConnectionId>,
    next_sequence: u64,
}

impl ConnectionIdSet {
    pub fn new() -> Self {
        ConnectionIdSet {
            ids: FnvHashMap::default(),
            next_sequence: 0,
        }
    }

    /// Track a newly issued ID, returning its sequence number
    pub fn insert(&mut self, id: ConnectionId) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.ids.insert(sequence, id);
        sequence
    }

    /// Stop tracking the ID retired by the peer
    pub fn retire(&mut self, sequence: u64) -> Option<ConnectionId> {
        self.ids.remove(&sequence)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.ids.values().any(|x| x == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &ConnectionId)> {
        self.ids.iter().map(|(&seq, id)| (seq, id))
    }

    /// Drain every tracked ID, for teardown
    pub fn drain(&mut self) -> Vec<ConnectionId> {
        self.ids.drain().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sequences_are_monotonic() {
        let mut set = ConnectionIdSet::new();
        let a = ConnectionId::new(&[1; 8]);
        let b = ConnectionId::new(&[2; 8]);
        assert_eq!(set.insert(a), 0);
        assert_eq!(set.insert(b), 1);
        assert_eq!(set.len(), 2);

        assert_eq!(set.retire(0), Some(a));
        assert_eq!(set.retire(0), None);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&b));
        assert!(!set.contains(&a));

        // sequences are not reused after retirement
        assert_eq!(set.insert(a), 2);
    }
}
