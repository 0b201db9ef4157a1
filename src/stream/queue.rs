//! Ordered set of chunks waiting to be sent
//!
//! Removal is lazy: a key leaves the membership set immediately and its slot
//! in the order vector is skipped when popped or compacted on the next sort.

use rustc_hash::FxHashSet;

use crate::constants::view::SEND_QUEUE_CAPACITY;
use crate::stream::comparator::DistanceComparator;
use crate::util::ChunkKey;

#[derive(Debug, Default)]
pub struct SendQueue {
    /// Send order; the tail is sent first. May hold stale or duplicate entries.
    order: Vec<ChunkKey>,
    members: FxHashSet<ChunkKey>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            order: Vec::with_capacity(SEND_QUEUE_CAPACITY),
            members: FxHashSet::default(),
        }
    }

    /// Add a key at the tail. Returns false if it was already queued.
    pub fn push(&mut self, key: ChunkKey) -> bool {
        if self.members.insert(key) {
            if self.order.len() >= 2 * (self.members.len() + SEND_QUEUE_CAPACITY) {
                self.compact();
            }
            self.order.push(key);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, key: ChunkKey) -> bool {
        self.members.remove(&key)
    }

    #[inline]
    pub fn contains(&self, key: ChunkKey) -> bool {
        self.members.contains(&key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Take the most urgent key
    pub fn pop(&mut self) -> Option<ChunkKey> {
        while let Some(key) = self.order.pop() {
            if self.members.remove(&key) {
                return Some(key);
            }
        }
        None
    }

    /// Keep only keys matching the predicate
    pub fn retain<F: FnMut(ChunkKey) -> bool>(&mut self, mut keep: F) {
        self.members.retain(|&k| keep(k));
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    /// Drop stale slots, then order by urgency (most urgent last)
    pub fn sort(&mut self, comparator: &DistanceComparator) {
        self.compact();
        self.order.sort_unstable_by(|a, b| comparator.compare(*a, *b));
    }

    /// Keep the last slot of each live key
    fn compact(&mut self) {
        let members = &self.members;
        let mut seen = FxHashSet::with_capacity_and_hasher(members.len(), Default::default());
        let mut live: Vec<ChunkKey> = self
            .order
            .iter()
            .rev()
            .copied()
            .filter(|k| members.contains(k) && seen.insert(*k))
            .collect();
        live.reverse();
        self.order = live;
    }

    /// Live keys in send order, least urgent first
    pub fn iter(&self) -> impl Iterator<Item = ChunkKey> + '_ {
        let mut seen = FxHashSet::default();
        self.order
            .iter()
            .copied()
            .filter(move |k| self.members.contains(k) && seen.insert(*k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::DirectionFace;

    #[test]
    fn test_push_is_deduplicated() {
        let mut queue = SendQueue::new();
        assert!(queue.push(ChunkKey::new(1, 1)));
        assert!(!queue.push(ChunkKey::new(1, 1)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_skips_removed() {
        let mut queue = SendQueue::new();
        queue.push(ChunkKey::new(0, 0));
        queue.push(ChunkKey::new(1, 0));
        queue.push(ChunkKey::new(2, 0));
        assert!(queue.remove(ChunkKey::new(2, 0)));

        assert_eq!(queue.pop(), Some(ChunkKey::new(1, 0)));
        assert_eq!(queue.pop(), Some(ChunkKey::new(0, 0)));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_then_push_again() {
        let mut queue = SendQueue::new();
        queue.push(ChunkKey::new(0, 0));
        queue.push(ChunkKey::new(1, 0));
        queue.remove(ChunkKey::new(0, 0));
        queue.push(ChunkKey::new(0, 0));

        // The re-pushed key now sits at the tail; the stale slot must not yield it twice
        assert_eq!(queue.pop(), Some(ChunkKey::new(0, 0)));
        assert_eq!(queue.pop(), Some(ChunkKey::new(1, 0)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_sort_puts_nearest_last() {
        let mut queue = SendQueue::new();
        for key in crate::util::chunk_key::square(0, 0, 2) {
            queue.push(key);
        }
        queue.remove(ChunkKey::new(2, 2));
        queue.sort(&DistanceComparator::new(0, 0, DirectionFace::South));

        assert_eq!(queue.iter().count(), 24);
        assert_eq!(queue.pop(), Some(ChunkKey::new(0, 0)));
        assert_eq!(queue.pop(), Some(ChunkKey::new(0, 1)));
    }

    #[test]
    fn test_retain() {
        let mut queue = SendQueue::new();
        for key in crate::util::chunk_key::square(0, 0, 3) {
            queue.push(key);
        }
        queue.retain(|k| k.within(0, 0, 1));
        assert_eq!(queue.len(), 9);
        assert!(queue.iter().all(|k| k.within(0, 0, 1)));
    }
}
