//! Bounded store keyed by sequence number.
//!
//! One instance holds sent-but-unacknowledged frames, another holds
//! received-but-not-yet-consumed packets. Each is owned by a single session
//! and mutated only through `&mut`, so the driver's ownership of the session
//! serializes access.

use std::collections::BTreeMap;

/// Bounded reorder/retransmit buffer.
///
/// # Invariants
///
/// - `len() <= capacity()` after every operation
/// - When full, pushing a new key evicts the lowest (oldest) key
#[derive(Debug, Clone)]
pub struct ReorderBuffer<T> {
    capacity: usize,
    entries: BTreeMap<u32, T>,
}

impl<T> ReorderBuffer<T> {
    /// An empty buffer holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: BTreeMap::new() }
    }

    /// Insert `value` under `sequence`, replacing any previous value.
    ///
    /// Returns the key evicted to make room, if any.
    pub fn push(&mut self, sequence: u32, value: T) -> Option<u32> {
        let mut evicted = None;
        if !self.entries.contains_key(&sequence) && self.entries.len() >= self.capacity {
            evicted = self.entries.pop_first().map(|(key, _)| key);
        }
        self.entries.insert(sequence, value);
        evicted
    }

    /// True if `sequence` is stored.
    pub fn exists(&self, sequence: u32) -> bool {
        self.entries.contains_key(&sequence)
    }

    /// Borrow the value under `sequence`.
    pub fn peek(&self, sequence: u32) -> Option<&T> {
        self.entries.get(&sequence)
    }

    /// Remove and return the value under `sequence`.
    pub fn pop(&mut self, sequence: u32) -> Option<T> {
        self.entries.remove(&sequence)
    }

    /// Remove the value under `sequence`, if present.
    pub fn destroy(&mut self, sequence: u32) {
        self.entries.remove(&sequence);
    }

    /// Highest stored key.
    pub fn highest_key(&self) -> Option<u32> {
        self.entries.last_key_value().map(|(key, _)| *key)
    }

    /// Drop every entry with a key below `sequence`.
    pub fn discard_below(&mut self, sequence: u32) {
        self.entries = self.entries.split_off(&sequence);
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn push_peek_pop_destroy() {
        let mut buffer = ReorderBuffer::new(4);
        assert_eq!(buffer.push(3, "c"), None);
        assert_eq!(buffer.push(1, "a"), None);

        assert!(buffer.exists(3));
        assert_eq!(buffer.peek(1), Some(&"a"));
        assert_eq!(buffer.highest_key(), Some(3));

        assert_eq!(buffer.pop(1), Some("a"));
        assert_eq!(buffer.pop(1), None);

        buffer.destroy(3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.highest_key(), None);
    }

    #[test]
    fn overflow_evicts_lowest_key() {
        let mut buffer = ReorderBuffer::new(2);
        buffer.push(10, ());
        buffer.push(5, ());
        assert_eq!(buffer.push(20, ()), Some(5));
        assert!(!buffer.exists(5));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn replacing_a_key_does_not_evict() {
        let mut buffer = ReorderBuffer::new(2);
        buffer.push(1, 'a');
        buffer.push(2, 'b');
        assert_eq!(buffer.push(2, 'c'), None);
        assert_eq!(buffer.peek(2), Some(&'c'));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn discard_below_keeps_the_boundary() {
        let mut buffer = ReorderBuffer::new(8);
        for key in [1, 4, 5, 9] {
            buffer.push(key, key);
        }
        buffer.discard_below(5);
        assert!(!buffer.exists(4));
        assert!(buffer.exists(5));
        assert_eq!(buffer.len(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(capacity in 1usize..32, keys in prop::collection::vec(any::<u32>(), 0..128)) {
            let mut buffer = ReorderBuffer::new(capacity);
            for key in keys {
                buffer.push(key, ());
                prop_assert!(buffer.len() <= capacity);
                prop_assert!(buffer.exists(key));
            }
        }
    }
}
