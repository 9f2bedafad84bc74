//! Bounded sequence-indexed store
//!
//! A fixed-capacity ring of optional slots addressed by extended sequence
//! number. The store only ever moves forward: inserting beyond the newest
//! position silently evicts the oldest entries, and inserting before the
//! oldest retained position is rejected.

use crate::sequence::{SeqExtender, WrappingSeq};

/// Fixed-capacity ring keyed by sequence number
///
/// Raw sequence numbers are extended with an owned [`SeqExtender`], so the
/// store can be fed directly with on-the-wire values.
pub struct SequenceStore<T, N: WrappingSeq = u16> {
    /// Slot storage, indexed by `extended % capacity`
    slots: Vec<Option<T>>,
    /// Extender for incoming raw sequence numbers
    extender: SeqExtender<N>,
    /// Retained extended range `(first, last)`, inclusive
    bounds: Option<(u64, u64)>,
}

impl<T, N: WrappingSeq> SequenceStore<T, N> {
    /// Create a store retaining the `capacity` most recent positions
    ///
    /// # Panics
    /// Panics if `capacity` is zero
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "SequenceStore capacity must be at least 1");

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        SequenceStore {
            slots,
            extender: SeqExtender::new(),
            bounds: None,
        }
    }

    #[inline]
    fn index(&self, extended: u64) -> usize {
        (extended % self.slots.len() as u64) as usize
    }

    /// Store `value` at `raw`
    ///
    /// Returns `false` when `raw` resolves to a position older than the
    /// retained window.
    pub fn set(&mut self, raw: N, value: T) -> bool {
        let extended = self.extender.extend(raw);
        self.set_extended(extended, value)
    }

    /// Store `value` at an already extended position
    fn set_extended(&mut self, extended: u64, value: T) -> bool {
        let capacity = self.slots.len() as u64;

        let (mut first, mut last) = match self.bounds {
            None => (extended, extended),
            Some((first, _)) if extended < first => return false,
            Some(bounds) => bounds,
        };

        if extended > last {
            // Clear positions between the old end and the new one; older
            // contents of those slots belong to evicted sequences
            let gap = (extended - last).min(capacity);
            for offset in 0..gap {
                let idx = self.index(extended - offset);
                self.slots[idx] = None;
            }
            last = extended;

            if last - first + 1 > capacity {
                first = last + 1 - capacity;
            }
        }

        let idx = self.index(extended);
        self.slots[idx] = Some(value);
        self.bounds = Some((first, last));
        true
    }

    #[inline]
    fn in_range(&self, extended: u64) -> bool {
        matches!(self.bounds, Some((first, last)) if extended >= first && extended <= last)
    }

    /// Check if a value is stored for `raw`
    pub fn is_present(&self, raw: N) -> bool {
        self.get(raw).is_some()
    }

    /// Get the value stored for `raw`
    pub fn get(&self, raw: N) -> Option<&T> {
        self.get_extended(self.extender.recover(raw))
    }

    /// Get the value stored at an extended position
    pub fn get_extended(&self, extended: u64) -> Option<&T> {
        if !self.in_range(extended) {
            return None;
        }
        self.slots[self.index(extended)].as_ref()
    }

    /// Oldest retained extended position
    pub fn first_seq(&self) -> Option<u64> {
        self.bounds.map(|(first, _)| first)
    }

    /// Newest retained extended position
    pub fn last_seq(&self) -> Option<u64> {
        self.bounds.map(|(_, last)| last)
    }

    /// Number of positions spanned by the retained window (occupied or not)
    pub fn len(&self) -> usize {
        match self.bounds {
            Some((first, last)) => (last - first + 1) as usize,
            None => 0,
        }
    }

    /// Check if nothing has been stored yet
    pub fn is_empty(&self) -> bool {
        self.bounds.is_none()
    }

    /// Maximum number of retained positions
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Iterate occupied positions in ascending order
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> + '_ {
        let range = match self.bounds {
            Some((first, last)) => first..last + 1,
            None => 0..0,
        };
        range.filter_map(move |seq| self.slots[self.index(seq)].as_ref().map(|v| (seq, v)))
    }

    /// Remove everything and forget the sequence history
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.extender.reset();
        self.bounds = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let mut store = SequenceStore::<&str>::new(8);
        assert!(store.is_empty());
        assert!(store.set(100, "a"));
        assert!(store.set(101, "b"));

        assert_eq!(store.get(100), Some(&"a"));
        assert_eq!(store.get(101), Some(&"b"));
        assert_eq!(store.get(102), None);
        assert_eq!(store.len(), 2);
        assert_eq!(store.first_seq(), Some(100));
        assert_eq!(store.last_seq(), Some(101));
    }

    #[test]
    fn test_gap_leaves_empty_slots() {
        let mut store = SequenceStore::<u32>::new(8);
        store.set(10, 1);
        store.set(13, 4);

        assert!(store.is_present(10));
        assert!(!store.is_present(11));
        assert!(!store.is_present(12));
        assert!(store.is_present(13));
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_eviction() {
        let mut store = SequenceStore::<u32>::new(4);
        for seq in 0u16..6 {
            assert!(store.set(seq, u32::from(seq)));
        }

        assert_eq!(store.len(), 4);
        assert_eq!(store.first_seq(), Some(2));
        assert!(!store.is_present(0));
        assert!(!store.is_present(1));
        for seq in 2u16..6 {
            assert_eq!(store.get(seq), Some(&u32::from(seq)));
        }
    }

    #[test]
    fn test_reject_backward() {
        let mut store = SequenceStore::<u32>::new(4);
        for seq in 10u16..20 {
            store.set(seq, 0);
        }
        assert!(!store.set(12, 1));
        assert!(!store.is_present(12));
        // Still inside the window: accepted
        assert!(store.set(17, 7));
        assert_eq!(store.get(17), Some(&7));
    }

    #[test]
    fn test_jump_clears_stale_slots() {
        let mut store = SequenceStore::<u32>::new(4);
        store.set(0, 0);
        store.set(1, 1);
        // Positions 4 and 5 share slots with 0 and 1
        store.set(6, 6);

        assert_eq!(store.first_seq(), Some(3));
        assert!(!store.is_present(4));
        assert!(!store.is_present(5));
        assert_eq!(store.get(6), Some(&6));
    }

    #[test]
    fn test_large_jump() {
        let mut store = SequenceStore::<u32>::new(4);
        store.set(0, 0);
        store.set(1000, 1000);
        assert_eq!(store.len(), 4);
        assert_eq!(store.iter().count(), 1);
    }

    #[test]
    fn test_wraparound() {
        let mut store = SequenceStore::<u16>::new(16);
        for seq in 65530u16..=65535 {
            store.set(seq, seq);
        }
        for seq in 0u16..4 {
            store.set(seq, seq);
        }

        assert_eq!(store.len(), 10);
        assert_eq!(store.get(65533), Some(&65533));
        assert_eq!(store.get(2), Some(&2));
        assert_eq!(store.last_seq(), Some(65536 + 3));
    }

    #[test]
    fn test_capacity_one() {
        let mut store = SequenceStore::<u32>::new(1);
        assert!(store.set(5, 5));
        assert!(store.set(6, 6));
        assert!(!store.set(5, 5));
        assert!(!store.is_present(5));
        assert_eq!(store.get(6), Some(&6));
        assert_eq!(store.len(), 1);
    }

    #[test]
    #[should_panic]
    fn test_zero_capacity() {
        let _ = SequenceStore::<u32>::new(0);
    }

    #[test]
    fn test_iter_ascending() {
        let mut store = SequenceStore::<u32>::new(8);
        store.set(1, 10);
        store.set(5, 50);
        store.set(3, 30);

        let items: Vec<_> = store.iter().map(|(seq, v)| (seq, *v)).collect();
        assert_eq!(items, vec![(1, 10), (3, 30), (5, 50)]);
    }

    #[test]
    fn test_clear() {
        let mut store = SequenceStore::<u32>::new(8);
        store.set(3, 30);
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
        assert!(store.set(1, 10));
    }
}
