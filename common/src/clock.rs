use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-node logical clock used to track causal relationships between
/// operations originating on different nodes.
///
/// Entries only grow: a counter never decreases and is never dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    /// Create an empty vector clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the entry for the given node.
    pub fn tick(&mut self, node: NodeId) {
        *self.entries.entry(node).or_insert(0) += 1;
    }

    /// Merge another clock into this one, keeping the pointwise maximum.
    ///
    /// The merge itself is idempotent and commutative; callers that are
    /// recording a message receipt should use [`VectorClock::observe`],
    /// which also ticks the local entry.
    pub fn merge(&mut self, other: &Self) {
        for (node, &counter) in &other.entries {
            let entry = self.entries.entry(*node).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Record receipt of a remote clock: pointwise max, then a local tick.
    pub fn observe(&mut self, local: NodeId, other: &Self) {
        self.merge(other);
        self.tick(local);
    }

    /// Current counter for a node (zero if never seen).
    pub fn get(&self, node: NodeId) -> u64 {
        self.entries.get(&node).copied().unwrap_or(0)
    }

    /// Compare two clocks to determine their causal relationship.
    pub fn compare(&self, other: &Self) -> CausalOrdering {
        let mut less = false;
        let mut greater = false;

        for node in self.entries.keys().chain(other.entries.keys()) {
            let left = self.get(*node);
            let right = other.get(*node);
            if left < right {
                less = true;
            } else if left > right {
                greater = true;
            }
        }

        match (less, greater) {
            (false, false) => CausalOrdering::Equal,
            (true, false) => CausalOrdering::Before,
            (false, true) => CausalOrdering::After,
            (true, true) => CausalOrdering::Concurrent,
        }
    }

    /// True iff every entry of `self` is <= the corresponding entry of
    /// `other` and at least one is strictly less.
    pub fn happens_before(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrdering::Before
    }

    /// True iff neither clock happens-before the other. This is the sole
    /// signal used to detect concurrent writes.
    pub fn concurrent_with(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrdering::Concurrent
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrdering {
    /// `self` happened-before `other`.
    Before,
    /// Clocks are identical.
    Equal,
    /// `self` happened-after `other`.
    After,
    /// Neither clock dominates; the events are concurrent.
    Concurrent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_ticks_are_concurrent() {
        let a_id = NodeId::new();
        let b_id = NodeId::new();

        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        a.tick(a_id);
        b.tick(b_id);

        assert_eq!(a.compare(&b), CausalOrdering::Concurrent);
        assert!(a.concurrent_with(&b));
        assert!(!a.happens_before(&b));
        assert!(!b.happens_before(&a));
    }

    #[test]
    fn observe_establishes_happens_before() {
        let a_id = NodeId::new();
        let b_id = NodeId::new();

        let mut a = VectorClock::new();
        a.tick(a_id);

        let mut b = VectorClock::new();
        b.observe(b_id, &a);

        assert!(a.happens_before(&b));
        assert_eq!(b.compare(&a), CausalOrdering::After);
    }

    #[test]
    fn happens_before_is_antisymmetric() {
        let a_id = NodeId::new();
        let b_id = NodeId::new();

        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        for _ in 0..3 {
            a.tick(a_id);
        }
        b.observe(b_id, &a);
        a.observe(a_id, &b);

        // Never both directions at once, for any derivation.
        assert!(!(a.happens_before(&b) && b.happens_before(&a)));
    }

    #[test]
    fn merge_is_idempotent_and_commutative() {
        let a_id = NodeId::new();
        let b_id = NodeId::new();

        let mut a = VectorClock::new();
        a.tick(a_id);
        a.tick(a_id);
        let mut b = VectorClock::new();
        b.tick(b_id);

        let mut self_merge = a.clone();
        self_merge.merge(&a);
        assert_eq!(self_merge, a);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn counters_never_decrease_on_merge() {
        let a_id = NodeId::new();

        let mut a = VectorClock::new();
        a.tick(a_id);
        a.tick(a_id);

        let stale = VectorClock::new();
        a.merge(&stale);
        assert_eq!(a.get(a_id), 2);
    }
}
