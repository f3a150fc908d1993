use meshos_common::NodeId;
use std::collections::HashSet;
use xxhash_rust::xxh3::xxh3_64;

/// Consistent hashing ring mapping keys to owning nodes.
///
/// Each member is hashed into `virtual_nodes` positions; lookups walk
/// clockwise from the key's hash to the nearest position. Adding or
/// removing a member rebuilds the ring, remapping only the keys whose
/// nearest successor changed.
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    positions: Vec<(u64, NodeId)>, // (hash, node), sorted by hash
    members: Vec<NodeId>,
    virtual_nodes: usize,
}

impl ConsistentHashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            positions: Vec::new(),
            members: Vec::new(),
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    /// Add a node, rebuilding the ring. Re-adding is a no-op.
    pub fn add_node(&mut self, node: NodeId) {
        if self.members.contains(&node) {
            return;
        }
        self.members.push(node);
        self.rebuild();
    }

    /// Remove a node, rebuilding the ring.
    pub fn remove_node(&mut self, node: &NodeId) {
        let before = self.members.len();
        self.members.retain(|m| m != node);
        if self.members.len() != before {
            self.rebuild();
        }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Node owning a key, walking clockwise from the key's hash.
    pub fn get_node(&self, key: &str) -> Option<NodeId> {
        if self.positions.is_empty() {
            return None;
        }
        let idx = self.successor_index(xxh3_64(key.as_bytes()));
        Some(self.positions[idx].1)
    }

    /// First `count` distinct nodes clockwise from the key, for replica
    /// placement.
    pub fn get_nodes(&self, key: &str, count: usize) -> Vec<NodeId> {
        if self.positions.is_empty() || count == 0 {
            return Vec::new();
        }

        let start = self.successor_index(xxh3_64(key.as_bytes()));
        let mut nodes = Vec::new();
        let mut seen = HashSet::new();
        let mut idx = start;

        while nodes.len() < count && seen.len() < self.members.len() {
            let node = self.positions[idx].1;
            if seen.insert(node) {
                nodes.push(node);
            }
            idx = (idx + 1) % self.positions.len();
        }

        nodes
    }

    fn successor_index(&self, hash: u64) -> usize {
        match self.positions.binary_search_by_key(&hash, |&(h, _)| h) {
            Ok(i) => i,
            Err(i) => i % self.positions.len(),
        }
    }

    fn rebuild(&mut self) {
        self.positions.clear();
        for node in &self.members {
            for i in 0..self.virtual_nodes {
                let vnode_key = format!("{node}:{i}");
                self.positions.push((xxh3_64(vnode_key.as_bytes()), *node));
            }
        }
        self.positions.sort_by_key(|&(h, _)| h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(count: usize) -> (ConsistentHashRing, Vec<NodeId>) {
        let mut ring = ConsistentHashRing::new(150);
        let nodes: Vec<NodeId> = (0..count).map(|_| NodeId::new()).collect();
        for node in &nodes {
            ring.add_node(*node);
        }
        (ring, nodes)
    }

    #[test]
    fn lookups_are_deterministic() {
        let (ring, _) = ring_with(5);
        for key in ["alpha", "beta", "/var/log/syslog"] {
            assert_eq!(ring.get_node(key), ring.get_node(key));
        }
    }

    #[test]
    fn replica_sets_are_distinct() {
        let (ring, _) = ring_with(5);
        let replicas = ring.get_nodes("some-key", 3);
        assert_eq!(replicas.len(), 3);
        let unique: HashSet<_> = replicas.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn replica_count_capped_by_membership() {
        let (ring, _) = ring_with(2);
        assert_eq!(ring.get_nodes("key", 5).len(), 2);
    }

    #[test]
    fn adding_a_node_remaps_a_bounded_share_of_keys() {
        let (mut ring, _) = ring_with(10);

        let keys: Vec<String> = (0..2000).map(|i| format!("key-{i}")).collect();
        let before: Vec<_> = keys.iter().map(|k| ring.get_node(k)).collect();

        ring.add_node(NodeId::new());

        let moved = keys
            .iter()
            .zip(&before)
            .filter(|(k, prev)| ring.get_node(k) != **prev)
            .count();

        // Expect roughly 1/11 of keys to move; allow generous slack.
        assert!(
            moved < keys.len() / 4,
            "{moved} of {} keys remapped",
            keys.len()
        );
        assert!(moved > 0);
    }

    #[test]
    fn removing_a_node_keeps_other_placements() {
        let (mut ring, nodes) = ring_with(5);
        let victim = nodes[0];

        let keys: Vec<String> = (0..500).map(|i| format!("key-{i}")).collect();
        let before: Vec<_> = keys.iter().map(|k| ring.get_node(k).unwrap()).collect();

        ring.remove_node(&victim);

        for (key, prev) in keys.iter().zip(&before) {
            if *prev != victim {
                assert_eq!(ring.get_node(key), Some(*prev));
            } else {
                assert_ne!(ring.get_node(key), Some(victim));
            }
        }
    }

    #[test]
    fn empty_ring_returns_nothing() {
        let ring = ConsistentHashRing::new(150);
        assert_eq!(ring.get_node("key"), None);
        assert!(ring.get_nodes("key", 3).is_empty());
    }
}
