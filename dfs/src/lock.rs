use dashmap::DashMap;
use meshos_common::NodeId;

/// Cluster-wide lock table, authoritative on the current leader.
///
/// Locks are granted first-come and held until released. A lock whose
/// holder crashes is never proactively reclaimed; the monitor surfaces
/// such locks so an operator can intervene.
#[derive(Default)]
pub struct LockTable {
    held: DashMap<String, NodeId>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take a lock. Granted when the path is free or already held
    /// by the same node (re-entrant per node).
    pub fn try_acquire(&self, path: &str, node: NodeId) -> bool {
        let entry = self.held.entry(path.to_string()).or_insert(node);
        *entry == node
    }

    /// Release a lock; only the holder may release it.
    pub fn release(&self, path: &str, node: NodeId) -> bool {
        match self.held.get(path) {
            Some(holder) if *holder == node => {
                drop(holder);
                self.held.remove(path);
                true
            }
            _ => false,
        }
    }

    pub fn holder(&self, path: &str) -> Option<NodeId> {
        self.held.get(path).map(|entry| *entry.value())
    }

    /// Snapshot of every held lock, for the monitor.
    pub fn holders(&self) -> Vec<(String, NodeId)> {
        self.held
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let table = LockTable::new();
        let a = NodeId::new();
        let b = NodeId::new();

        assert!(table.try_acquire("/etc/passwd", a));
        assert!(!table.try_acquire("/etc/passwd", b));
        assert_eq!(table.holder("/etc/passwd"), Some(a));

        // Only the holder can release.
        assert!(!table.release("/etc/passwd", b));
        assert!(table.release("/etc/passwd", a));
        assert!(table.try_acquire("/etc/passwd", b));
    }

    #[test]
    fn reacquire_by_holder_is_granted() {
        let table = LockTable::new();
        let a = NodeId::new();
        assert!(table.try_acquire("/x", a));
        assert!(table.try_acquire("/x", a));
        assert_eq!(table.len(), 1);
    }
}
