use crate::types::ConflictStrategy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Cluster configuration
///
/// Two failure timeouts exist on purpose: `node_failure_timeout_ms` drives
/// the membership failure detector, `monitor_failure_timeout_ms` drives the
/// monitor's alert rule. They are independent knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address the node listens on. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,

    /// Copies of each file kept across the cluster
    pub replication_factor: usize,

    /// Virtual positions per node on the hash ring
    pub virtual_nodes: usize,

    /// Randomized election timeout range (milliseconds)
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,

    /// Leader heartbeat period (milliseconds)
    pub heartbeat_interval_ms: u64,

    /// Membership discovery: silence before a peer is declared Failed
    pub node_failure_timeout_ms: u64,

    /// Monitor alert rule: silence before a node-down alert is raised
    pub monitor_failure_timeout_ms: u64,

    /// Discovery / health-check loop period
    pub discovery_interval_ms: u64,

    /// Upper bound on any single cross-node call
    pub rpc_timeout_ms: u64,

    /// Filesystem sync loop period
    pub sync_interval_ms: u64,

    /// Seconds between checkpoints of long-running processes
    pub checkpoint_interval_secs: u64,

    /// used/total ratio above which local pages are evicted
    pub memory_pressure_threshold: f64,

    /// Remote reads of a page before it is pulled local
    pub remote_access_migration_threshold: u32,

    /// Shared-memory page size in bytes
    pub page_size: usize,

    /// Capacity handed to the default local allocator
    pub local_memory_bytes: u64,

    /// Scheduler tick period
    pub scheduler_tick_ms: u64,

    /// Scheduler monitor loop period (checkpointing, failure recovery)
    pub scheduler_monitor_interval_ms: u64,

    /// Monitor collection period
    pub monitor_interval_ms: u64,

    /// Poll period while waiting for a distributed lock
    pub lock_poll_interval_ms: u64,

    /// Bound on concurrently served inbound connections
    pub max_connections: usize,

    /// How concurrent writes to the same path are resolved
    pub conflict_strategy: ConflictStrategy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".parse().expect("static address"),
            replication_factor: 3,
            virtual_nodes: 150,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            node_failure_timeout_ms: 5_000,
            monitor_failure_timeout_ms: 30_000,
            discovery_interval_ms: 1_000,
            rpc_timeout_ms: 2_000,
            sync_interval_ms: 1_000,
            checkpoint_interval_secs: 60,
            memory_pressure_threshold: 0.8,
            remote_access_migration_threshold: 10,
            page_size: 4_096,
            local_memory_bytes: 64 * 1024 * 1024,
            scheduler_tick_ms: 500,
            scheduler_monitor_interval_ms: 1_000,
            monitor_interval_ms: 5_000,
            lock_poll_interval_ms: 50,
            max_connections: 256,
            conflict_strategy: ConflictStrategy::LastWriteWins,
        }
    }
}

impl ClusterConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn node_failure_timeout(&self) -> Duration {
        Duration::from_millis(self.node_failure_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> crate::Result<()> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms >= self.election_timeout_max_ms
        {
            return Err(crate::MeshError::Config(format!(
                "election timeout range {}..{} is not a valid interval",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.replication_factor == 0 {
            return Err(crate::MeshError::Config(
                "replication_factor must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.memory_pressure_threshold) {
            return Err(crate::MeshError::Config(format!(
                "memory_pressure_threshold {} outside 0..=1",
                self.memory_pressure_threshold
            )));
        }
        if self.page_size == 0 {
            return Err(crate::MeshError::Config("page_size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClusterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.virtual_nodes, 150);
        assert_eq!(config.bind_addr.port(), 9000);
    }

    #[test]
    fn rejects_inverted_election_range() {
        let config = ClusterConfig {
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 150,
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
