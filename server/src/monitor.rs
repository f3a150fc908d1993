use meshos_cluster::{ClusterNode, ConsensusEngine};
use meshos_common::{NodeId, ProcessState, now_millis};
use meshos_dfs::DistributedFilesystem;
use meshos_memory::{DistributedMemoryManager, MemoryStats};
use meshos_scheduler::DistributedScheduler;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Retained alerts; older ones fall off the back.
const ALERT_BUFFER: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: u64,
}

/// Snapshot assembled from the subsystems' accessors
#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub nodes_total: usize,
    pub nodes_active: usize,
    pub leader: Option<NodeId>,
    pub term: u64,
    pub memory: MemoryStats,
    pub processes_running: usize,
    pub processes_failed: usize,
    pub files_tracked: usize,
    pub alerts: usize,
}

/// Periodic metrics collection and alerting.
///
/// A consumer of the other components' accessor methods; it adds no
/// coordination of its own. Its node-down rule uses
/// `monitor_failure_timeout_ms`, which is deliberately independent of the
/// membership failure detector's timeout.
pub struct ClusterMonitor {
    node: Arc<ClusterNode>,
    consensus: Arc<ConsensusEngine>,
    memory: Arc<DistributedMemoryManager>,
    fs: Arc<DistributedFilesystem>,
    scheduler: Arc<DistributedScheduler>,
    alerts: Mutex<VecDeque<Alert>>,
}

impl ClusterMonitor {
    pub fn new(
        node: Arc<ClusterNode>,
        consensus: Arc<ConsensusEngine>,
        memory: Arc<DistributedMemoryManager>,
        fs: Arc<DistributedFilesystem>,
        scheduler: Arc<DistributedScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            alerts: Mutex::new(VecDeque::new()),
            node,
            consensus,
            memory,
            fs,
            scheduler,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let cancel = self.node.cancellation_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                monitor.node.config().monitor_interval_ms,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                monitor.collect();
            }
        });
    }

    /// One collection pass: gather snapshots, evaluate alert rules.
    pub fn collect(&self) {
        let config = self.node.config();
        let now = now_millis();
        let local_id = self.node.local_id();

        for info in self.node.all_nodes() {
            if info.id == local_id || !info.is_active() {
                continue;
            }
            let silent_for = now.saturating_sub(info.last_seen);
            if silent_for > config.monitor_failure_timeout_ms {
                self.raise(
                    AlertSeverity::Critical,
                    format!("node {} silent for {}ms", info.id, silent_for),
                );
            }
        }

        if self.consensus.leader_id().is_none() {
            self.raise(AlertSeverity::Warning, "cluster has no leader".to_string());
        }

        let memory = self.memory.get_memory_stats();
        if memory.pressure > config.memory_pressure_threshold {
            self.raise(
                AlertSeverity::Warning,
                format!("memory pressure at {:.2}", memory.pressure),
            );
        }

        let failed = self
            .scheduler
            .list_processes()
            .iter()
            .filter(|p| p.state == ProcessState::Failed)
            .count();
        if failed > 0 {
            self.raise(
                AlertSeverity::Warning,
                format!("{failed} failed processes awaiting re-submission"),
            );
        }

        // Locks are never reclaimed from dead holders; surface them so an
        // operator can intervene.
        let active: Vec<NodeId> = self.node.active_nodes().iter().map(|n| n.id).collect();
        for (path, holder) in self.fs.lock_holders() {
            if !active.contains(&holder) {
                self.raise(
                    AlertSeverity::Warning,
                    format!("lock on {path} held by departed node {holder}"),
                );
            }
        }
    }

    pub fn health(&self) -> ClusterHealth {
        let processes = self.scheduler.list_processes();
        let (term, leader) = {
            let status = self.node.status();
            (status.term, status.leader)
        };
        ClusterHealth {
            nodes_total: self.node.all_nodes().len(),
            nodes_active: self.node.active_nodes().len(),
            leader,
            term,
            memory: self.memory.get_memory_stats(),
            processes_running: processes
                .iter()
                .filter(|p| p.state == ProcessState::Running)
                .count(),
            processes_failed: processes
                .iter()
                .filter(|p| p.state == ProcessState::Failed)
                .count(),
            files_tracked: self.fs.get_replication_status().len(),
            alerts: self.alerts.lock().len(),
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    fn raise(&self, severity: AlertSeverity, message: String) {
        match severity {
            AlertSeverity::Critical => error!("alert: {message}"),
            _ => warn!("alert: {message}"),
        }
        let mut alerts = self.alerts.lock();
        alerts.push_back(Alert {
            severity,
            message,
            timestamp: now_millis(),
        });
        while alerts.len() > ALERT_BUFFER {
            alerts.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshos_cluster::ConsensusEngine;
    use meshos_common::ClusterConfig;
    use meshos_dfs::MemoryStorage;
    use meshos_memory::HeapAllocator;
    use meshos_scheduler::SystemExecutor;

    fn monitor() -> Arc<ClusterMonitor> {
        let node = Arc::new(ClusterNode::new(ClusterConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..ClusterConfig::default()
        }));
        node.create_cluster("monitor-tests").unwrap();
        let consensus = ConsensusEngine::new(node.clone());
        let memory =
            DistributedMemoryManager::new(node.clone(), Arc::new(HeapAllocator::new(1024)));
        let fs = DistributedFilesystem::new(
            node.clone(),
            consensus.clone(),
            Arc::new(MemoryStorage::new()),
        );
        let scheduler = DistributedScheduler::new(
            node.clone(),
            Arc::new(SystemExecutor::new()),
            memory.clone(),
        );
        ClusterMonitor::new(node, consensus, memory, fs, scheduler)
    }

    #[test]
    fn missing_leader_raises_a_warning() {
        let monitor = monitor();
        monitor.collect();

        let alerts = monitor.alerts();
        assert!(alerts
            .iter()
            .any(|a| a.severity == AlertSeverity::Warning && a.message.contains("no leader")));
    }

    #[test]
    fn leader_quietens_the_leader_rule() {
        let monitor = monitor();
        monitor.consensus.assume_leadership();
        monitor.collect();

        assert!(!monitor
            .alerts()
            .iter()
            .any(|a| a.message.contains("no leader")));
    }

    #[test]
    fn health_reports_single_node_cluster() {
        let monitor = monitor();
        monitor.consensus.assume_leadership();

        let health = monitor.health();
        assert_eq!(health.nodes_total, 1);
        assert_eq!(health.nodes_active, 1);
        assert_eq!(health.leader, Some(monitor.node.local_id()));
        assert_eq!(health.processes_running, 0);
    }
}
