use crate::monitor::{Alert, ClusterMonitor};
use async_trait::async_trait;
use meshos_cluster::{
    ClusterMessage, ClusterNode, ClusterStatus, ConsensusEngine, MessageHandler, MessageType,
    Payload,
};
use meshos_common::{ClusterConfig, Result};
use meshos_dfs::{DistributedFilesystem, MemoryStorage, ReplicationStatus, StorageBackend};
use meshos_memory::{DistributedMemoryManager, HeapAllocator, LocalAllocator, MemoryStats};
use meshos_scheduler::{
    DistributedProcess, DistributedScheduler, ProcessExecutor, SystemExecutor,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// One meshos node: transport and membership plus every service wired on
/// top of it.
///
/// Construction builds the static message-routing table; `Read`/`Write`
/// frames are dispatched on their payload variant to the memory manager
/// or the filesystem.
pub struct NodeRuntime {
    node: Arc<ClusterNode>,
    consensus: Arc<ConsensusEngine>,
    memory: Arc<DistributedMemoryManager>,
    fs: Arc<DistributedFilesystem>,
    scheduler: Arc<DistributedScheduler>,
    monitor: Arc<ClusterMonitor>,
}

impl NodeRuntime {
    /// Runtime with the default collaborators: heap-backed allocator,
    /// in-memory storage, host-process executor.
    pub fn new(config: ClusterConfig) -> Result<Arc<Self>> {
        let allocator = Arc::new(HeapAllocator::new(config.local_memory_bytes));
        Self::with_collaborators(
            config,
            allocator,
            Arc::new(MemoryStorage::new()),
            Arc::new(SystemExecutor::new()),
        )
    }

    /// Runtime over host-provided collaborator implementations.
    pub fn with_collaborators(
        config: ClusterConfig,
        allocator: Arc<dyn LocalAllocator>,
        storage: Arc<dyn StorageBackend>,
        executor: Arc<dyn ProcessExecutor>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let node = Arc::new(ClusterNode::new(config));
        let consensus = ConsensusEngine::new(node.clone());
        consensus.register();

        let memory = DistributedMemoryManager::new(node.clone(), allocator);
        let fs = DistributedFilesystem::new(node.clone(), consensus.clone(), storage);
        let scheduler = DistributedScheduler::new(node.clone(), executor, memory.clone());
        let monitor = ClusterMonitor::new(
            node.clone(),
            consensus.clone(),
            memory.clone(),
            fs.clone(),
            scheduler.clone(),
        );

        let router: Arc<dyn MessageHandler> = Arc::new(RouterHandler {
            memory: memory.clone(),
            fs: fs.clone(),
            scheduler: scheduler.clone(),
        });
        for kind in [
            MessageType::Read,
            MessageType::Write,
            MessageType::Exec,
            MessageType::Lock,
            MessageType::Unlock,
            MessageType::SyncRequest,
            MessageType::SyncData,
            MessageType::StateUpdate,
        ] {
            node.register_handler(kind, router.clone());
        }

        Ok(Arc::new(Self {
            node,
            consensus,
            memory,
            fs,
            scheduler,
            monitor,
        }))
    }

    /// Bind the listener and start every background loop.
    pub async fn start(&self) -> Result<()> {
        self.node.start().await?;
        self.consensus.start();
        self.memory.start();
        self.fs.start();
        self.scheduler.start();
        self.monitor.start();
        Ok(())
    }

    /// Create a new single-member cluster and lead it.
    pub fn create_cluster(&self, name: &str) -> Result<()> {
        self.node.create_cluster(name)?;
        self.consensus.assume_leadership();
        Ok(())
    }

    /// Join an existing cluster through a known member.
    pub async fn join_cluster(&self, name: &str, seed: SocketAddr) -> Result<()> {
        let (term, leader) = self.node.join_cluster(name, seed).await?;
        self.consensus.observe_leader(term, leader);
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("node {} shutting down", self.node.local_id());
        self.node.leave_cluster().await;
        self.node.shutdown();
    }

    // Operator-facing accessors, consumed by the monitor and tooling.

    pub fn get_cluster_status(&self) -> ClusterStatus {
        self.node.status()
    }

    pub fn list_processes(&self) -> Vec<DistributedProcess> {
        self.scheduler.list_processes()
    }

    pub fn get_replication_status(&self) -> HashMap<String, ReplicationStatus> {
        self.fs.get_replication_status()
    }

    pub fn get_memory_stats(&self) -> MemoryStats {
        self.memory.get_memory_stats()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.monitor.alerts()
    }

    pub fn node(&self) -> &Arc<ClusterNode> {
        &self.node
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    pub fn memory(&self) -> &Arc<DistributedMemoryManager> {
        &self.memory
    }

    pub fn filesystem(&self) -> &Arc<DistributedFilesystem> {
        &self.fs
    }

    pub fn scheduler(&self) -> &Arc<DistributedScheduler> {
        &self.scheduler
    }

    pub fn monitor(&self) -> &Arc<ClusterMonitor> {
        &self.monitor
    }
}

/// Dispatches shared message types to the subsystem whose payload
/// variant matches.
struct RouterHandler {
    memory: Arc<DistributedMemoryManager>,
    fs: Arc<DistributedFilesystem>,
    scheduler: Arc<DistributedScheduler>,
}

#[async_trait]
impl MessageHandler for RouterHandler {
    async fn handle(&self, message: &ClusterMessage) -> Option<Payload> {
        if let Some(reply) = self.memory.handle_message(message).await {
            return Some(reply);
        }
        if let Some(reply) = self.fs.handle_message(message).await {
            return Some(reply);
        }
        self.scheduler.handle_message(message).await
    }
}
