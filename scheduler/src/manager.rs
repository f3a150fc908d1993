use crate::executor::ProcessExecutor;
use crate::policy::SchedulingPolicy;
use crate::process::{DistributedProcess, SubmitOptions};
use async_trait::async_trait;
use dashmap::DashMap;
use meshos_cluster::{ClusterMessage, ClusterNode, MembershipEvent, MessageHandler, MessageType, Payload};
use meshos_common::{
    AccessMode, ExecReply, ExecRequest, MeshError, NodeId, NodeInfo, Pid, ProcessCheckpoint,
    ProcessSpec, ProcessState, Result, now_millis,
};
use meshos_memory::DistributedMemoryManager;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Distributed process scheduler.
///
/// Processes are submitted into a pending queue and placed by the active
/// policy each tick. Execution runs through the local executor or an
/// `Exec` RPC to the chosen node. A monitor loop checkpoints long-running
/// processes and re-submits failed ones; a balancing pass migrates work
/// off overloaded nodes.
pub struct DistributedScheduler {
    node: Arc<ClusterNode>,
    executor: Arc<dyn ProcessExecutor>,
    memory: Arc<DistributedMemoryManager>,
    processes: DashMap<Pid, DistributedProcess>,
    pending: Mutex<VecDeque<Pid>>,
    checkpoints: DashMap<Pid, ProcessCheckpoint>,
    policy: RwLock<SchedulingPolicy>,
    next_pid: AtomicU64,
    checkpoint_interval_ms: u64,
}

impl DistributedScheduler {
    pub fn new(
        node: Arc<ClusterNode>,
        executor: Arc<dyn ProcessExecutor>,
        memory: Arc<DistributedMemoryManager>,
    ) -> Arc<Self> {
        // Pids carry a node-derived prefix so independently submitting
        // nodes never collide.
        let id_bytes = node.local_id().0.as_bytes()[..4]
            .try_into()
            .expect("uuid has 16 bytes");
        let pid_base = (u64::from(u32::from_be_bytes(id_bytes))) << 32;
        let checkpoint_interval_ms = node.config().checkpoint_interval_secs * 1_000;

        Arc::new(Self {
            processes: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            checkpoints: DashMap::new(),
            policy: RwLock::new(SchedulingPolicy::default()),
            next_pid: AtomicU64::new(pid_base + 1),
            checkpoint_interval_ms,
            executor,
            memory,
            node,
        })
    }

    /// Register the standalone handler. The combined node runtime wires
    /// its own routing table instead of calling this.
    pub fn register(self: &Arc<Self>) {
        let handler: Arc<dyn MessageHandler> = Arc::new(SchedulerMessageHandler(self.clone()));
        self.node.register_handler(MessageType::Exec, handler);
    }

    /// Start the scheduling loop, the monitor loop, and the membership
    /// watcher.
    pub fn start(self: &Arc<Self>) {
        let cancel = self.node.cancellation_token();

        let scheduler = self.clone();
        let tick_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                scheduler.node.config().scheduler_tick_ms,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                scheduler.schedule_next().await;
                scheduler.balance_tick().await;
            }
        });

        let scheduler = self.clone();
        let monitor_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                scheduler.node.config().scheduler_monitor_interval_ms,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = monitor_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                scheduler.monitor_tick().await;
            }
        });

        let scheduler = self.clone();
        let mut events = self.node.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(MembershipEvent::Failed(node)) | Ok(MembershipEvent::Left(node)) => {
                            scheduler.fail_processes_on(node);
                        }
                        Ok(MembershipEvent::Joined(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            }
        });
    }

    /// Queue a process for placement. Returns its cluster-wide pid.
    pub fn submit(&self, spec: ProcessSpec, options: SubmitOptions) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let mut process = DistributedProcess::new(pid, spec, self.node.local_id());
        process.affinity = options.affinity;
        process.data_path = options.data_path;
        info!("submitted process {pid} ({})", process.spec.command);
        self.processes.insert(pid, process);
        self.pending.lock().push_back(pid);
        pid
    }

    pub fn list_processes(&self) -> Vec<DistributedProcess> {
        self.processes.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get_process(&self, pid: Pid) -> Option<DistributedProcess> {
        self.processes.get(&pid).map(|e| e.value().clone())
    }

    pub fn set_policy(&self, policy: SchedulingPolicy) {
        info!("scheduling policy set to {policy}");
        *self.policy.write() = policy;
    }

    pub fn policy(&self) -> SchedulingPolicy {
        *self.policy.read()
    }

    /// Stop a process wherever it runs.
    pub async fn kill(&self, pid: Pid) -> Result<()> {
        let process = self
            .get_process(pid)
            .ok_or(MeshError::ProcessNotFound { pid })?;
        match process.node {
            Some(node) if node == self.node.local_id() => {
                let _ = self.executor.kill(pid).await;
            }
            Some(node) => {
                self.node
                    .send_message(node, Payload::Exec(ExecRequest::Kill { pid }))
                    .await;
            }
            None => {}
        }
        if let Some(mut entry) = self.processes.get_mut(&pid) {
            entry.state = ProcessState::Completed;
        }
        Ok(())
    }

    /// Checkpoint a running process, locally or via RPC to the node
    /// executing it.
    pub async fn checkpoint_process(&self, pid: Pid) -> Result<ProcessCheckpoint> {
        let process = self
            .get_process(pid)
            .ok_or(MeshError::ProcessNotFound { pid })?;
        let target = process.node.ok_or(MeshError::ExecutionFailed {
            reason: format!("process {pid} is not placed"),
        })?;

        let checkpoint = if target == self.node.local_id() {
            self.checkpoint_local(&process).await
        } else {
            match self
                .node
                .send_message(target, Payload::Exec(ExecRequest::Checkpoint { pid }))
                .await
            {
                Some(Payload::ExecReply(reply)) => reply
                    .checkpoint
                    .ok_or(MeshError::CheckpointMissing { pid })?,
                _ => return Err(MeshError::PeerUnreachable { node: target }),
            }
        };

        self.checkpoints.insert(pid, checkpoint.clone());
        if let Some(mut entry) = self.processes.get_mut(&pid) {
            entry.last_checkpoint_at = now_millis();
        }
        debug!("checkpointed process {pid}");
        Ok(checkpoint)
    }

    /// Move a running process: checkpoint, stop on the source, restore on
    /// the target. A failed restore puts the process back on its source.
    pub async fn migrate_process(self: &Arc<Self>, pid: Pid, target: NodeId) -> Result<()> {
        let process = self
            .get_process(pid)
            .ok_or(MeshError::ProcessNotFound { pid })?;
        let source = process.node.ok_or(MeshError::ExecutionFailed {
            reason: format!("process {pid} is not placed"),
        })?;
        if source == target {
            return Ok(());
        }

        if let Some(mut entry) = self.processes.get_mut(&pid) {
            entry.state = ProcessState::Migrating;
        }

        let checkpoint = match self.checkpoint_process(pid).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                if let Some(mut entry) = self.processes.get_mut(&pid) {
                    entry.state = ProcessState::Running;
                }
                return Err(e);
            }
        };

        self.stop_on(source, pid).await;

        let restored = if target == self.node.local_id() {
            self.restore_local(&checkpoint);
            true
        } else {
            matches!(
                self.node
                    .send_message(
                        target,
                        Payload::Exec(ExecRequest::Restore {
                            checkpoint: checkpoint.clone(),
                        }),
                    )
                    .await,
                Some(Payload::ExecReply(reply)) if reply.accepted
            )
        };

        if restored {
            if let Some(mut entry) = self.processes.get_mut(&pid) {
                entry.state = ProcessState::Running;
                entry.node = Some(target);
            }
            info!("process {pid} migrated from {source} to {target}");
            return Ok(());
        }

        warn!("restore of {pid} on {target} failed, restoring on {source}");
        let recovered = if source == self.node.local_id() {
            self.restore_local(&checkpoint);
            true
        } else {
            matches!(
                self.node
                    .send_message(
                        source,
                        Payload::Exec(ExecRequest::Restore { checkpoint }),
                    )
                    .await,
                Some(Payload::ExecReply(reply)) if reply.accepted
            )
        };
        if let Some(mut entry) = self.processes.get_mut(&pid) {
            if recovered {
                entry.state = ProcessState::Running;
                entry.node = Some(source);
            } else {
                entry.state = ProcessState::Failed;
                entry.node = None;
            }
        }
        Err(MeshError::ExecutionFailed {
            reason: format!("migration of {pid} to {target} failed"),
        })
    }

    /// Serve inbound process-control traffic.
    pub async fn handle_message(self: &Arc<Self>, message: &ClusterMessage) -> Option<Payload> {
        let Payload::Exec(request) = &message.payload else {
            return None;
        };

        let reply = match request {
            ExecRequest::Spawn { pid, spec } => {
                let mut process = DistributedProcess::new(*pid, spec.clone(), message.source);
                process.state = ProcessState::Running;
                process.node = Some(self.node.local_id());
                process.started_at = Some(now_millis());
                self.processes.insert(*pid, process);
                self.spawn_local(*pid, spec.clone());
                ExecReply::accepted(*pid)
            }
            ExecRequest::Restore { checkpoint } => {
                self.restore_local(checkpoint);
                ExecReply::accepted(checkpoint.pid)
            }
            ExecRequest::Kill { pid } => match self.executor.kill(*pid).await {
                Ok(()) => {
                    if let Some(mut entry) = self.processes.get_mut(pid) {
                        entry.state = ProcessState::Completed;
                    }
                    ExecReply::accepted(*pid)
                }
                Err(e) => ExecReply::rejected(e.to_string()),
            },
            ExecRequest::Checkpoint { pid } => match self.get_process(*pid) {
                Some(process)
                    if process.node == Some(self.node.local_id()) && process.is_running() =>
                {
                    let checkpoint = self.checkpoint_local(&process).await;
                    ExecReply {
                        accepted: true,
                        pid: Some(*pid),
                        checkpoint: Some(checkpoint),
                        detail: None,
                    }
                }
                _ => ExecReply::rejected(format!("process {pid} not running here")),
            },
        };
        Some(Payload::ExecReply(reply))
    }

    async fn schedule_next(self: &Arc<Self>) {
        let pid = self.pending.lock().pop_front();
        let Some(pid) = pid else { return };
        let Some(process) = self.get_process(pid) else {
            return;
        };

        let nodes = self.node.active_nodes();
        let Some(target) = self.select_target(&process, &nodes) else {
            debug!("no eligible node for process {pid}, requeueing");
            self.pending.lock().push_back(pid);
            return;
        };

        if let Some(mut entry) = self.processes.get_mut(&pid) {
            entry.state = ProcessState::Scheduled;
            entry.node = Some(target);
        }

        let checkpoint = self.checkpoints.get(&pid).map(|e| e.value().clone());
        if target == self.node.local_id() {
            match checkpoint {
                Some(checkpoint) => self.restore_local(&checkpoint),
                None => self.spawn_local(pid, process.spec.clone()),
            }
            return;
        }

        let request = match checkpoint {
            Some(checkpoint) => ExecRequest::Restore { checkpoint },
            None => ExecRequest::Spawn {
                pid,
                spec: process.spec.clone(),
            },
        };
        match self
            .node
            .send_message(target, Payload::Exec(request))
            .await
        {
            Some(Payload::ExecReply(reply)) if reply.accepted => {
                if let Some(mut entry) = self.processes.get_mut(&pid) {
                    entry.state = ProcessState::Running;
                    entry.node = Some(target);
                    entry.started_at = Some(now_millis());
                }
            }
            _ => {
                // Refused or unknown outcome: try again next tick.
                if let Some(mut entry) = self.processes.get_mut(&pid) {
                    entry.state = ProcessState::Pending;
                    entry.node = None;
                }
                self.pending.lock().push_back(pid);
            }
        }
    }

    fn select_target(&self, process: &DistributedProcess, nodes: &[NodeInfo]) -> Option<NodeId> {
        if nodes.is_empty() {
            return None;
        }
        let mut nodes = nodes.to_vec();
        nodes.sort_by_key(|n| n.id);

        match *self.policy.read() {
            SchedulingPolicy::RoundRobin => {
                Some(nodes[(process.pid as usize) % nodes.len()].id)
            }
            SchedulingPolicy::LeastLoaded => nodes
                .iter()
                .min_by(|a, b| {
                    a.usage
                        .cpu_load
                        .partial_cmp(&b.usage.cpu_load)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|n| n.id),
            SchedulingPolicy::DataLocality => process
                .data_path
                .as_deref()
                .and_then(|path| self.node.node_for(path))
                .filter(|owner| nodes.iter().any(|n| n.id == *owner))
                .or(Some(nodes[0].id)),
            SchedulingPolicy::Affinity => match process.affinity {
                Some(pinned) => nodes.iter().find(|n| n.id == pinned).map(|n| n.id),
                None => Some(nodes[0].id),
            },
            SchedulingPolicy::Random => {
                let index = rand::thread_rng().gen_range(0..nodes.len());
                Some(nodes[index].id)
            }
        }
    }

    fn spawn_local(self: &Arc<Self>, pid: Pid, spec: ProcessSpec) {
        let local = self.node.local_id();
        {
            let mut entry = self
                .processes
                .entry(pid)
                .or_insert_with(|| DistributedProcess::new(pid, spec.clone(), local));
            entry.state = ProcessState::Running;
            entry.node = Some(local);
            entry.started_at = Some(now_millis());
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            let outcome = scheduler.executor.execute(pid, &spec).await;
            let next_state = match outcome {
                Ok(outcome) => match outcome.exit_code {
                    // Background process: still running, completion is
                    // observed through kill or failure.
                    None => return,
                    Some(0) => ProcessState::Completed,
                    Some(code) => {
                        warn!("process {pid} exited with status {code}");
                        ProcessState::Failed
                    }
                },
                Err(e) => {
                    warn!("process {pid} failed to start: {e}");
                    ProcessState::Failed
                }
            };
            if let Some(mut entry) = scheduler.processes.get_mut(&pid) {
                // Migration may have moved it elsewhere in the meantime.
                if entry.node == Some(scheduler.node.local_id())
                    && entry.state == ProcessState::Running
                {
                    entry.state = next_state;
                }
            }
        });
    }

    fn restore_local(self: &Arc<Self>, checkpoint: &ProcessCheckpoint) {
        let pid = checkpoint.pid;

        if !checkpoint.memory.is_empty() {
            let scheduler = self.clone();
            let blob = checkpoint.memory.clone();
            tokio::spawn(async move {
                let page_size = scheduler.node.config().page_size;
                match scheduler
                    .memory
                    .allocate(pid, blob.len(), AccessMode::ReadWrite, false)
                    .await
                {
                    Ok(segment) => {
                        for (index, page_id) in segment.pages.iter().enumerate() {
                            let start = index * page_size;
                            let end = (start + page_size).min(blob.len());
                            if start >= end {
                                break;
                            }
                            if let Err(e) =
                                scheduler.memory.write_page(*page_id, &blob[start..end]).await
                            {
                                warn!("memory restore for {pid} failed: {e}");
                                break;
                            }
                        }
                    }
                    Err(e) => warn!("memory restore for {pid} failed: {e}"),
                }
            });
        }

        self.spawn_local(pid, checkpoint.spec.clone());
    }

    async fn checkpoint_local(&self, process: &DistributedProcess) -> ProcessCheckpoint {
        ProcessCheckpoint {
            pid: process.pid,
            spec: process.spec.clone(),
            memory: self.memory.snapshot_process(process.pid).await,
            // The executor collaborator exposes no fd or signal table.
            open_files: Vec::new(),
            pending_signals: Vec::new(),
            created_at: now_millis(),
        }
    }

    async fn monitor_tick(self: &Arc<Self>) {
        let now = now_millis();
        let snapshot: Vec<DistributedProcess> = self.list_processes();

        for process in snapshot {
            match process.state {
                ProcessState::Running => {
                    let since = process
                        .last_checkpoint_at
                        .max(process.started_at.unwrap_or(process.submitted_at));
                    if now.saturating_sub(since) >= self.checkpoint_interval_ms {
                        if let Err(e) = self.checkpoint_process(process.pid).await {
                            debug!("checkpoint of {} skipped: {e}", process.pid);
                        }
                    }
                }
                ProcessState::Failed => self.resubmit(process.pid),
                _ => {}
            }
        }
    }

    /// Re-queue a failed process; from its checkpoint when one exists,
    /// fresh otherwise. Retries are unbounded.
    fn resubmit(&self, pid: Pid) {
        let from_checkpoint = self.checkpoints.contains_key(&pid);
        if let Some(mut entry) = self.processes.get_mut(&pid) {
            entry.state = ProcessState::Pending;
            entry.node = None;
            entry.restarts += 1;
            info!(
                "re-submitting failed process {pid} (attempt {}, {})",
                entry.restarts,
                if from_checkpoint {
                    "from checkpoint"
                } else {
                    "fresh"
                }
            );
        }
        let mut pending = self.pending.lock();
        if !pending.contains(&pid) {
            pending.push_back(pid);
        }
    }

    /// Migrate one process per overloaded/underloaded pair when the load
    /// spread exceeds half the average.
    async fn balance_tick(self: &Arc<Self>) {
        let nodes = self.node.active_nodes();
        if nodes.len() < 2 {
            return;
        }

        let loads: Vec<(NodeId, f64)> = nodes.iter().map(|n| (n.id, n.usage.cpu_load)).collect();
        let avg = loads.iter().map(|(_, l)| l).sum::<f64>() / loads.len() as f64;
        let (max_node, max_load) = loads
            .iter()
            .cloned()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .expect("non-empty loads");
        let (min_node, min_load) = loads
            .iter()
            .cloned()
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .expect("non-empty loads");

        if max_load - min_load <= 0.5 * avg {
            return;
        }

        let candidate = self
            .processes
            .iter()
            .find(|entry| {
                let process = entry.value();
                process.is_running() && process.node == Some(max_node) && process.affinity.is_none()
            })
            .map(|entry| entry.value().pid);

        if let Some(pid) = candidate {
            info!("load imbalance ({max_load:.2} vs {min_load:.2}), moving {pid} to {min_node}");
            if let Err(e) = self.migrate_process(pid, min_node).await {
                warn!("rebalancing migration failed: {e}");
            }
        }
    }

    async fn stop_on(&self, source: NodeId, pid: Pid) {
        if source == self.node.local_id() {
            let _ = self.executor.kill(pid).await;
        } else {
            self.node
                .send_message(source, Payload::Exec(ExecRequest::Kill { pid }))
                .await;
        }
    }

    fn fail_processes_on(&self, node: NodeId) {
        let victims: Vec<Pid> = self
            .processes
            .iter()
            .filter(|entry| {
                let process = entry.value();
                process.node == Some(node)
                    && matches!(
                        process.state,
                        ProcessState::Running | ProcessState::Scheduled | ProcessState::Migrating
                    )
            })
            .map(|entry| entry.value().pid)
            .collect();

        for pid in victims {
            warn!("process {pid} lost with node {node}");
            if let Some(mut entry) = self.processes.get_mut(&pid) {
                entry.state = ProcessState::Failed;
            }
        }
    }
}

struct SchedulerMessageHandler(Arc<DistributedScheduler>);

#[async_trait]
impl MessageHandler for SchedulerMessageHandler {
    async fn handle(&self, message: &ClusterMessage) -> Option<Payload> {
        self.0.handle_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecOutcome;
    use meshos_common::ClusterConfig;
    use meshos_memory::HeapAllocator;

    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProcessExecutor for RecordingExecutor {
        async fn execute(&self, _pid: Pid, spec: &ProcessSpec) -> Result<ExecOutcome> {
            self.calls.lock().push(spec.command.clone());
            Ok(ExecOutcome {
                exit_code: if spec.background { None } else { Some(0) },
                output: "ok".into(),
            })
        }

        async fn kill(&self, _pid: Pid) -> Result<()> {
            Ok(())
        }
    }

    fn scheduler_with_executor(
        executor: Arc<dyn ProcessExecutor>,
    ) -> Arc<DistributedScheduler> {
        let node = Arc::new(ClusterNode::new(ClusterConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..ClusterConfig::default()
        }));
        node.create_cluster("sched-tests").unwrap();
        let memory =
            DistributedMemoryManager::new(node.clone(), Arc::new(HeapAllocator::new(1024 * 1024)));
        DistributedScheduler::new(node, executor, memory)
    }

    #[tokio::test]
    async fn submitted_process_runs_locally_and_completes() {
        let executor = RecordingExecutor::new();
        let scheduler = scheduler_with_executor(executor.clone());

        let pid = scheduler.submit(ProcessSpec::new("uptime", vec![]), SubmitOptions::default());
        assert_eq!(
            scheduler.get_process(pid).unwrap().state,
            ProcessState::Pending
        );

        scheduler.schedule_next().await;

        let mut completed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if scheduler.get_process(pid).unwrap().state == ProcessState::Completed {
                completed = true;
                break;
            }
        }
        assert!(completed);
        assert_eq!(executor.calls.lock().as_slice(), &["uptime".to_string()]);
    }

    #[tokio::test]
    async fn failed_processes_are_resubmitted() {
        let executor = RecordingExecutor::new();
        let scheduler = scheduler_with_executor(executor);

        let pid = scheduler.submit(ProcessSpec::new("crashy", vec![]), SubmitOptions::default());
        scheduler.pending.lock().clear();
        if let Some(mut entry) = scheduler.processes.get_mut(&pid) {
            entry.state = ProcessState::Failed;
        }

        scheduler.monitor_tick().await;

        let process = scheduler.get_process(pid).unwrap();
        assert_eq!(process.state, ProcessState::Pending);
        assert_eq!(process.restarts, 1);
        assert!(scheduler.pending.lock().contains(&pid));
    }

    #[tokio::test]
    async fn checkpoints_capture_spec_and_land_in_the_store() {
        let executor = RecordingExecutor::new();
        let scheduler = scheduler_with_executor(executor);

        let mut spec = ProcessSpec::new("daemon", vec!["--fork".into()]);
        spec.background = true;
        let pid = scheduler.submit(spec, SubmitOptions::default());
        scheduler.schedule_next().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let checkpoint = scheduler
            .checkpoint_process(pid)
            .await
            .expect("checkpoint failed");
        assert_eq!(checkpoint.spec.command, "daemon");
        assert!(scheduler.checkpoints.contains_key(&pid));
        assert!(scheduler.get_process(pid).unwrap().last_checkpoint_at > 0);
    }

    #[tokio::test]
    async fn affinity_policy_waits_for_the_pinned_node() {
        let executor = RecordingExecutor::new();
        let scheduler = scheduler_with_executor(executor);
        scheduler.set_policy(SchedulingPolicy::Affinity);

        let pid = scheduler.submit(
            ProcessSpec::new("pinned", vec![]),
            SubmitOptions {
                affinity: Some(NodeId::new()), // not a member
                data_path: None,
            },
        );

        scheduler.schedule_next().await;
        let process = scheduler.get_process(pid).unwrap();
        assert_eq!(process.state, ProcessState::Pending);
        assert!(scheduler.pending.lock().contains(&pid));
    }

    #[tokio::test]
    async fn round_robin_indexes_by_pid() {
        let executor = RecordingExecutor::new();
        let scheduler = scheduler_with_executor(executor);
        scheduler.set_policy(SchedulingPolicy::RoundRobin);

        let local = scheduler.node.local_info();
        let process =
            DistributedProcess::new(42, ProcessSpec::new("x", vec![]), scheduler.node.local_id());
        assert_eq!(
            scheduler.select_target(&process, &[local.clone()]),
            Some(local.id)
        );
    }
}
