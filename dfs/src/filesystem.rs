use crate::lock::LockTable;
use crate::storage::StorageBackend;
use async_trait::async_trait;
use dashmap::DashMap;
use meshos_cluster::{
    ClusterMessage, ClusterNode, ConsensusEngine, MembershipEvent, MessageHandler, MessageType,
    Payload,
};
use meshos_common::{
    ConflictStrategy, FileMetadata, FileOpKind, FileOperation, MeshError, NodeId, Result,
    now_millis,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Marker inserted between both sides of a merged concurrent write.
const CONFLICT_MARKER: &[u8] = b"\n<<<<<<< concurrent update >>>>>>>\n";

/// Ops returned per sync exchange; the next round picks up the rest.
const SYNC_BATCH_LIMIT: usize = 256;

/// Per-path replication view
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStatus {
    pub path: String,
    pub replicas: Vec<NodeId>,
    pub version: u64,
    pub healthy: bool,
}

/// Replicated virtual filesystem.
///
/// Every mutation applies locally first, is appended to the operation
/// log stamped with the node's vector clock, and is replicated
/// asynchronously to the ring-chosen owners of the path. A background
/// sync loop exchanges missed operations with each peer; concurrent
/// writes are detected by vector-clock concurrency and resolved by the
/// configured strategy. Replicas can transiently diverge and converge
/// later (eventual consistency).
pub struct DistributedFilesystem {
    node: Arc<ClusterNode>,
    consensus: Arc<ConsensusEngine>,
    storage: Arc<dyn StorageBackend>,
    oplog: Mutex<Vec<FileOperation>>,
    seen_ops: Mutex<HashSet<Uuid>>,
    metadata: DashMap<String, FileMetadata>,
    pending_conflicts: Mutex<Vec<(FileOperation, FileOperation)>>,
    locks: LockTable,
    last_sync: DashMap<NodeId, u64>,
    replication_factor: usize,
    strategy: ConflictStrategy,
}

impl DistributedFilesystem {
    pub fn new(
        node: Arc<ClusterNode>,
        consensus: Arc<ConsensusEngine>,
        storage: Arc<dyn StorageBackend>,
    ) -> Arc<Self> {
        let config = node.config();
        Arc::new(Self {
            replication_factor: config.replication_factor,
            strategy: config.conflict_strategy,
            oplog: Mutex::new(Vec::new()),
            seen_ops: Mutex::new(HashSet::new()),
            metadata: DashMap::new(),
            pending_conflicts: Mutex::new(Vec::new()),
            locks: LockTable::new(),
            last_sync: DashMap::new(),
            storage,
            consensus,
            node,
        })
    }

    /// Register the standalone handler. The combined node runtime wires
    /// its own routing table instead of calling this.
    pub fn register(self: &Arc<Self>) {
        let handler: Arc<dyn MessageHandler> = Arc::new(FsMessageHandler(self.clone()));
        for kind in [
            MessageType::Read,
            MessageType::Write,
            MessageType::Lock,
            MessageType::Unlock,
            MessageType::SyncRequest,
            MessageType::SyncData,
        ] {
            self.node.register_handler(kind, handler.clone());
        }
    }

    /// Start the background sync loop and the membership watcher.
    pub fn start(self: &Arc<Self>) {
        let fs = self.clone();
        tokio::spawn(async move {
            fs.sync_loop().await;
        });

        let fs = self.clone();
        let cancel = self.node.cancellation_token();
        let mut events = self.node.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(MembershipEvent::Failed(node)) | Ok(MembershipEvent::Left(node)) => {
                            fs.forget_peer(node);
                        }
                        Ok(MembershipEvent::Joined(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            }
        });
    }

    // Mutations: local apply, then log, then async replication.

    pub fn create(self: &Arc<Self>, path: &str, data: &[u8]) -> Result<()> {
        if self.storage.exists(path) {
            return Err(MeshError::FileExists { path: path.into() });
        }
        self.storage.write(path, data)?;
        self.record_and_replicate(FileOpKind::Create, path, Some(data.to_vec()));
        Ok(())
    }

    pub fn write_file(self: &Arc<Self>, path: &str, data: &[u8]) -> Result<()> {
        self.storage.write(path, data)?;
        self.record_and_replicate(FileOpKind::Write, path, Some(data.to_vec()));
        Ok(())
    }

    pub fn delete(self: &Arc<Self>, path: &str) -> Result<()> {
        self.storage.remove(path)?;
        self.record_and_replicate(FileOpKind::Delete, path, None);
        Ok(())
    }

    pub fn mkdir(self: &Arc<Self>, path: &str) -> Result<()> {
        self.storage.mkdir(path)?;
        self.record_and_replicate(FileOpKind::Mkdir, path, None);
        Ok(())
    }

    pub fn rmdir(self: &Arc<Self>, path: &str) -> Result<()> {
        self.storage.rmdir(path)?;
        self.record_and_replicate(FileOpKind::Rmdir, path, None);
        Ok(())
    }

    pub fn rename(self: &Arc<Self>, from: &str, to: &str) -> Result<()> {
        self.storage.rename(from, to)?;
        self.record_and_replicate(FileOpKind::Rename { to: to.into() }, from, None);
        Ok(())
    }

    pub fn chmod(self: &Arc<Self>, path: &str, mode: u32) -> Result<()> {
        self.storage.chmod(path, mode)?;
        self.record_and_replicate(FileOpKind::Chmod { mode }, path, None);
        Ok(())
    }

    pub fn chown(self: &Arc<Self>, path: &str, owner: &str) -> Result<()> {
        self.storage.chown(path, owner)?;
        self.record_and_replicate(FileOpKind::Chown { owner: owner.into() }, path, None);
        Ok(())
    }

    // Reads: local storage, then the metadata cache, then a replica.

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        if let Ok(bytes) = self.storage.read(path) {
            return Ok(bytes);
        }

        let replicas = self
            .metadata
            .get(path)
            .map(|meta| meta.replicas.clone())
            .unwrap_or_else(|| self.node.nodes_for(path, self.replication_factor));

        let local = self.node.local_id();
        for replica in replicas.into_iter().filter(|r| *r != local) {
            if let Some(Payload::FileData {
                bytes: Some(bytes), ..
            }) = self
                .node
                .send_message(replica, Payload::FileRead { path: path.into() })
                .await
            {
                return Ok(bytes);
            }
        }
        Err(MeshError::FileNotFound { path: path.into() })
    }

    pub fn exists(&self, path: &str) -> bool {
        self.storage.exists(path) || self.metadata.contains_key(path)
    }

    /// Direct children of a directory, merged from local storage and the
    /// metadata cache.
    pub fn list_dir(&self, path: &str) -> Vec<String> {
        let mut names: BTreeSet<String> = self
            .storage
            .list_dir(path)
            .unwrap_or_default()
            .into_iter()
            .collect();

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        for entry in self.metadata.iter() {
            if let Some(rest) = entry.key().strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    names.insert(rest.to_string());
                }
            }
        }
        names.into_iter().collect()
    }

    pub fn get_file_info(&self, path: &str) -> Option<FileMetadata> {
        if let Some(meta) = self.metadata.get(path) {
            return Some(meta.value().clone());
        }
        let stat = self.storage.stat(path).ok()?;
        Some(FileMetadata {
            path: path.to_string(),
            size: stat.size,
            checksum: 0,
            modified: stat.modified,
            permissions: stat.permissions,
            is_directory: stat.is_directory,
            replicas: vec![self.node.local_id()],
            version: 0,
            locked_by: None,
        })
    }

    pub fn get_replication_status(&self) -> HashMap<String, ReplicationStatus> {
        self.metadata
            .iter()
            .map(|entry| {
                let meta = entry.value();
                (
                    meta.path.clone(),
                    ReplicationStatus {
                        path: meta.path.clone(),
                        replicas: meta.replicas.clone(),
                        version: meta.version,
                        healthy: meta.replicas.len() >= self.replication_factor.min(
                            self.node.active_nodes().len(),
                        ),
                    },
                )
            })
            .collect()
    }

    /// Conflicting operation pairs queued under the Manual strategy.
    pub fn pending_conflicts(&self) -> Vec<(FileOperation, FileOperation)> {
        self.pending_conflicts.lock().clone()
    }

    /// Currently held distributed locks (authoritative only on the
    /// leader).
    pub fn lock_holders(&self) -> Vec<(String, NodeId)> {
        self.locks.holders()
    }

    // Distributed locking, routed through the current leader. A lock
    // held by a crashed node is never reclaimed here.

    pub async fn acquire_lock(&self, path: &str, wait: Duration) -> Result<()> {
        let poll = Duration::from_millis(self.node.config().lock_poll_interval_ms);
        let deadline = tokio::time::Instant::now() + wait;
        let local = self.node.local_id();

        loop {
            let target = self.consensus.leader_id().unwrap_or(local);
            let granted = if target == local {
                self.locks.try_acquire(path, local)
            } else {
                match self
                    .node
                    .send_message(
                        target,
                        Payload::Lock {
                            path: path.into(),
                            requester: local,
                        },
                    )
                    .await
                {
                    Some(Payload::LockReply { granted, .. }) => granted,
                    _ => false,
                }
            };

            if granted {
                if let Some(mut meta) = self.metadata.get_mut(path) {
                    meta.locked_by = Some(local);
                }
                debug!("acquired lock on {path}");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MeshError::LockTimeout { path: path.into() });
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn release_lock(&self, path: &str) -> Result<()> {
        let local = self.node.local_id();
        let target = self.consensus.leader_id().unwrap_or(local);
        if target == local {
            self.locks.release(path, local);
        } else {
            self.node
                .send_message(
                    target,
                    Payload::Unlock {
                        path: path.into(),
                        requester: local,
                    },
                )
                .await;
        }
        if let Some(mut meta) = self.metadata.get_mut(path) {
            meta.locked_by = None;
        }
        Ok(())
    }

    /// Serve inbound filesystem traffic. Returns `None` for payloads that
    /// are not filesystem concerns.
    pub async fn handle_message(&self, message: &ClusterMessage) -> Option<Payload> {
        match &message.payload {
            Payload::FileOp(op) => Some(self.receive_remote_op(op)),
            Payload::FileRead { path } => Some(Payload::FileData {
                path: path.clone(),
                bytes: self.storage.read(path).ok(),
            }),
            Payload::SyncRequest { since } => Some(Payload::SyncData {
                ops: self.ops_since(*since),
            }),
            Payload::SyncData { ops } => {
                for op in ops {
                    self.receive_remote_op(op);
                }
                Some(Payload::SyncAck { applied: ops.len() })
            }
            Payload::Lock { path, requester } => {
                // Leader-only: a non-leader that knows a leader refuses so
                // the client retries there.
                let local = self.node.local_id();
                if !self.consensus.is_leader()
                    && self.consensus.leader_id().is_some_and(|l| l != local)
                {
                    return Some(Payload::LockReply {
                        granted: false,
                        holder: None,
                    });
                }
                let granted = self.locks.try_acquire(path, *requester);
                if granted {
                    if let Some(mut meta) = self.metadata.get_mut(path) {
                        meta.locked_by = Some(*requester);
                    }
                }
                Some(Payload::LockReply {
                    granted,
                    holder: self.locks.holder(path),
                })
            }
            Payload::Unlock { path, requester } => {
                self.locks.release(path, *requester);
                if let Some(mut meta) = self.metadata.get_mut(path) {
                    meta.locked_by = None;
                }
                Some(Payload::ack())
            }
            _ => None,
        }
    }

    fn record_and_replicate(self: &Arc<Self>, kind: FileOpKind, path: &str, payload: Option<Vec<u8>>) {
        let clock = self.node.tick_clock();
        let op = FileOperation::new(kind, path, payload, clock, self.node.local_id());
        {
            self.seen_ops.lock().insert(op.op_id);
            self.oplog.lock().push(op.clone());
        }
        self.update_metadata(&op);
        self.note_replica(&op.path, self.node.local_id());
        self.replicate(op);
    }

    /// Fire the op at the ring-chosen owners of the path. Unresolved
    /// sends are left to the sync loop to repair.
    fn replicate(self: &Arc<Self>, op: FileOperation) {
        let local = self.node.local_id();
        let targets: Vec<NodeId> = self
            .node
            .nodes_for(&op.path, self.replication_factor)
            .into_iter()
            .filter(|n| *n != local)
            .collect();

        for target in targets {
            let fs = self.clone();
            let op = op.clone();
            tokio::spawn(async move {
                match fs
                    .node
                    .send_message(target, Payload::FileOp(op.clone()))
                    .await
                {
                    Some(Payload::Ack { ok: true, .. }) => fs.note_replica(&op.path, target),
                    _ => debug!("replication of {} to {target} unresolved", op.path),
                }
            });
        }
    }

    fn receive_remote_op(&self, op: &FileOperation) -> Payload {
        if !self.seen_ops.lock().insert(op.op_id) {
            return Payload::ack(); // duplicate delivery
        }

        let conflicting = {
            let log = self.oplog.lock();
            log.iter()
                .rev()
                .find(|local| local.path == op.path && local.clock.concurrent_with(&op.clock))
                .cloned()
        };

        match conflicting {
            Some(local_op) => {
                self.resolve_conflict(local_op, op.clone());
                Payload::ack()
            }
            None => match self.apply_remote(op) {
                Ok(()) => Payload::ack(),
                Err(e) => {
                    warn!("applying remote {} on {} failed: {e}", op.kind.name(), op.path);
                    Payload::nack(e.to_string())
                }
            },
        }
    }

    fn apply_remote(&self, op: &FileOperation) -> Result<()> {
        self.apply_kind(&op.kind, &op.path, op.payload.as_deref())?;
        self.node.observe_clock(&op.clock);
        self.oplog.lock().push(op.clone());
        self.update_metadata(op);
        self.note_replica(&op.path, op.origin);
        self.note_replica(&op.path, self.node.local_id());
        Ok(())
    }

    /// Apply an operation kind to local storage, tolerating replays
    /// against state the op has already reached.
    fn apply_kind(&self, kind: &FileOpKind, path: &str, payload: Option<&[u8]>) -> Result<()> {
        match kind {
            FileOpKind::Create | FileOpKind::Write => {
                self.storage.write(path, payload.unwrap_or_default())
            }
            FileOpKind::Delete => match self.storage.remove(path) {
                Err(MeshError::FileNotFound { .. }) => Ok(()),
                other => other,
            },
            FileOpKind::Rename { to } => match self.storage.rename(path, to) {
                Err(MeshError::FileNotFound { .. }) => Ok(()),
                other => other,
            },
            FileOpKind::Mkdir => match self.storage.mkdir(path) {
                Err(MeshError::FileExists { .. }) => Ok(()),
                other => other,
            },
            FileOpKind::Rmdir => match self.storage.rmdir(path) {
                Err(MeshError::FileNotFound { .. }) => Ok(()),
                other => other,
            },
            FileOpKind::Chmod { mode } => match self.storage.chmod(path, *mode) {
                Err(MeshError::FileNotFound { .. }) => Ok(()),
                other => other,
            },
            FileOpKind::Chown { owner } => match self.storage.chown(path, owner) {
                Err(MeshError::FileNotFound { .. }) => Ok(()),
                other => other,
            },
        }
    }

    fn resolve_conflict(&self, local: FileOperation, remote: FileOperation) {
        info!(
            "concurrent {} on {} from {} (strategy {:?})",
            remote.kind.name(),
            remote.path,
            remote.origin,
            self.strategy
        );

        match self.strategy {
            ConflictStrategy::LastWriteWins => {
                // Millisecond ties break on origin id so every replica
                // picks the same winner.
                let remote_wins = (remote.timestamp, remote.origin) > (local.timestamp, local.origin);
                if remote_wins {
                    if let Err(e) = self.apply_remote(&remote) {
                        warn!("conflict winner failed to apply on {}: {e}", remote.path);
                    }
                } else {
                    debug!("keeping local write for {}", remote.path);
                    self.oplog.lock().push(remote);
                }
            }
            ConflictStrategy::Version => match &remote.kind {
                FileOpKind::Create | FileOpKind::Write => {
                    let versioned = self.next_version_name(&remote.path);
                    let payload = remote.payload.clone().unwrap_or_default();
                    if let Err(e) = self.storage.write(&versioned, &payload) {
                        warn!("versioned copy {versioned} failed: {e}");
                        return;
                    }
                    let mut shadow = remote.clone();
                    shadow.path = versioned.clone();
                    self.update_metadata(&shadow);
                    self.note_replica(&versioned, self.node.local_id());
                    self.oplog.lock().push(remote);
                    info!("kept concurrent write as {versioned}");
                }
                _ => {
                    // Only content-bearing ops get a versioned copy.
                    if let Err(e) = self.apply_remote(&remote) {
                        warn!("conflict apply on {} failed: {e}", remote.path);
                    }
                }
            },
            ConflictStrategy::Merge => {
                let mut merged = self.storage.read(&remote.path).unwrap_or_default();
                merged.extend_from_slice(CONFLICT_MARKER);
                merged.extend_from_slice(remote.payload.as_deref().unwrap_or_default());
                if let Err(e) = self.storage.write(&remote.path, &merged) {
                    warn!("merge on {} failed: {e}", remote.path);
                    return;
                }
                let mut shadow = remote.clone();
                shadow.payload = Some(merged);
                self.update_metadata(&shadow);
                self.oplog.lock().push(remote);
            }
            ConflictStrategy::Manual => {
                warn!(
                    "queueing concurrent pair on {} for manual resolution",
                    remote.path
                );
                self.pending_conflicts.lock().push((local, remote));
            }
        }
    }

    fn next_version_name(&self, path: &str) -> String {
        for n in 1u32.. {
            let candidate = format!("{path}.v{n}");
            if !self.storage.exists(&candidate) && !self.metadata.contains_key(&candidate) {
                return candidate;
            }
        }
        unreachable!("version counter exhausted")
    }

    fn update_metadata(&self, op: &FileOperation) {
        match &op.kind {
            FileOpKind::Delete | FileOpKind::Rmdir => {
                self.metadata.remove(&op.path);
                return;
            }
            FileOpKind::Rename { to } => {
                if let Some((_, mut meta)) = self.metadata.remove(&op.path) {
                    meta.path = to.clone();
                    meta.version += 1;
                    meta.modified = op.timestamp;
                    self.metadata.insert(to.clone(), meta);
                }
                return;
            }
            _ => {}
        }

        let stat = self.storage.stat(&op.path).ok();
        let mut entry = self
            .metadata
            .entry(op.path.clone())
            .or_insert_with(|| FileMetadata {
                path: op.path.clone(),
                size: 0,
                checksum: 0,
                modified: op.timestamp,
                permissions: 0o644,
                is_directory: matches!(op.kind, FileOpKind::Mkdir),
                replicas: Vec::new(),
                version: 0,
                locked_by: None,
            });
        entry.version += 1;
        entry.modified = op.timestamp;
        if let Some(stat) = stat {
            entry.size = stat.size;
            entry.permissions = stat.permissions;
            entry.is_directory = stat.is_directory;
        }
        if let Some(payload) = op.payload.as_deref() {
            entry.checksum = crc32fast::hash(payload);
        }
    }

    fn note_replica(&self, path: &str, node: NodeId) {
        if let Some(mut meta) = self.metadata.get_mut(path) {
            if !meta.replicas.contains(&node) {
                meta.replicas.push(node);
            }
        }
    }

    fn ops_since(&self, since: u64) -> Vec<FileOperation> {
        self.oplog
            .lock()
            .iter()
            .filter(|op| op.timestamp > since)
            .take(SYNC_BATCH_LIMIT)
            .cloned()
            .collect()
    }

    /// Exchange missed operations with every active peer, both ways.
    async fn sync_loop(self: Arc<Self>) {
        let cancel = self.node.cancellation_token();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.node.config().sync_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for peer in self.node.active_peers() {
                let since = self.last_sync.get(&peer).map(|e| *e.value()).unwrap_or(0);
                let started = now_millis();

                let pulled = self
                    .node
                    .send_message(peer, Payload::SyncRequest { since })
                    .await;
                let Some(Payload::SyncData { ops }) = pulled else {
                    // Unreachable peer: keep the cursor so nothing is skipped.
                    continue;
                };
                for op in &ops {
                    self.receive_remote_op(op);
                }

                let ours = self.ops_since(since);
                if !ours.is_empty() {
                    self.node
                        .send_message(peer, Payload::SyncData { ops: ours })
                        .await;
                }
                self.last_sync.insert(peer, started);
            }
        }
    }

    fn forget_peer(&self, node: NodeId) {
        self.last_sync.remove(&node);
        for mut entry in self.metadata.iter_mut() {
            entry.replicas.retain(|r| *r != node);
        }
    }
}

struct FsMessageHandler(Arc<DistributedFilesystem>);

#[async_trait]
impl MessageHandler for FsMessageHandler {
    async fn handle(&self, message: &ClusterMessage) -> Option<Payload> {
        self.0.handle_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use meshos_common::{ClusterConfig, VectorClock};

    fn filesystem(strategy: ConflictStrategy) -> Arc<DistributedFilesystem> {
        let node = Arc::new(ClusterNode::new(ClusterConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            conflict_strategy: strategy,
            ..ClusterConfig::default()
        }));
        node.create_cluster("dfs-tests").unwrap();
        let consensus = ConsensusEngine::new(node.clone());
        DistributedFilesystem::new(node, consensus, Arc::new(MemoryStorage::new()))
    }

    fn remote_op(kind: FileOpKind, path: &str, payload: &[u8], timestamp: u64) -> FileOperation {
        let origin = NodeId::new();
        let mut clock = VectorClock::new();
        clock.tick(origin);
        let mut op = FileOperation::new(kind, path, Some(payload.to_vec()), clock, origin);
        op.timestamp = timestamp;
        op
    }

    #[tokio::test]
    async fn local_mutations_update_log_and_metadata() {
        let fs = filesystem(ConflictStrategy::LastWriteWins);
        fs.create("/etc/motd", b"welcome").unwrap();

        assert!(fs.exists("/etc/motd"));
        let meta = fs.get_file_info("/etc/motd").unwrap();
        assert_eq!(meta.size, 7);
        assert_eq!(meta.version, 1);
        assert_eq!(meta.checksum, crc32fast::hash(b"welcome"));
        assert_eq!(fs.read("/etc/motd").await.unwrap(), b"welcome");
    }

    #[tokio::test]
    async fn non_conflicting_remote_ops_apply_unconditionally() {
        let fs = filesystem(ConflictStrategy::LastWriteWins);
        let op = remote_op(FileOpKind::Create, "/var/db", b"remote", now_millis());

        match fs.receive_remote_op(&op) {
            Payload::Ack { ok, .. } => assert!(ok),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(fs.read("/var/db").await.unwrap(), b"remote");

        // Re-delivery is a no-op.
        fs.receive_remote_op(&op);
        assert_eq!(fs.oplog.lock().iter().filter(|o| o.op_id == op.op_id).count(), 1);
    }

    #[tokio::test]
    async fn last_write_wins_applies_only_newer_concurrent_writes() {
        let fs = filesystem(ConflictStrategy::LastWriteWins);
        fs.create("/data", b"local").unwrap();
        let local_ts = fs.oplog.lock().last().unwrap().timestamp;

        // Older concurrent write loses.
        let stale = remote_op(FileOpKind::Write, "/data", b"stale", local_ts.saturating_sub(10));
        fs.receive_remote_op(&stale);
        assert_eq!(fs.read("/data").await.unwrap(), b"local");

        // Newer concurrent write wins.
        let fresh = remote_op(FileOpKind::Write, "/data", b"fresh", local_ts + 10);
        fs.receive_remote_op(&fresh);
        assert_eq!(fs.read("/data").await.unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn version_strategy_keeps_both_copies() {
        let fs = filesystem(ConflictStrategy::Version);
        fs.create("/report", b"mine").unwrap();

        let op = remote_op(FileOpKind::Write, "/report", b"theirs", now_millis() + 5);
        fs.receive_remote_op(&op);

        assert_eq!(fs.read("/report").await.unwrap(), b"mine");
        assert_eq!(fs.read("/report.v1").await.unwrap(), b"theirs");
    }

    #[tokio::test]
    async fn merge_strategy_appends_with_marker() {
        let fs = filesystem(ConflictStrategy::Merge);
        fs.create("/notes", b"alpha").unwrap();

        let op = remote_op(FileOpKind::Write, "/notes", b"beta", now_millis() + 5);
        fs.receive_remote_op(&op);

        let merged = fs.read("/notes").await.unwrap();
        assert!(merged.starts_with(b"alpha"));
        assert!(merged.ends_with(b"beta"));
        assert!(merged.len() > b"alpha".len() + b"beta".len());
    }

    #[tokio::test]
    async fn manual_strategy_queues_without_applying() {
        let fs = filesystem(ConflictStrategy::Manual);
        fs.create("/spool", b"kept").unwrap();

        let op = remote_op(FileOpKind::Write, "/spool", b"queued", now_millis() + 5);
        fs.receive_remote_op(&op);

        assert_eq!(fs.read("/spool").await.unwrap(), b"kept");
        let pending = fs.pending_conflicts();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.path, "/spool");
    }

    #[tokio::test]
    async fn listing_merges_storage_and_metadata() {
        let fs = filesystem(ConflictStrategy::LastWriteWins);
        fs.mkdir("/srv").unwrap();
        fs.create("/srv/a", b"1").unwrap();
        fs.create("/srv/b", b"2").unwrap();

        assert_eq!(fs.list_dir("/srv"), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn locks_fall_back_to_self_without_a_leader() {
        let fs = filesystem(ConflictStrategy::LastWriteWins);
        fs.create("/locked", b"x").unwrap();

        fs.acquire_lock("/locked", Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(
            fs.get_file_info("/locked").unwrap().locked_by,
            Some(fs.node.local_id())
        );

        fs.release_lock("/locked").await.unwrap();
        assert_eq!(fs.get_file_info("/locked").unwrap().locked_by, None);
    }
}
