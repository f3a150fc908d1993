use crate::clock::VectorClock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for a node in the cluster
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a shared-memory page
pub type PageId = Uuid;

/// Cluster-wide process identifier
pub type Pid = u64;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Node is looking for a cluster to join
    Discovering,

    /// Join request sent, waiting for the roster snapshot
    Joining,

    /// Roster adopted, catching up on replicated state
    Syncing,

    /// Full cluster member
    Active,

    /// Graceful departure in progress
    Leaving,

    /// Connection lost, not yet declared failed
    Disconnected,

    /// Rejoining after a failure
    Recovering,

    /// Declared failed by the failure detector
    Failed,
}

impl NodeState {
    /// States in which a node participates in placement and scheduling.
    pub fn is_active(self) -> bool {
        matches!(self, NodeState::Active)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Node role in leader election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Follows the current leader
    Follower,

    /// Participating in an election
    Candidate,

    /// Holds coordination authority for the current term
    Leader,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Last reported resource usage for a node
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Normalized load, 0.0 = idle
    pub cpu_load: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub process_count: u32,
}

/// Information about a node, exchanged in heartbeats and join replies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: SocketAddr,
    pub state: NodeState,
    pub role: NodeRole,
    /// Milliseconds since epoch of the last message seen from this node
    pub last_seen: u64,
    pub usage: ResourceUsage,
}

impl NodeInfo {
    pub fn new(id: NodeId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            state: NodeState::Discovering,
            role: NodeRole::Follower,
            last_seen: now_millis(),
            usage: ResourceUsage::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn mark_seen(&mut self) {
        self.last_seen = now_millis();
    }
}

/// Access mode of a shared-memory page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
    /// Single writer; remote writes pull the page to the writer
    Exclusive,
}

/// A single filesystem mutation, append-only once created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOperation {
    pub op_id: Uuid,
    pub kind: FileOpKind,
    pub path: String,
    pub payload: Option<Vec<u8>>,
    pub clock: VectorClock,
    pub origin: NodeId,
    pub timestamp: u64,
}

impl FileOperation {
    pub fn new(
        kind: FileOpKind,
        path: impl Into<String>,
        payload: Option<Vec<u8>>,
        clock: VectorClock,
        origin: NodeId,
    ) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            kind,
            path: path.into(),
            payload,
            clock,
            origin,
            timestamp: now_millis(),
        }
    }
}

/// Kinds of filesystem mutations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOpKind {
    Create,
    Write,
    Delete,
    Rename { to: String },
    Mkdir,
    Rmdir,
    Chmod { mode: u32 },
    Chown { owner: String },
}

impl FileOpKind {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            FileOpKind::Create => "create",
            FileOpKind::Write => "write",
            FileOpKind::Delete => "delete",
            FileOpKind::Rename { .. } => "rename",
            FileOpKind::Mkdir => "mkdir",
            FileOpKind::Rmdir => "rmdir",
            FileOpKind::Chmod { .. } => "chmod",
            FileOpKind::Chown { .. } => "chown",
        }
    }
}

/// Metadata cache entry derived from the operation log and local storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub size: u64,
    pub checksum: u32,
    pub modified: u64,
    pub permissions: u32,
    pub is_directory: bool,
    pub replicas: Vec<NodeId>,
    pub version: u64,
    pub locked_by: Option<NodeId>,
}

/// Strategy applied when two concurrent writes touch the same path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Apply the operation with the newer wall-clock timestamp
    LastWriteWins,
    /// Keep both, the loser under a `path.vN` name
    Version,
    /// Byte-append with a conflict marker, best effort for text
    Merge,
    /// Queue the pair for operator review, apply nothing
    Manual,
}

/// Process lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Pending,
    Scheduled,
    Running,
    Migrating,
    Completed,
    Failed,
}

/// What to run, where the environment comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub background: bool,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            background: false,
        }
    }
}

/// Serialized snapshot of a running process, enabling restore on another node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessCheckpoint {
    pub pid: Pid,
    pub spec: ProcessSpec,
    pub memory: Vec<u8>,
    pub open_files: Vec<String>,
    pub pending_signals: Vec<i32>,
    pub created_at: u64,
}

/// Process-control request carried by the `Exec` message type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecRequest {
    Spawn { pid: Pid, spec: ProcessSpec },
    Restore { checkpoint: ProcessCheckpoint },
    Kill { pid: Pid },
    Checkpoint { pid: Pid },
}

/// Reply to an `Exec` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecReply {
    pub accepted: bool,
    pub pid: Option<Pid>,
    pub checkpoint: Option<ProcessCheckpoint>,
    pub detail: Option<String>,
}

impl ExecReply {
    pub fn accepted(pid: Pid) -> Self {
        Self {
            accepted: true,
            pid: Some(pid),
            checkpoint: None,
            detail: None,
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            accepted: false,
            pid: None,
            checkpoint: None,
            detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_info_starts_discovering() {
        let info = NodeInfo::new(NodeId::new(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(info.state, NodeState::Discovering);
        assert_eq!(info.role, NodeRole::Follower);
        assert!(!info.is_active());
    }

    #[test]
    fn file_operation_roundtrips_through_bincode() {
        let origin = NodeId::new();
        let mut clock = VectorClock::new();
        clock.tick(origin);

        let op = FileOperation::new(
            FileOpKind::Write,
            "/etc/hosts",
            Some(b"127.0.0.1 localhost".to_vec()),
            clock,
            origin,
        );

        let bytes = bincode::serialize(&op).unwrap();
        let back: FileOperation = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.op_id, op.op_id);
        assert_eq!(back.kind, FileOpKind::Write);
        assert_eq!(back.path, "/etc/hosts");
    }
}
