use crate::types::NodeId;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the coordination layer
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("peer unreachable: {node}")]
    PeerUnreachable { node: NodeId },

    #[error("unknown node: {node}")]
    NodeNotFound { node: NodeId },

    #[error("no active nodes available")]
    NoActiveNodes,

    #[error("operation requires the cluster leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("insufficient memory: requested {requested} bytes, {available} available")]
    InsufficientMemory { requested: u64, available: u64 },

    #[error("page not found: {0}")]
    PageNotFound(Uuid),

    #[error("page is invalid: {0}")]
    PageInvalid(Uuid),

    #[error("page is migrating: {0}")]
    PageMigrating(Uuid),

    #[error("page migration failed for {page}: {reason}")]
    MigrationFailed { page: Uuid, reason: String },

    #[error("file not found: {path}")]
    FileNotFound { path: String },

    #[error("file already exists: {path}")]
    FileExists { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("directory not empty: {path}")]
    DirectoryNotEmpty { path: String },

    #[error("lock acquisition timed out: {path}")]
    LockTimeout { path: String },

    #[error("process not found: {pid}")]
    ProcessNotFound { pid: u64 },

    #[error("execution failed: {reason}")]
    ExecutionFailed { reason: String },

    #[error("no checkpoint available for process {pid}")]
    CheckpointMissing { pid: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cluster error: {0}")]
    Cluster(String),
}

pub type Result<T> = std::result::Result<T, MeshError>;
