use meshos_common::{
    ExecReply, ExecRequest, FileOperation, NodeId, NodeInfo, PageId, ResourceUsage, VectorClock,
    now_millis,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire schema version; bumped on any incompatible payload change.
pub const WIRE_VERSION: u8 = 1;

/// Message types dispatched through the handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Discovery
    Hello,
    Ping,
    Pong,
    Info,
    // Consensus
    VoteRequest,
    VoteReply,
    AppendEntries,
    Heartbeat,
    // Data operations
    Exec,
    Read,
    Write,
    Lock,
    Unlock,
    // Synchronization
    SyncRequest,
    SyncData,
    SyncAck,
    StateUpdate,
    // Membership
    JoinRequest,
    JoinAccepted,
    LeaveNotice,
    NodeFailed,
}

/// Typed payload, one variant per request or reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Hello {
        node: NodeInfo,
        cluster_key: u64,
    },
    Ping,
    Pong {
        node: NodeInfo,
    },
    Info {
        node: NodeInfo,
    },
    /// Generic acknowledgement reply
    Ack {
        ok: bool,
        detail: Option<String>,
    },

    VoteRequest {
        term: u64,
        candidate: NodeId,
    },
    VoteReply {
        term: u64,
        granted: bool,
        voter: NodeId,
    },
    /// Reserved: consensus here governs leadership only, so entries are
    /// never carried. Treated as a term-bearing liveness signal.
    AppendEntries {
        term: u64,
        leader: NodeId,
    },
    Heartbeat {
        term: u64,
        leader: NodeId,
    },

    Exec(ExecRequest),
    ExecReply(ExecReply),

    PageRead {
        page_id: PageId,
    },
    PageData {
        page_id: PageId,
        bytes: Option<Vec<u8>>,
    },
    PageWrite {
        page_id: PageId,
        bytes: Vec<u8>,
    },
    PagePush {
        page_id: PageId,
        shared: bool,
        bytes: Vec<u8>,
    },
    PageInvalidate {
        page_id: PageId,
    },
    PageFree {
        page_id: PageId,
    },

    FileRead {
        path: String,
    },
    FileData {
        path: String,
        bytes: Option<Vec<u8>>,
    },
    FileOp(FileOperation),

    Lock {
        path: String,
        requester: NodeId,
    },
    LockReply {
        granted: bool,
        holder: Option<NodeId>,
    },
    Unlock {
        path: String,
        requester: NodeId,
    },

    SyncRequest {
        since: u64,
    },
    SyncData {
        ops: Vec<FileOperation>,
    },
    SyncAck {
        applied: usize,
    },
    StateUpdate {
        usage: ResourceUsage,
        free_memory: u64,
    },

    JoinRequest {
        node: NodeInfo,
        cluster_key: u64,
    },
    JoinAccepted {
        roster: Vec<NodeInfo>,
        leader: Option<NodeId>,
        term: u64,
    },
    LeaveNotice {
        node: NodeId,
    },
    NodeFailed {
        node: NodeId,
    },
}

impl Payload {
    /// Message type this payload dispatches under. Replies map to the
    /// type of the request that elicits them.
    pub fn kind(&self) -> MessageType {
        match self {
            Payload::Hello { .. } => MessageType::Hello,
            Payload::Ping => MessageType::Ping,
            Payload::Pong { .. } => MessageType::Pong,
            Payload::Info { .. } | Payload::Ack { .. } => MessageType::Info,
            Payload::VoteRequest { .. } => MessageType::VoteRequest,
            Payload::VoteReply { .. } => MessageType::VoteReply,
            Payload::AppendEntries { .. } => MessageType::AppendEntries,
            Payload::Heartbeat { .. } => MessageType::Heartbeat,
            Payload::Exec(_) | Payload::ExecReply(_) => MessageType::Exec,
            Payload::PageRead { .. }
            | Payload::PageData { .. }
            | Payload::FileRead { .. }
            | Payload::FileData { .. } => MessageType::Read,
            Payload::PageWrite { .. }
            | Payload::PagePush { .. }
            | Payload::PageInvalidate { .. }
            | Payload::PageFree { .. }
            | Payload::FileOp(_) => MessageType::Write,
            Payload::Lock { .. } | Payload::LockReply { .. } => MessageType::Lock,
            Payload::Unlock { .. } => MessageType::Unlock,
            Payload::SyncRequest { .. } => MessageType::SyncRequest,
            Payload::SyncData { .. } => MessageType::SyncData,
            Payload::SyncAck { .. } => MessageType::SyncAck,
            Payload::StateUpdate { .. } => MessageType::StateUpdate,
            Payload::JoinRequest { .. } => MessageType::JoinRequest,
            Payload::JoinAccepted { .. } => MessageType::JoinAccepted,
            Payload::LeaveNotice { .. } => MessageType::LeaveNotice,
            Payload::NodeFailed { .. } => MessageType::NodeFailed,
        }
    }

    pub fn ack() -> Self {
        Payload::Ack {
            ok: true,
            detail: None,
        }
    }

    pub fn nack(detail: impl Into<String>) -> Self {
        Payload::Ack {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Envelope for every frame on the wire. Immutable once serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMessage {
    pub version: u8,
    /// Globally unique per send
    pub message_id: Uuid,
    pub source: NodeId,
    pub dest: Option<NodeId>,
    pub timestamp: u64,
    /// Sender's vector clock at send time
    pub clock: VectorClock,
    pub payload: Payload,
}

impl ClusterMessage {
    pub fn new(source: NodeId, dest: Option<NodeId>, clock: VectorClock, payload: Payload) -> Self {
        Self {
            version: WIRE_VERSION,
            message_id: Uuid::new_v4(),
            source,
            dest,
            timestamp: now_millis(),
            clock,
            payload,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_kinds_cover_the_wire_protocol() {
        let node = NodeId::new();
        assert_eq!(Payload::Ping.kind(), MessageType::Ping);
        assert_eq!(
            Payload::VoteRequest {
                term: 1,
                candidate: node
            }
            .kind(),
            MessageType::VoteRequest
        );
        assert_eq!(
            Payload::PageRead {
                page_id: Uuid::new_v4()
            }
            .kind(),
            MessageType::Read
        );
        assert_eq!(
            Payload::FileRead {
                path: "/x".into()
            }
            .kind(),
            MessageType::Read
        );
        assert_eq!(
            Payload::NodeFailed { node }.kind(),
            MessageType::NodeFailed
        );
    }

    #[test]
    fn messages_get_unique_ids() {
        let source = NodeId::new();
        let a = ClusterMessage::new(source, None, VectorClock::new(), Payload::Ping);
        let b = ClusterMessage::new(source, None, VectorClock::new(), Payload::Ping);
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.version, WIRE_VERSION);
    }
}
