use meshos_common::{AccessMode, NodeId, PageId, Pid, now_millis};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a page's backing bytes live relative to this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    /// Backed by the local allocator
    Local,
    /// Owned by a peer; reads fetch, writes go through
    Remote,
    /// Local copy with replicas elsewhere
    Shared,
    /// Ownership transfer in flight; transient
    Migrating,
    /// Unusable, must be re-allocated
    Invalid,
}

/// One page of distributed shared memory.
///
/// Exactly one node owns a page at any time; `owner` changes only through
/// migration, and `Migrating` must resolve to Local/Remote/Invalid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageDescriptor {
    pub page_id: PageId,
    /// Address in the owner's allocator; zero while not locally backed
    pub virtual_addr: u64,
    pub owner: NodeId,
    pub state: PageState,
    pub access_mode: AccessMode,
    pub ref_count: u32,
    pub dirty: bool,
    pub last_access: u64,
    pub replicas: Vec<NodeId>,
}

impl PageDescriptor {
    pub fn new_local(owner: NodeId, virtual_addr: u64, access_mode: AccessMode) -> Self {
        Self {
            page_id: Uuid::new_v4(),
            virtual_addr,
            owner,
            state: PageState::Local,
            access_mode,
            ref_count: 0,
            dirty: false,
            last_access: now_millis(),
            replicas: Vec::new(),
        }
    }

    /// Empty shell referencing a page owned by a peer.
    pub fn new_remote(page_id: PageId, owner: NodeId, access_mode: AccessMode) -> Self {
        Self {
            page_id,
            virtual_addr: 0,
            owner,
            state: PageState::Remote,
            access_mode,
            ref_count: 0,
            dirty: false,
            last_access: now_millis(),
            replicas: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_access = now_millis();
    }
}

/// Contiguous run of pages belonging to one process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySegment {
    pub segment_id: Uuid,
    pub process_id: Pid,
    pub base_addr: u64,
    pub size: usize,
    pub pages: Vec<PageId>,
    pub shared: bool,
}
