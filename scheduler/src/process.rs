use meshos_common::{NodeId, Pid, ProcessSpec, ProcessState, now_millis};
use serde::{Deserialize, Serialize};

/// A process tracked by the distributed scheduler.
///
/// Created on submission, destroyed on completion or kill. `node` is the
/// node currently executing it; `origin` is the node it was submitted on
/// and the one that orchestrates checkpoints and migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedProcess {
    pub pid: Pid,
    pub spec: ProcessSpec,
    pub state: ProcessState,
    pub node: Option<NodeId>,
    pub origin: NodeId,
    /// Pinned placement; migration skips pinned processes
    pub affinity: Option<NodeId>,
    /// Path whose ring owner the DataLocality policy prefers
    pub data_path: Option<String>,
    pub submitted_at: u64,
    pub started_at: Option<u64>,
    pub last_checkpoint_at: u64,
    pub restarts: u32,
}

impl DistributedProcess {
    pub fn new(pid: Pid, spec: ProcessSpec, origin: NodeId) -> Self {
        Self {
            pid,
            spec,
            state: ProcessState::Pending,
            node: None,
            origin,
            affinity: None,
            data_path: None,
            submitted_at: now_millis(),
            started_at: None,
            last_checkpoint_at: 0,
            restarts: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ProcessState::Completed | ProcessState::Failed)
    }
}

/// Submission options beyond the bare spec
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub affinity: Option<NodeId>,
    pub data_path: Option<String>,
}
