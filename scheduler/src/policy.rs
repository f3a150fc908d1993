use serde::{Deserialize, Serialize};

/// Placement policy applied when a pending process is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Target indexed by pid modulo active-node count
    RoundRobin,
    /// Node with the lowest last-reported load
    LeastLoaded,
    /// Node hosting the referenced data, else the first active node
    DataLocality,
    /// Pinned node only; the process waits while it is unavailable
    Affinity,
    Random,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        SchedulingPolicy::LeastLoaded
    }
}

impl std::fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SchedulingPolicy::RoundRobin => "round_robin",
            SchedulingPolicy::LeastLoaded => "least_loaded",
            SchedulingPolicy::DataLocality => "data_locality",
            SchedulingPolicy::Affinity => "affinity",
            SchedulingPolicy::Random => "random",
        };
        write!(f, "{name}")
    }
}
