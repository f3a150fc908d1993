pub mod monitor;
pub mod runtime;

pub use monitor::{Alert, AlertSeverity, ClusterHealth, ClusterMonitor};
pub use runtime::NodeRuntime;
