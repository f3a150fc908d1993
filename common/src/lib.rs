pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{CausalOrdering, VectorClock};
pub use config::ClusterConfig;
pub use error::{MeshError, Result};
pub use types::*;
