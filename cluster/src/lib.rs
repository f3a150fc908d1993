pub mod consensus;
pub mod message;
pub mod node;
pub mod ring;
pub mod transport;

pub use consensus::ConsensusEngine;
pub use message::{ClusterMessage, MessageType, Payload, WIRE_VERSION};
pub use node::{ClusterNode, ClusterStatus, MembershipEvent, MessageHandler};
pub use ring::ConsistentHashRing;
pub use transport::Transport;
