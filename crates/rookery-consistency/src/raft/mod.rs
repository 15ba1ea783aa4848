// Raft consensus module for the Rookery cluster
// The election/replication algorithm is openraft; this module supplies
// the storage, state machine and server glue around it

pub mod config;
pub mod log_store;
pub mod network;
pub mod node;
pub mod request;
pub mod snapshot;
pub mod state_machine;
pub mod types;

// Re-export commonly used types
pub use config::CoordinationConfig;
pub use log_store::LogStore;
pub use network::Router;
pub use node::{KeeperNode, KeeperNodeBuilder};
pub use request::{ApplyOutcome, KeeperOp, OpResult, RequestForSession};
pub use snapshot::SnapshotStore;
pub use state_machine::{KeeperState, KeeperStateMachine};
pub use types::{calculate_node_id, NodeId, Raft, RaftMetrics, ServerState, TypeConfig};
