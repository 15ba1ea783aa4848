// Raft type configuration for the coordination cluster

use std::io::Cursor;

use crate::raft::request::{ApplyOutcome, RequestForSession};

/// Raft node identifier
pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Type configuration for the coordination cluster
    pub TypeConfig:
        D = RequestForSession,
        R = ApplyOutcome,
        NodeId = NodeId,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// The Raft instance type for this cluster
pub type Raft = openraft::Raft<TypeConfig>;

/// Metrics emitted by the Raft instance
pub type RaftMetrics = openraft::RaftMetrics<NodeId, openraft::BasicNode>;

pub use openraft::ServerState;

/// Derive a stable node id from an advertised host and port
///
/// FNV-1a over the endpoint string; stable across processes and
/// platforms, unlike the std hasher.
pub fn calculate_node_id(host: &str, port: u16) -> NodeId {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let endpoint = format!("{}:{}", host, port);
    let mut hash = FNV_OFFSET;
    for byte in endpoint.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_node_id_is_stable() {
        let a = calculate_node_id("10.0.0.1", 2181);
        let b = calculate_node_id("10.0.0.1", 2181);
        assert_eq!(a, b);
    }

    #[test]
    fn test_calculate_node_id_distinguishes_endpoints() {
        let a = calculate_node_id("10.0.0.1", 2181);
        let b = calculate_node_id("10.0.0.1", 2182);
        let c = calculate_node_id("10.0.0.2", 2181);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }
}
