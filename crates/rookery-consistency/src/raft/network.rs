// In-process Raft transport
// Replicas in one process reach each other through a shared router
// that maps node ids to running Raft instances. Deregistered targets
// report as unreachable, which is how tests simulate partitions.

use std::sync::Arc;

use dashmap::DashMap;
use openraft::error::{InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use tracing::debug;

use super::types::{NodeId, Raft, TypeConfig};

/// Routing table shared by every replica in the process
#[derive(Clone, Default)]
pub struct Router {
    targets: Arc<DashMap<NodeId, Raft>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a replica reachable under its id
    pub fn register(&self, id: NodeId, raft: Raft) {
        debug!(id, "registering replica with router");
        self.targets.insert(id, raft);
    }

    /// Remove a replica; subsequent RPCs to it fail as unreachable
    pub fn deregister(&self, id: NodeId) {
        debug!(id, "deregistering replica from router");
        self.targets.remove(&id);
    }

    fn lookup<E: std::error::Error>(
        &self,
        target: NodeId,
    ) -> Result<Raft, RPCError<NodeId, BasicNode, E>> {
        match self.targets.get(&target) {
            Some(raft) => Ok(raft.clone()),
            None => Err(RPCError::Unreachable(Unreachable::new(
                &std::io::Error::other(format!("node {} is not registered", target)),
            ))),
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for Router {
    type Network = RouterConnection;

    async fn new_client(&mut self, target: NodeId, _node: &BasicNode) -> Self::Network {
        RouterConnection {
            target,
            router: self.clone(),
        }
    }
}

/// A connection to one peer, resolved through the router on every call
/// so registration changes take effect immediately
pub struct RouterConnection {
    target: NodeId,
    router: Router,
}

impl RaftNetwork<TypeConfig> for RouterConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>>
    {
        let raft = self.router.lookup(self.target)?;
        raft.append_entries(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let raft = self.router.lookup(self.target)?;
        raft.install_snapshot(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let raft = self.router.lookup(self.target)?;
        raft.vote(rpc)
            .await
            .map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}
