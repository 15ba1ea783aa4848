// Replica server wrapper
// Owns one Raft instance plus its storage and state machine, exposes
// the coordination API (session issue, request submission, membership
// administration) and runs the leader's session expiry loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::BasicNode;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rookery_common::{CoordinationError, CoordinationResult};

use super::config::CoordinationConfig;
use super::log_store::LogStore;
use super::network::Router;
use super::request::{KeeperOp, OpResult, RequestForSession};
use super::snapshot::SnapshotStore;
use super::state_machine::{KeeperState, KeeperStateMachine};
use super::types::{NodeId, Raft, RaftMetrics};
use crate::queue::{ResponseQueue, SessionResponse};

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

fn write_error(
    e: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>,
) -> CoordinationError {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(_)) => CoordinationError::NotLeader,
        // The instance is going down; blocked callers get released
        // with an explicit shutdown failure instead of hanging
        RaftError::Fatal(_) => CoordinationError::ShuttingDown,
        other => CoordinationError::Internal(other.to_string()),
    }
}

/// Builder for a coordination replica
pub struct KeeperNodeBuilder {
    id: NodeId,
    config: CoordinationConfig,
    router: Router,
    initial_members: BTreeMap<NodeId, BasicNode>,
}

impl KeeperNodeBuilder {
    pub fn new(id: NodeId, config: CoordinationConfig, router: Router) -> Self {
        Self {
            id,
            config,
            router,
            initial_members: BTreeMap::new(),
        }
    }

    /// Add a node to the initial cluster membership. A builder with no
    /// initial members produces a replica that waits to be added by an
    /// existing cluster.
    pub fn initial_member(mut self, id: NodeId, address: &str) -> Self {
        self.initial_members.insert(id, BasicNode::new(address));
        self
    }

    /// Open storage, restore the newest snapshot, start the Raft
    /// instance and register it with the router
    pub async fn build(self) -> anyhow::Result<Arc<KeeperNode>> {
        let config = Arc::new(self.config);
        config.ensure_dirs()?;

        let log_store = LogStore::new(config.log_dir()).await?;
        let snapshots = Arc::new(SnapshotStore::new(
            config.snapshot_dir(),
            config.snapshots_to_retain,
        ));
        let queue = Arc::new(ResponseQueue::new());
        let state_machine = KeeperStateMachine::new(snapshots, queue.clone()).await?;
        let state = state_machine.state();

        let raft_config = Arc::new(config.to_openraft_config().validate()?);
        let raft = Raft::new(
            self.id,
            raft_config,
            self.router.clone(),
            log_store,
            state_machine,
        )
        .await?;

        self.router.register(self.id, raft.clone());

        if !self.initial_members.is_empty() {
            match raft.initialize(self.initial_members).await {
                Ok(()) => info!(id = self.id, "cluster initialized"),
                // Already initialized from persisted state (restart)
                Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                    debug!(id = self.id, "cluster already initialized");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let shutting_down = Arc::new(AtomicBool::new(false));
        let expiry_task = tokio::spawn(session_expiry_loop(
            self.id,
            raft.clone(),
            state.clone(),
            config.session_check_interval(),
            shutting_down.clone(),
        ));

        Ok(Arc::new(KeeperNode {
            id: self.id,
            config,
            raft,
            state,
            queue,
            router: self.router,
            shutting_down,
            expiry_task: Mutex::new(Some(expiry_task)),
        }))
    }
}

/// Leader-only loop proposing session expiry markers
///
/// Expiry decisions themselves happen at apply time from the marker's
/// committed timestamp, so a stale leader racing this loop is harmless.
async fn session_expiry_loop(
    id: NodeId,
    raft: Raft,
    state: Arc<RwLock<KeeperState>>,
    interval: Duration,
    shutting_down: Arc<AtomicBool>,
) {
    loop {
        tokio::time::sleep(interval).await;
        if shutting_down.load(Ordering::Relaxed) {
            return;
        }
        if raft.current_leader().await != Some(id) {
            continue;
        }

        let now = now_ms();
        let dead = { state.read().await.sessions.dead_sessions(now) };
        if dead.is_empty() {
            continue;
        }

        debug!(count = dead.len(), "proposing session expiry check");
        let marker = RequestForSession::new(0, 0, now, KeeperOp::CheckSessions);
        if let Err(e) = raft.client_write(marker).await {
            // Lost leadership mid-propose; the new leader's loop takes over
            debug!("expiry proposal not committed: {}", e);
        }
    }
}

/// One coordination replica
pub struct KeeperNode {
    id: NodeId,
    config: Arc<CoordinationConfig>,
    raft: Raft,
    state: Arc<RwLock<KeeperState>>,
    queue: Arc<ResponseQueue>,
    router: Router,
    shutting_down: Arc<AtomicBool>,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

impl KeeperNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// The queue connections subscribe to for replies and watch events
    pub fn response_queue(&self) -> Arc<ResponseQueue> {
        self.queue.clone()
    }

    /// Read access to the applied state, for admin views and tests
    pub fn state(&self) -> Arc<RwLock<KeeperState>> {
        self.state.clone()
    }

    /// Issue a new session, returning its cluster-wide id
    pub async fn get_session_id(&self, timeout_ms: u64) -> CoordinationResult<u64> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(CoordinationError::ShuttingDown);
        }
        let timeout_ms = self.config.clamp_session_timeout(timeout_ms);
        let req = RequestForSession::new(0, 0, now_ms(), KeeperOp::NewSession { timeout_ms });

        let resp = self.raft.client_write(req).await.map_err(write_error)?;
        match resp.data {
            Ok(OpResult::SessionCreated { session_id }) => Ok(session_id),
            Ok(other) => Err(CoordinationError::Internal(format!(
                "unexpected session outcome: {:?}",
                other
            ))),
            Err(e) => Err(e),
        }
    }

    /// Submit an operation for a session
    ///
    /// Fire-and-forget: the outcome arrives on the session's response
    /// queue subscription once the entry commits and applies. Returns
    /// an error only when the request cannot be accepted at all.
    pub fn put_request(
        &self,
        session_id: u64,
        request_id: u64,
        op: KeeperOp,
    ) -> CoordinationResult<()> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(CoordinationError::ShuttingDown);
        }
        if session_id == 0 {
            return Err(CoordinationError::Internal(
                "session id 0 is reserved".to_string(),
            ));
        }
        // Fast rejection on a follower; a leadership change racing the
        // proposal is still caught when the write itself fails
        if self.metrics().current_leader != Some(self.id) {
            return Err(CoordinationError::NotLeader);
        }

        let req = RequestForSession::new(session_id, request_id, now_ms(), op);
        let raft = self.raft.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if let Err(e) = raft.client_write(req).await {
                // Commit failed, so the state machine will never answer;
                // report the failure on the same channel
                queue.push(SessionResponse::Reply {
                    session_id,
                    request_id,
                    outcome: Err(write_error(e)),
                });
            }
        });
        Ok(())
    }

    /// Session ids that have outlived their timeout at the current
    /// logical time; the expiry loop turns these into committed markers
    pub async fn get_dead_sessions(&self) -> Vec<u64> {
        let state = self.state.read().await;
        let now = state.sessions.last_committed_ms();
        state.sessions.dead_sessions(now)
    }

    pub async fn is_leader(&self) -> bool {
        self.raft.current_leader().await == Some(self.id)
    }

    /// Whether any replica currently holds a live leader lease
    pub async fn is_leader_alive(&self) -> bool {
        self.raft.current_leader().await.is_some()
    }

    pub fn metrics(&self) -> RaftMetrics {
        self.raft.metrics().borrow().clone()
    }

    /// Add a replica to the cluster
    ///
    /// The node first joins as a learner; with `can_be_leader` it is
    /// promoted to voter once it has caught up, otherwise it stays a
    /// non-voting learner. `priority` is accepted for configuration
    /// compatibility; leader preference is not supported and a nonzero
    /// value is only logged.
    pub async fn add_server(
        &self,
        node_id: NodeId,
        address: &str,
        can_be_leader: bool,
        priority: i32,
    ) -> anyhow::Result<()> {
        if priority != 0 {
            warn!(node_id, priority, "server priority is ignored");
        }
        info!(node_id, address, can_be_leader, "adding server");
        self.raft
            .add_learner(node_id, BasicNode::new(address), true)
            .await?;
        if !can_be_leader {
            return Ok(());
        }

        let mut voters: std::collections::BTreeSet<NodeId> = self
            .metrics()
            .membership_config
            .membership()
            .voter_ids()
            .collect();
        voters.insert(node_id);
        self.raft.change_membership(voters, false).await?;
        Ok(())
    }

    /// Remove a replica from the voting membership
    pub async fn remove_server(&self, node_id: NodeId) -> anyhow::Result<()> {
        info!(node_id, "removing server");
        let voters: std::collections::BTreeSet<NodeId> = self
            .metrics()
            .membership_config
            .membership()
            .voter_ids()
            .filter(|id| *id != node_id)
            .collect();
        self.raft.change_membership(voters, false).await?;
        Ok(())
    }

    /// Block until the cluster has an elected leader
    pub async fn wait_init(&self, timeout: Duration) -> anyhow::Result<()> {
        self.raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await?;
        Ok(())
    }

    /// Block until `node_id` appears in the committed membership
    pub async fn wait_for_server(&self, node_id: NodeId, timeout: Duration) -> anyhow::Result<()> {
        self.raft
            .wait(Some(timeout))
            .metrics(
                move |m| {
                    m.membership_config
                        .membership()
                        .nodes()
                        .any(|(id, _)| *id == node_id)
                },
                "server in membership",
            )
            .await?;
        Ok(())
    }

    /// Block until this replica has applied up to `index`
    pub async fn wait_applied(&self, index: u64, timeout: Duration) -> anyhow::Result<()> {
        self.raft
            .wait(Some(timeout))
            .metrics(
                move |m| m.last_applied.map(|l| l.index).unwrap_or(0) >= index,
                "entry applied",
            )
            .await?;
        Ok(())
    }

    /// Stop accepting requests, stop the expiry loop, shut the Raft
    /// instance down and release every queue subscriber
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.shutting_down.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        info!(id = self.id, "shutting down replica");

        if let Some(task) = self.expiry_task.lock().await.take() {
            task.abort();
        }
        if let Err(e) = self.raft.shutdown().await {
            error!("raft shutdown failed: {}", e);
        }
        self.router.deregister(self.id);
        self.queue.close_all();
        Ok(())
    }
}
