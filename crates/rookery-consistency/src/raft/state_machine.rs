// The deterministic state machine
// Applies committed log entries to the namespace tree and session
// table, produces per-session responses, and serializes/restores
// snapshots. Every replica runs this code over the same entries in the
// same order and reaches the same state.

use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, SnapshotMeta,
    StorageError, StoredMembership,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use rookery_common::{parent, CoordinationError};

use super::request::{ApplyOutcome, KeeperOp, OpResult, RequestForSession};
use super::snapshot::{SnapshotStore, StoredSnapshot};
use super::types::{NodeId, TypeConfig};
use crate::queue::{ResponseQueue, SessionResponse};
use crate::session::SessionRegistry;
use crate::store::StateStore;
use crate::watch::{EventKind, WatchEvent, WatchKind, WatchRegistry};

/// Helper to create StorageError for state machine operations
fn sm_error(e: impl std::fmt::Display, verb: ErrorVerb) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::StateMachine,
        verb,
        std::io::Error::other(e.to_string()),
    )
}

/// The serialized part of a snapshot: tree plus session table.
/// Watches are volatile and deliberately absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SnapshotPayload {
    store: StateStore,
    sessions: SessionRegistry,
}

/// Namespace mutations that can fire watches, recorded during apply
/// and fired only once the whole operation has succeeded
enum Mutation {
    Created(String),
    Deleted(String),
    DataChanged(String),
}

/// Everything the state machine owns. Guarded by one RwLock: appliers
/// take the write side one at a time, snapshot readers take the read
/// side and block application only while cloning.
#[derive(Debug)]
pub struct KeeperState {
    pub last_applied: Option<LogId<NodeId>>,
    pub last_membership: StoredMembership<NodeId, BasicNode>,
    pub store: StateStore,
    pub sessions: SessionRegistry,
    pub watches: WatchRegistry,
}

impl KeeperState {
    pub fn new() -> Self {
        Self {
            last_applied: None,
            last_membership: StoredMembership::default(),
            store: StateStore::new(),
            sessions: SessionRegistry::new(),
            watches: WatchRegistry::new(),
        }
    }

    /// Apply one committed operation, returning its outcome and any
    /// watch notifications it fired
    pub fn apply_op(
        &mut self,
        index: u64,
        req: &RequestForSession,
    ) -> (ApplyOutcome, Vec<(u64, WatchEvent)>) {
        match &req.op {
            KeeperOp::NewSession { timeout_ms } => {
                let session_id = self.sessions.create_session(*timeout_ms, req.time_ms);
                debug!(session_id, timeout_ms, "session created");
                (Ok(OpResult::SessionCreated { session_id }), Vec::new())
            }

            KeeperOp::CheckSessions => {
                let expired = self.sessions.dead_sessions(req.time_ms);
                let mut events = Vec::new();
                for session_id in &expired {
                    info!(session_id, "session expired");
                    events.extend(self.close_session(*session_id));
                }
                (Ok(OpResult::SessionsChecked { expired }), events)
            }

            op => {
                // Every session-bound operation refreshes the session;
                // a vanished session is reported, never ignored
                if let Err(e) = self.sessions.touch(req.session_id, req.time_ms) {
                    return (Err(e), Vec::new());
                }
                self.apply_session_op(index, req, op)
            }
        }
    }

    fn apply_session_op(
        &mut self,
        index: u64,
        req: &RequestForSession,
        op: &KeeperOp,
    ) -> (ApplyOutcome, Vec<(u64, WatchEvent)>) {
        let session_id = req.session_id;
        match op {
            KeeperOp::Ping => (Ok(OpResult::Pong), Vec::new()),

            KeeperOp::CloseSession => {
                let events = self.close_session(session_id);
                (Ok(OpResult::SessionClosed), events)
            }

            KeeperOp::Sync { path } => (Ok(OpResult::Synced { path: path.clone() }), Vec::new()),

            KeeperOp::Create {
                path,
                data,
                ephemeral,
                sequential,
            } => {
                let owner = if *ephemeral { session_id } else { 0 };
                match self
                    .store
                    .create(path, data.clone(), owner, *sequential, index, req.time_ms)
                {
                    Ok((actual_path, _)) => {
                        if *ephemeral {
                            self.sessions.add_ephemeral(session_id, actual_path.clone());
                        }
                        let events = fire(&mut self.watches, &[Mutation::Created(actual_path.clone())]);
                        (Ok(OpResult::Created { path: actual_path }), events)
                    }
                    Err(e) => (Err(e), Vec::new()),
                }
            }

            KeeperOp::Delete { path, version } => match self.store.delete(path, *version) {
                Ok(removed) => {
                    if removed.stat.ephemeral_owner != 0 {
                        self.sessions
                            .remove_ephemeral(removed.stat.ephemeral_owner, path);
                    }
                    let events = fire(&mut self.watches, &[Mutation::Deleted(path.clone())]);
                    (Ok(OpResult::Deleted), events)
                }
                Err(e) => (Err(e), Vec::new()),
            },

            KeeperOp::SetData {
                path,
                data,
                version,
            } => match self
                .store
                .set_data(path, data.clone(), *version, index, req.time_ms)
            {
                Ok(stat) => {
                    let events = fire(&mut self.watches, &[Mutation::DataChanged(path.clone())]);
                    (Ok(OpResult::SetData { stat }), events)
                }
                Err(e) => (Err(e), Vec::new()),
            },

            KeeperOp::Exists { path, watch } => match self.store.exists(path) {
                Err(e) => (Err(e), Vec::new()),
                Ok(found) => {
                    // An exists watch is left even on an absent node so
                    // it fires on creation
                    if *watch {
                        self.watches.register(WatchKind::Data, path, session_id);
                    }
                    match found {
                        Some(stat) => (Ok(OpResult::Stat(stat)), Vec::new()),
                        None => (Err(CoordinationError::NotFound(path.clone())), Vec::new()),
                    }
                }
            },

            KeeperOp::GetData { path, watch } => match self.store.get(path) {
                Ok((data, stat)) => {
                    if *watch {
                        self.watches.register(WatchKind::Data, path, session_id);
                    }
                    (Ok(OpResult::Data { data, stat }), Vec::new())
                }
                Err(e) => (Err(e), Vec::new()),
            },

            KeeperOp::GetChildren { path, watch } => match self.store.children(path) {
                Ok(children) => {
                    if *watch {
                        self.watches.register(WatchKind::Children, path, session_id);
                    }
                    (Ok(OpResult::Children { children }), Vec::new())
                }
                Err(e) => (Err(e), Vec::new()),
            },

            KeeperOp::Multi(ops) => self.apply_multi(index, req, ops),

            // Handled by apply_op before dispatching here
            KeeperOp::NewSession { .. } | KeeperOp::CheckSessions => (
                Err(CoordinationError::Internal(
                    "unexpected internal operation".to_string(),
                )),
                Vec::new(),
            ),
        }
    }

    /// Atomic batch: sub-operations run against scratch copies and the
    /// result is swapped in only if every one of them succeeds
    fn apply_multi(
        &mut self,
        index: u64,
        req: &RequestForSession,
        ops: &[KeeperOp],
    ) -> (ApplyOutcome, Vec<(u64, WatchEvent)>) {
        let session_id = req.session_id;
        let mut store = self.store.clone();
        let mut sessions = self.sessions.clone();
        let mut results = Vec::with_capacity(ops.len());
        let mut mutations = Vec::new();

        for op in ops {
            let result = match op {
                KeeperOp::Create {
                    path,
                    data,
                    ephemeral,
                    sequential,
                } => {
                    let owner = if *ephemeral { session_id } else { 0 };
                    match store.create(path, data.clone(), owner, *sequential, index, req.time_ms)
                    {
                        Ok((actual_path, _)) => {
                            if *ephemeral {
                                sessions.add_ephemeral(session_id, actual_path.clone());
                            }
                            mutations.push(Mutation::Created(actual_path.clone()));
                            Ok(OpResult::Created { path: actual_path })
                        }
                        Err(e) => Err(e),
                    }
                }
                KeeperOp::Delete { path, version } => match store.delete(path, *version) {
                    Ok(removed) => {
                        if removed.stat.ephemeral_owner != 0 {
                            sessions.remove_ephemeral(removed.stat.ephemeral_owner, path);
                        }
                        mutations.push(Mutation::Deleted(path.clone()));
                        Ok(OpResult::Deleted)
                    }
                    Err(e) => Err(e),
                },
                KeeperOp::SetData {
                    path,
                    data,
                    version,
                } => match store.set_data(path, data.clone(), *version, index, req.time_ms) {
                    Ok(stat) => {
                        mutations.push(Mutation::DataChanged(path.clone()));
                        Ok(OpResult::SetData { stat })
                    }
                    Err(e) => Err(e),
                },
                // Reads inside a batch never leave watches
                KeeperOp::Exists { path, .. } => match store.exists(path) {
                    Ok(Some(stat)) => Ok(OpResult::Stat(stat)),
                    Ok(None) => Err(CoordinationError::NotFound(path.clone())),
                    Err(e) => Err(e),
                },
                KeeperOp::GetData { path, .. } => store
                    .get(path)
                    .map(|(data, stat)| OpResult::Data { data, stat }),
                KeeperOp::GetChildren { path, .. } => store
                    .children(path)
                    .map(|children| OpResult::Children { children }),
                _ => Err(CoordinationError::Internal(format!(
                    "operation {} not permitted in a batch",
                    op.op_type()
                ))),
            };

            match result {
                Ok(r) => results.push(r),
                // Any failure discards the scratch state wholesale
                Err(e) => return (Err(e), Vec::new()),
            }
        }

        self.store = store;
        self.sessions = sessions;
        let events = fire(&mut self.watches, &mutations);
        (Ok(OpResult::Multi(results)), events)
    }

    /// Tear down a session: drop its watches, then delete its ephemeral
    /// nodes in sorted path order, firing watches exactly as ordinary
    /// deletes would
    fn close_session(&mut self, session_id: u64) -> Vec<(u64, WatchEvent)> {
        self.watches.drop_session(session_id);
        let mut events = Vec::new();
        if let Some(session) = self.sessions.remove(session_id) {
            for path in &session.ephemerals {
                match self.store.delete(path, -1) {
                    Ok(_) => {
                        events.extend(fire(&mut self.watches, &[Mutation::Deleted(path.clone())]));
                    }
                    Err(e) => {
                        warn!(session_id, path, "ephemeral cleanup failed: {}", e);
                    }
                }
            }
        }
        events
    }
}

/// Translate successful mutations into consumed watch registrations
fn fire(watches: &mut WatchRegistry, mutations: &[Mutation]) -> Vec<(u64, WatchEvent)> {
    let mut events = Vec::new();
    for mutation in mutations {
        match mutation {
            Mutation::Created(path) => {
                events.extend(watches.fire_data(path, EventKind::Created));
                if let Some(parent_path) = parent(path) {
                    events.extend(watches.fire_children(parent_path, EventKind::ChildrenChanged));
                }
            }
            Mutation::Deleted(path) => {
                events.extend(watches.fire_data(path, EventKind::Deleted));
                events.extend(watches.fire_children(path, EventKind::Deleted));
                if let Some(parent_path) = parent(path) {
                    events.extend(watches.fire_children(parent_path, EventKind::ChildrenChanged));
                }
            }
            Mutation::DataChanged(path) => {
                events.extend(watches.fire_data(path, EventKind::DataChanged));
            }
        }
    }
    events
}

/// State machine handle given to the Raft instance
///
/// Cheap to clone; the snapshot builder is a clone of these handles.
#[derive(Clone)]
pub struct KeeperStateMachine {
    state: Arc<RwLock<KeeperState>>,
    queue: Arc<ResponseQueue>,
    snapshots: Arc<SnapshotStore>,
}

impl KeeperStateMachine {
    /// Build the state machine, restoring the newest valid snapshot if
    /// one exists; the log after the snapshot is replayed by the
    /// consensus layer
    pub async fn new(
        snapshots: Arc<SnapshotStore>,
        queue: Arc<ResponseQueue>,
    ) -> Result<Self, StorageError<NodeId>> {
        let mut state = KeeperState::new();

        match snapshots.load_newest() {
            Ok(Some(stored)) => {
                let payload: SnapshotPayload = serde_json::from_slice(&stored.data)
                    .map_err(|e| sm_error(e, ErrorVerb::Read))?;
                state.store = payload.store;
                state.sessions = payload.sessions;
                state.last_applied = stored.meta.last_log_id;
                state.last_membership = stored.meta.last_membership.clone();
                info!(
                    last_applied = ?state.last_applied,
                    "state machine restored from snapshot"
                );
            }
            Ok(None) => {
                info!("state machine starting empty, no snapshot found");
            }
            Err(e) => return Err(sm_error(e, ErrorVerb::Read)),
        }

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            queue,
            snapshots,
        })
    }

    /// Shared view of the applied state, used by the server wrapper
    pub fn state(&self) -> Arc<RwLock<KeeperState>> {
        self.state.clone()
    }

    fn encode_payload(state: &KeeperState) -> Result<Vec<u8>, StorageError<NodeId>> {
        let payload = SnapshotPayload {
            store: state.store.clone(),
            sessions: state.sessions.clone(),
        };
        serde_json::to_vec(&payload).map_err(|e| sm_error(e, ErrorVerb::Write))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for KeeperStateMachine {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        // Hold the read side only long enough to clone; entry
        // application resumes while we serialize and write the file
        let (data, meta) = {
            let state = self.state.read().await;
            let data = Self::encode_payload(&state)?;
            let snapshot_id = format!(
                "snapshot-{}-{}",
                state.last_applied.map(|l| l.index).unwrap_or(0),
                chrono::Utc::now().timestamp_millis()
            );
            let meta = SnapshotMeta {
                last_log_id: state.last_applied,
                last_membership: state.last_membership.clone(),
                snapshot_id,
            };
            (data, meta)
        };

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        self.snapshots
            .save(&stored)
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        info!("built snapshot {} with {} bytes", meta.snapshot_id, data.len());
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for KeeperStateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let state = self.state.read().await;
        Ok((state.last_applied, state.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyOutcome>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut outcomes = Vec::new();
        let mut state = self.state.write().await;

        for entry in entries {
            let log_id = entry.log_id;
            let index = log_id.index;

            // Idempotent restart guard: never re-apply
            if let Some(last) = state.last_applied {
                if index <= last.index {
                    outcomes.push(Ok(OpResult::Noop));
                    continue;
                }
            }

            let outcome = match entry.payload {
                EntryPayload::Normal(req) => {
                    debug!(index, session_id = req.session_id, op = req.op.op_type(), "apply");
                    let (outcome, events) = state.apply_op(index, &req);

                    // Internal entries (session creation, expiry
                    // markers) have no originating connection
                    if req.session_id != 0 {
                        self.queue.push(SessionResponse::Reply {
                            session_id: req.session_id,
                            request_id: req.request_id,
                            outcome: outcome.clone(),
                        });
                    }
                    for (session_id, event) in events {
                        self.queue.push(SessionResponse::Event { session_id, event });
                    }
                    outcome
                }
                EntryPayload::Membership(membership) => {
                    state.last_membership = StoredMembership::new(Some(log_id), membership);
                    Ok(OpResult::Noop)
                }
                EntryPayload::Blank => Ok(OpResult::Noop),
            };

            // The mutation and the index advance are one unit under
            // the write lock; a snapshot can never observe one without
            // the other
            state.last_applied = Some(log_id);
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        match self.snapshots.load_newest() {
            Ok(Some(stored)) => Ok(Some(Snapshot {
                meta: stored.meta,
                snapshot: Box::new(Cursor::new(stored.data)),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(sm_error(e, ErrorVerb::Read)),
        }
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        let payload: SnapshotPayload =
            serde_json::from_slice(&data).map_err(|e| sm_error(e, ErrorVerb::Read))?;

        self.snapshots
            .save(&StoredSnapshot {
                meta: meta.clone(),
                data,
            })
            .map_err(|e| sm_error(e, ErrorVerb::Write))?;

        // Wholesale replacement: tree, sessions and last-applied move
        // together; volatile watches do not survive
        let mut state = self.state.write().await;
        state.store = payload.store;
        state.sessions = payload.sessions;
        state.watches.clear();
        state.last_applied = meta.last_log_id;
        state.last_membership = meta.last_membership.clone();

        info!("snapshot installed: {:?}", meta.snapshot_id);
        Ok(())
    }
}
