// Coordination requests and responses
// These are the application-level commands that go through Raft consensus

use serde::{Deserialize, Serialize};

use rookery_common::CoordinationError;

use crate::store::Stat;

/// All client-visible operations that go through consensus
///
/// Reads are proposed like writes: registering a watch is a state
/// change every replica must agree on, and funneling reads through the
/// log gives read-your-writes within a session for free.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KeeperOp {
    /// Create a node; sequential creates get their suffix at apply time
    Create {
        path: String,
        data: Vec<u8>,
        ephemeral: bool,
        sequential: bool,
    },

    /// Delete a node, guarded by an expected version (-1 skips the check)
    Delete { path: String, version: i32 },

    /// Stat a node, optionally leaving a one-shot data watch
    Exists { path: String, watch: bool },

    /// Read a node's data, optionally leaving a one-shot data watch
    GetData { path: String, watch: bool },

    /// Overwrite a node's data, guarded by an expected version
    SetData {
        path: String,
        data: Vec<u8>,
        version: i32,
    },

    /// List a node's children, optionally leaving a one-shot child watch
    GetChildren { path: String, watch: bool },

    /// Barrier: by the time the reply arrives, every earlier committed
    /// write is applied
    Sync { path: String },

    /// Atomic batch; either every sub-operation applies or none do
    Multi(Vec<KeeperOp>),

    /// Session heartbeat
    Ping,

    /// Explicit session teardown; deletes owned ephemerals
    CloseSession,

    /// Issue a new session id
    NewSession { timeout_ms: u64 },

    /// Leader-proposed marker: expire every session that is dead at
    /// this entry's committed time
    CheckSessions,
}

impl KeeperOp {
    /// Operation name for logging
    pub fn op_type(&self) -> &'static str {
        match self {
            KeeperOp::Create { .. } => "Create",
            KeeperOp::Delete { .. } => "Delete",
            KeeperOp::Exists { .. } => "Exists",
            KeeperOp::GetData { .. } => "GetData",
            KeeperOp::SetData { .. } => "SetData",
            KeeperOp::GetChildren { .. } => "GetChildren",
            KeeperOp::Sync { .. } => "Sync",
            KeeperOp::Multi(_) => "Multi",
            KeeperOp::Ping => "Ping",
            KeeperOp::CloseSession => "CloseSession",
            KeeperOp::NewSession { .. } => "NewSession",
            KeeperOp::CheckSessions => "CheckSessions",
        }
    }
}

/// Log entry payload: an operation bound to its originating session
///
/// `time_ms` is stamped by the proposing leader and is the only clock
/// the apply path is allowed to observe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestForSession {
    /// Originating session, 0 for session-creation and internal entries
    pub session_id: u64,
    /// Client-assigned request id, echoed back in the reply
    pub request_id: u64,
    /// Wall-clock capture at proposal time, committed with the entry
    pub time_ms: u64,
    pub op: KeeperOp,
}

impl RequestForSession {
    pub fn new(session_id: u64, request_id: u64, time_ms: u64, op: KeeperOp) -> Self {
        Self {
            session_id,
            request_id,
            time_ms,
            op,
        }
    }
}

/// Successful result payloads, one per operation kind
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OpResult {
    /// Membership/blank entries and other internal applies
    Noop,
    Created { path: String },
    Deleted,
    Stat(Stat),
    Data { data: Vec<u8>, stat: Stat },
    SetData { stat: Stat },
    Children { children: Vec<String> },
    Synced { path: String },
    Multi(Vec<OpResult>),
    Pong,
    SessionCreated { session_id: u64 },
    SessionClosed,
    SessionsChecked { expired: Vec<u64> },
}

/// What applying one committed entry produced
pub type ApplyOutcome = Result<OpResult, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_round_trip() {
        let req = RequestForSession::new(
            42,
            7,
            1_700_000_000_000,
            KeeperOp::Create {
                path: "/locks/lock-".to_string(),
                data: b"owner".to_vec(),
                ephemeral: true,
                sequential: true,
            },
        );

        let serialized = serde_json::to_string(&req).unwrap();
        let deserialized: RequestForSession = serde_json::from_str(&serialized).unwrap();
        assert_eq!(req, deserialized);
        assert_eq!(deserialized.op.op_type(), "Create");
    }

    #[test]
    fn test_outcome_serialization_round_trip() {
        let outcome: ApplyOutcome = Err(CoordinationError::NodeExists("/locks/a".to_string()));
        let bytes = serde_json::to_vec(&outcome).unwrap();
        let back: ApplyOutcome = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(outcome, back);
    }
}
