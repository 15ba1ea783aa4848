//! Response queue
//!
//! The ordered hand-off from the state machine back to the network
//! layer. Every replica applies every committed entry and offers the
//! produced response here; only the replica holding the client's
//! subscription delivers it, the rest discard.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::raft::request::ApplyOutcome;
use crate::watch::WatchEvent;

/// What the state machine hands back for a session
#[derive(Clone, Debug)]
pub enum SessionResponse {
    /// Reply to a specific client request
    Reply {
        session_id: u64,
        request_id: u64,
        outcome: ApplyOutcome,
    },
    /// A fired one-shot watch notification
    Event { session_id: u64, event: WatchEvent },
}

impl SessionResponse {
    pub fn session_id(&self) -> u64 {
        match self {
            SessionResponse::Reply { session_id, .. } => *session_id,
            SessionResponse::Event { session_id, .. } => *session_id,
        }
    }
}

/// Per-session outbound channels, keyed by originating session
#[derive(Debug, Default)]
pub struct ResponseQueue {
    subscribers: DashMap<u64, mpsc::UnboundedSender<SessionResponse>>,
}

impl ResponseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the local connection for a session. Replaces any prior
    /// subscription (client reconnect).
    pub fn subscribe(&self, session_id: u64) -> mpsc::UnboundedReceiver<SessionResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(session_id, tx);
        rx
    }

    /// Detach a session's connection
    pub fn unsubscribe(&self, session_id: u64) {
        self.subscribers.remove(&session_id);
    }

    /// Offer a response; silently discarded when the session is not
    /// connected to this replica
    pub fn push(&self, response: SessionResponse) {
        let session_id = response.session_id();
        let delivered = match self.subscribers.get(&session_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        };
        if !delivered {
            debug!(session_id, "response discarded, session not local");
            self.subscribers.remove(&session_id);
        }
    }

    /// Drop every subscription, releasing blocked readers (shutdown)
    pub fn close_all(&self) {
        self.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
