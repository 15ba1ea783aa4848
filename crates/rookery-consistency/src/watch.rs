//! One-shot watch registry
//!
//! A watch is a (session, path, kind) registration consumed by the
//! first matching mutation. Registration and firing both happen inside
//! the deterministic apply step, so every replica agrees on which
//! watches exist; delivery is filtered to locally-connected sessions
//! by the response queue.
//!
//! Watches are volatile: they are not part of snapshots, and clients
//! re-register after a restore.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// What a watch is listening for
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WatchKind {
    /// Set by `exists`/`get_data`: node creation, deletion, data change
    Data,
    /// Set by `get_children`: child-list change, node deletion
    Children,
}

/// The mutation kind carried in a fired watch event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
}

/// A fired notification handed to the response queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub path: String,
}

/// Registrations indexed by path and by session
#[derive(Clone, Debug, Default)]
pub struct WatchRegistry {
    data_watches: HashMap<String, BTreeSet<u64>>,
    child_watches: HashMap<String, BTreeSet<u64>>,
    by_session: HashMap<u64, BTreeSet<(WatchKind, String)>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: WatchKind, path: &str, session_id: u64) {
        let index = match kind {
            WatchKind::Data => &mut self.data_watches,
            WatchKind::Children => &mut self.child_watches,
        };
        index.entry(path.to_string()).or_default().insert(session_id);
        self.by_session
            .entry(session_id)
            .or_default()
            .insert((kind, path.to_string()));
    }

    /// Consume data watches on `path`, emitting `kind` to each watcher
    pub fn fire_data(&mut self, path: &str, kind: EventKind) -> Vec<(u64, WatchEvent)> {
        self.consume(WatchKind::Data, path, kind)
    }

    /// Consume child watches on `path`, emitting `kind` to each watcher
    pub fn fire_children(&mut self, path: &str, kind: EventKind) -> Vec<(u64, WatchEvent)> {
        self.consume(WatchKind::Children, path, kind)
    }

    /// Drop every registration held by a session (session closed)
    pub fn drop_session(&mut self, session_id: u64) {
        if let Some(entries) = self.by_session.remove(&session_id) {
            for (kind, path) in entries {
                let index = match kind {
                    WatchKind::Data => &mut self.data_watches,
                    WatchKind::Children => &mut self.child_watches,
                };
                if let Some(sessions) = index.get_mut(&path) {
                    sessions.remove(&session_id);
                    if sessions.is_empty() {
                        index.remove(&path);
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data_watches.is_empty() && self.child_watches.is_empty()
    }

    /// Reset all registrations (snapshot install)
    pub fn clear(&mut self) {
        self.data_watches.clear();
        self.child_watches.clear();
        self.by_session.clear();
    }

    fn consume(&mut self, kind: WatchKind, path: &str, event: EventKind) -> Vec<(u64, WatchEvent)> {
        let index = match kind {
            WatchKind::Data => &mut self.data_watches,
            WatchKind::Children => &mut self.child_watches,
        };
        let Some(sessions) = index.remove(path) else {
            return Vec::new();
        };
        let mut fired = Vec::with_capacity(sessions.len());
        for session_id in sessions {
            if let Some(entries) = self.by_session.get_mut(&session_id) {
                entries.remove(&(kind, path.to_string()));
                if entries.is_empty() {
                    self.by_session.remove(&session_id);
                }
            }
            fired.push((
                session_id,
                WatchEvent {
                    kind: event,
                    path: path.to_string(),
                },
            ));
        }
        fired
    }
}
