//! Session registry
//!
//! Sessions are created, refreshed and destroyed only by committed log
//! entries. The registry never reads the wall clock: its notion of
//! "now" is the largest `time_ms` observed in a committed entry, so
//! every replica reaches identical expiry decisions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use rookery_common::{CoordinationError, CoordinationResult};

/// A client's logical connection lifetime
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub timeout_ms: u64,
    /// Logical time of last activity, advanced only via committed entries
    pub last_touch_ms: u64,
    /// Absolute paths of ephemeral nodes owned by this session
    pub ephemerals: BTreeSet<String>,
}

/// Table of live sessions with deterministic id assignment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRegistry {
    sessions: BTreeMap<u64, Session>,
    /// Next id to hand out; ids are assigned at apply time so every
    /// replica agrees without extra coordination
    next_session_id: u64,
    /// Largest committed time observed so far
    last_committed_ms: u64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_session_id: 1,
            last_committed_ms: 0,
        }
    }

    /// Register a new session, returning its id
    pub fn create_session(&mut self, timeout_ms: u64, now_ms: u64) -> u64 {
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.advance(now_ms);
        self.sessions.insert(
            id,
            Session {
                timeout_ms,
                last_touch_ms: now_ms,
                ephemerals: BTreeSet::new(),
            },
        );
        id
    }

    /// Refresh a session at the given committed time
    pub fn touch(&mut self, session_id: u64, now_ms: u64) -> CoordinationResult<()> {
        self.advance(now_ms);
        match self.sessions.get_mut(&session_id) {
            Some(session) => {
                session.last_touch_ms = session.last_touch_ms.max(now_ms);
                Ok(())
            }
            None => Err(CoordinationError::SessionExpired(session_id)),
        }
    }

    /// Remove a session, returning it so the caller can delete its
    /// ephemeral nodes in deterministic order
    pub fn remove(&mut self, session_id: u64) -> Option<Session> {
        self.sessions.remove(&session_id)
    }

    pub fn contains(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn get(&self, session_id: u64) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Record ephemeral ownership
    pub fn add_ephemeral(&mut self, session_id: u64, path: String) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.ephemerals.insert(path);
        }
    }

    /// Release ephemeral ownership (node deleted explicitly)
    pub fn remove_ephemeral(&mut self, session_id: u64, path: &str) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.ephemerals.remove(path);
        }
    }

    /// Sessions whose `last_touch + timeout` has elapsed at `now_ms`
    pub fn dead_sessions(&self, now_ms: u64) -> Vec<u64> {
        self.sessions
            .iter()
            .filter(|(_, s)| now_ms.saturating_sub(s.last_touch_ms) >= s.timeout_ms)
            .map(|(id, _)| *id)
            .collect()
    }

    /// The logical clock: largest committed time observed
    pub fn last_committed_ms(&self) -> u64 {
        self.last_committed_ms
    }

    fn advance(&mut self, now_ms: u64) {
        self.last_committed_ms = self.last_committed_ms.max(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_monotonic() {
        let mut registry = SessionRegistry::new();
        let a = registry.create_session(10_000, 0);
        let b = registry.create_session(10_000, 0);
        assert!(b > a);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_touch_unknown_session_fails() {
        let mut registry = SessionRegistry::new();
        assert_eq!(
            registry.touch(7, 100),
            Err(CoordinationError::SessionExpired(7))
        );
    }

    #[test]
    fn test_expiry_is_driven_by_logical_time() {
        let mut registry = SessionRegistry::new();
        let id = registry.create_session(10_000, 1_000);

        assert!(registry.dead_sessions(5_000).is_empty());
        assert_eq!(registry.dead_sessions(11_000), vec![id]);

        // A committed touch pushes expiry out
        registry.touch(id, 8_000).unwrap();
        assert!(registry.dead_sessions(11_000).is_empty());
        assert_eq!(registry.dead_sessions(18_000), vec![id]);
    }

    #[test]
    fn test_touch_never_moves_time_backwards() {
        let mut registry = SessionRegistry::new();
        let id = registry.create_session(10_000, 5_000);
        registry.touch(id, 1_000).unwrap();
        assert_eq!(registry.get(id).unwrap().last_touch_ms, 5_000);
        assert_eq!(registry.last_committed_ms(), 5_000);
    }

    #[test]
    fn test_ephemeral_tracking() {
        let mut registry = SessionRegistry::new();
        let id = registry.create_session(10_000, 0);
        registry.add_ephemeral(id, "/locks/a".to_string());
        registry.add_ephemeral(id, "/locks/b".to_string());
        registry.remove_ephemeral(id, "/locks/a");

        let session = registry.remove(id).unwrap();
        let paths: Vec<_> = session.ephemerals.iter().cloned().collect();
        assert_eq!(paths, vec!["/locks/b"]);
        assert!(!registry.contains(id));
    }
}
