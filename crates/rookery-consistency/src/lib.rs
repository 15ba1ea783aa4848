//! Rookery Consistency - the Raft-replicated coordination core
//!
//! This crate provides:
//! - The hierarchical in-memory namespace (nodes, versions, sequential
//!   counters)
//! - Session tracking with deterministic, log-driven expiry
//! - One-shot watch registration and firing
//! - The Raft glue: durable log storage, the deterministic state
//!   machine, snapshot files, and the server wrapper that submits
//!   proposals and routes applied responses

#![allow(clippy::result_large_err)]

pub mod queue;
pub mod raft;
pub mod session;
pub mod store;
pub mod watch;

// Re-export commonly used types
pub use raft::types::*;

pub use raft::config::CoordinationConfig;
pub use raft::log_store::LogStore;
pub use raft::network::Router;
pub use raft::node::{KeeperNode, KeeperNodeBuilder};
pub use raft::request::{ApplyOutcome, KeeperOp, OpResult, RequestForSession};
pub use raft::snapshot::SnapshotStore;
pub use raft::state_machine::{KeeperState, KeeperStateMachine};

pub use queue::{ResponseQueue, SessionResponse};
pub use session::SessionRegistry;
pub use store::{DataNode, Stat, StateStore};
pub use watch::{EventKind, WatchEvent, WatchKind, WatchRegistry};
