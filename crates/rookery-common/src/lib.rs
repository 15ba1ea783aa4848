//! Rookery Common - Shared types for the coordination core
//!
//! This crate provides the foundational pieces used across Rookery
//! components:
//! - The client-facing error taxonomy
//! - Namespace path validation and manipulation
//! - Protocol-level limits

pub mod error;
pub mod path;

// Re-exports for convenience
pub use error::{CoordinationError, CoordinationResult};
pub use path::{basename, parent, validate_path};

/// Maximum size of a node's data payload in bytes (1 MiB)
pub const MAX_DATA_SIZE: usize = 1024 * 1024;

/// Lower bound for a session timeout in milliseconds
pub const MIN_SESSION_TIMEOUT_MS: u64 = 1_000;

/// Upper bound for a session timeout in milliseconds
pub const MAX_SESSION_TIMEOUT_MS: u64 = 100_000;

/// Width of the numeric suffix appended to sequential node names
pub const SEQUENTIAL_SUFFIX_WIDTH: usize = 10;
