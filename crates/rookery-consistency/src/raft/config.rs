// Coordination service configuration
// Raft timing, session timeout bounds, snapshot thresholds and data
// directory layout for one replica

use std::path::PathBuf;
use std::time::Duration;

use rookery_common::{MAX_SESSION_TIMEOUT_MS, MIN_SESSION_TIMEOUT_MS};

/// Configuration for a coordination replica
#[derive(Clone, Debug)]
pub struct CoordinationConfig {
    /// Election timeout in milliseconds (default: 5000ms)
    pub election_timeout_ms: u64,

    /// Heartbeat interval in milliseconds (default: 1000ms)
    pub heartbeat_interval_ms: u64,

    /// Number of applied entries since the last snapshot before a new
    /// snapshot is taken (default: 10000)
    pub snapshot_threshold: u64,

    /// Snapshot files retained on disk; older ones are pruned
    pub snapshots_to_retain: usize,

    /// How often the leader scans for dead sessions (default: 500ms)
    pub session_check_interval_ms: u64,

    /// Lower bound applied to requested session timeouts
    pub min_session_timeout_ms: u64,

    /// Upper bound applied to requested session timeouts
    pub max_session_timeout_ms: u64,

    /// Maximum entries per append request (default: 300)
    pub max_payload_entries: u64,

    /// Data directory for log and snapshot storage
    pub data_dir: PathBuf,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
            snapshot_threshold: 10_000,
            snapshots_to_retain: 3,
            session_check_interval_ms: 500,
            min_session_timeout_ms: MIN_SESSION_TIMEOUT_MS,
            max_session_timeout_ms: MAX_SESSION_TIMEOUT_MS,
            max_payload_entries: 300,
            data_dir: PathBuf::from("./data/rookery"),
        }
    }
}

impl CoordinationConfig {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn session_check_interval(&self) -> Duration {
        Duration::from_millis(self.session_check_interval_ms)
    }

    /// Clamp a requested session timeout into the configured bounds
    pub fn clamp_session_timeout(&self, timeout_ms: u64) -> u64 {
        timeout_ms.clamp(self.min_session_timeout_ms, self.max_session_timeout_ms)
    }

    /// Directory for the replicated log store
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Directory for snapshot files
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Ensure all data directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.log_dir())?;
        std::fs::create_dir_all(self.snapshot_dir())?;
        Ok(())
    }

    /// Convert to the consensus library's configuration
    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: "rookery".to_string(),
            election_timeout_min: self.election_timeout_ms,
            election_timeout_max: self.election_timeout_ms * 2,
            heartbeat_interval: self.heartbeat_interval_ms,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_payload_entries: self.max_payload_entries,
            ..Default::default()
        }
    }
}
