// Snapshot files
// Full-state snapshots tagged with the last-applied index they cover.
// On load the newest valid file wins; corrupt files are skipped so
// recovery can fall back to an older snapshot or pure log replay.

use std::path::{Path, PathBuf};

use openraft::{BasicNode, SnapshotMeta};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::types::NodeId;

/// A snapshot as stored on disk
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub meta: SnapshotMeta<NodeId, BasicNode>,
    /// Serialized state machine payload
    pub data: Vec<u8>,
}

/// Directory of snapshot files with bounded retention
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(dir: P, retain: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            retain: retain.max(1),
        }
    }

    /// Persist a snapshot, then prune files beyond the retention bound
    ///
    /// Written to a temporary name and renamed so a crash mid-write
    /// never leaves a file that shadows an older valid snapshot.
    pub fn save(&self, snapshot: &StoredSnapshot) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let index = snapshot.meta.last_log_id.map(|l| l.index).unwrap_or(0);
        let final_path = self.dir.join(format!("snapshot-{:020}.bin", index));
        let tmp_path = self.dir.join(format!("snapshot-{:020}.tmp", index));

        let bytes = serde_json::to_vec(snapshot)?;
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &final_path)?;

        info!(
            index,
            bytes = bytes.len(),
            "snapshot written to {}",
            final_path.display()
        );
        self.prune()?;
        Ok(())
    }

    /// Load the newest snapshot that still deserializes
    pub fn load_newest(&self) -> anyhow::Result<Option<StoredSnapshot>> {
        for path in self.snapshot_files()?.into_iter().rev() {
            match std::fs::read(&path) {
                Ok(bytes) => match serde_json::from_slice::<StoredSnapshot>(&bytes) {
                    Ok(snapshot) => {
                        info!("loaded snapshot {}", path.display());
                        return Ok(Some(snapshot));
                    }
                    Err(e) => {
                        warn!("skipping corrupt snapshot {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("skipping unreadable snapshot {}: {}", path.display(), e);
                }
            }
        }
        Ok(None)
    }

    /// Snapshot file paths sorted by covered index, oldest first
    fn snapshot_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.dir.exists() {
            return Ok(files);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if name.starts_with("snapshot-") && name.ends_with(".bin") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn prune(&self) -> anyhow::Result<()> {
        let files = self.snapshot_files()?;
        if files.len() <= self.retain {
            return Ok(());
        }
        for stale in &files[..files.len() - self.retain] {
            if let Err(e) = std::fs::remove_file(stale) {
                warn!("failed to prune snapshot {}: {}", stale.display(), e);
            }
        }
        Ok(())
    }
}
