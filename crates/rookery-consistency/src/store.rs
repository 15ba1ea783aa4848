//! In-memory hierarchical namespace
//!
//! The store is mutated only by applying committed log entries, in
//! index order, on a single writer. Every operation is deterministic:
//! it reads nothing but its arguments and the current tree, and either
//! fully succeeds or leaves the tree untouched.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use rookery_common::{
    basename, parent, validate_path, CoordinationError, CoordinationResult, MAX_DATA_SIZE,
    SEQUENTIAL_SUFFIX_WIDTH,
};

/// Per-node metadata, modeled after the coordination stat structure
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Log index of the entry that created this node
    pub created_index: u64,
    /// Log index of the entry that last wrote this node's data
    pub modified_index: u64,
    /// Creation time, from the committed entry that created the node
    pub ctime_ms: u64,
    /// Modification time, from the committed entry that last wrote data
    pub mtime_ms: u64,
    /// Incremented on every data write
    pub version: i32,
    /// Incremented on every child add/remove
    pub cversion: i32,
    /// Owning session id for ephemeral nodes, 0 otherwise
    pub ephemeral_owner: u64,
    /// Number of direct children
    pub num_children: u32,
}

/// A single node in the namespace tree
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNode {
    pub data: Vec<u8>,
    pub stat: Stat,
    /// Counter handed out to sequential children of this node
    pub seq_counter: u64,
    /// Names (not full paths) of direct children
    pub children: BTreeSet<String>,
}

/// The namespace tree, keyed by absolute path
///
/// `BTreeMap` keeps iteration order deterministic, which matters for
/// snapshot encoding and for replica-identical behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStore {
    nodes: BTreeMap<String, DataNode>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Create an empty store holding only the root node
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), DataNode::default());
        Self { nodes }
    }

    /// Number of nodes, including the root
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Create a node under an existing parent
    ///
    /// For sequential creates the stored path is the requested path
    /// with a zero-padded suffix taken from the parent's counter; the
    /// suffix is assigned here, at apply time, never earlier. Returns
    /// the actual path and the new node's stat.
    pub fn create(
        &mut self,
        path: &str,
        data: Vec<u8>,
        ephemeral_owner: u64,
        sequential: bool,
        index: u64,
        time_ms: u64,
    ) -> CoordinationResult<(String, Stat)> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }
        if data.len() > MAX_DATA_SIZE {
            return Err(CoordinationError::DataTooLarge {
                got: data.len(),
                limit: MAX_DATA_SIZE,
            });
        }

        let parent_path = parent(path)
            .ok_or_else(|| CoordinationError::BadPath(path.to_string()))?
            .to_string();
        let seq = match self.nodes.get(&parent_path) {
            // Ephemeral nodes cannot take children; their lifetime is
            // bound to a session and their subtree would be orphaned
            Some(p) if p.stat.ephemeral_owner != 0 => {
                return Err(CoordinationError::NoParent(path.to_string()))
            }
            Some(p) => p.seq_counter,
            None => return Err(CoordinationError::NoParent(path.to_string())),
        };

        let actual_path = if sequential {
            format!("{}{:0width$}", path, seq, width = SEQUENTIAL_SUFFIX_WIDTH)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual_path) {
            return Err(CoordinationError::NodeExists(actual_path));
        }

        let stat = Stat {
            created_index: index,
            modified_index: index,
            ctime_ms: time_ms,
            mtime_ms: time_ms,
            version: 0,
            cversion: 0,
            ephemeral_owner,
            num_children: 0,
        };
        self.nodes.insert(
            actual_path.clone(),
            DataNode {
                data,
                stat: stat.clone(),
                seq_counter: 0,
                children: BTreeSet::new(),
            },
        );

        // Parent bookkeeping after the child slot is known to be free
        let child_name = basename(&actual_path).to_string();
        if let Some(p) = self.nodes.get_mut(&parent_path) {
            p.children.insert(child_name);
            p.stat.cversion += 1;
            p.stat.num_children = p.children.len() as u32;
            if sequential {
                p.seq_counter += 1;
            }
        }

        Ok((actual_path, stat))
    }

    /// Delete a node; returns the removed node so the caller can
    /// release ephemeral ownership
    pub fn delete(&mut self, path: &str, expected_version: i32) -> CoordinationResult<DataNode> {
        validate_path(path)?;
        if path == "/" {
            return Err(CoordinationError::BadPath(path.to_string()));
        }

        {
            let node = self
                .nodes
                .get(path)
                .ok_or_else(|| CoordinationError::NotFound(path.to_string()))?;
            if expected_version != -1 && expected_version != node.stat.version {
                return Err(CoordinationError::VersionMismatch {
                    path: path.to_string(),
                    expected: expected_version,
                    actual: node.stat.version,
                });
            }
            if !node.children.is_empty() {
                return Err(CoordinationError::NotEmpty(path.to_string()));
            }
        }

        let removed = self
            .nodes
            .remove(path)
            .expect("node existence checked above");

        if let Some(parent_path) = parent(path) {
            let child_name = basename(path).to_string();
            if let Some(p) = self.nodes.get_mut(parent_path) {
                p.children.remove(&child_name);
                p.stat.cversion += 1;
                p.stat.num_children = p.children.len() as u32;
            }
        }

        Ok(removed)
    }

    /// Overwrite a node's data, bumping its version
    pub fn set_data(
        &mut self,
        path: &str,
        data: Vec<u8>,
        expected_version: i32,
        index: u64,
        time_ms: u64,
    ) -> CoordinationResult<Stat> {
        validate_path(path)?;
        if data.len() > MAX_DATA_SIZE {
            return Err(CoordinationError::DataTooLarge {
                got: data.len(),
                limit: MAX_DATA_SIZE,
            });
        }

        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NotFound(path.to_string()))?;
        if expected_version != -1 && expected_version != node.stat.version {
            return Err(CoordinationError::VersionMismatch {
                path: path.to_string(),
                expected: expected_version,
                actual: node.stat.version,
            });
        }

        node.data = data;
        node.stat.version += 1;
        node.stat.modified_index = index;
        node.stat.mtime_ms = time_ms;
        Ok(node.stat.clone())
    }

    /// Data and stat of a node
    pub fn get(&self, path: &str) -> CoordinationResult<(Vec<u8>, Stat)> {
        validate_path(path)?;
        self.nodes
            .get(path)
            .map(|n| (n.data.clone(), n.stat.clone()))
            .ok_or_else(|| CoordinationError::NotFound(path.to_string()))
    }

    /// Stat of a node, `None` when absent
    pub fn exists(&self, path: &str) -> CoordinationResult<Option<Stat>> {
        validate_path(path)?;
        Ok(self.nodes.get(path).map(|n| n.stat.clone()))
    }

    /// Sorted names of a node's direct children
    pub fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        validate_path(path)?;
        self.nodes
            .get(path)
            .map(|n| n.children.iter().cloned().collect())
            .ok_or_else(|| CoordinationError::NotFound(path.to_string()))
    }

    /// Stat of the owning node, used by tests and admin views
    pub fn stat(&self, path: &str) -> Option<&Stat> {
        self.nodes.get(path).map(|n| &n.stat)
    }
}
