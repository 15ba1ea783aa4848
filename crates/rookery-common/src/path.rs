//! Namespace path helpers
//!
//! Paths form a strict tree rooted at `/`. Components are separated
//! by single slashes, never empty, and a path never carries a
//! trailing slash (except the root itself).

use crate::error::{CoordinationError, CoordinationResult};

/// Validate a namespace path
///
/// Accepts `/` and absolute paths with non-empty components. Rejects
/// relative paths, empty components (`//`), trailing slashes and the
/// reserved `.`/`..` components.
pub fn validate_path(path: &str) -> CoordinationResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(CoordinationError::BadPath(path.to_string()));
    }
    if path.ends_with('/') {
        return Err(CoordinationError::BadPath(path.to_string()));
    }
    for component in path[1..].split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(CoordinationError::BadPath(path.to_string()));
        }
    }
    Ok(())
}

/// Parent of a path, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Final component of a path (empty for the root)
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}
