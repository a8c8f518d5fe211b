//! Path Resolver
//!
//! Answers "does this database/table/box exist?" and, when it does not, names
//! the highest missing level: a missing table under a box path is reported as
//! `table`, never `box`.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::journal::{PendingIndex, PendingState};
use super::path::{Level, StorePath};

/// Existence verdict for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Every level of the path exists
    Exists,
    /// The given level is the first one missing
    NotFound(Level),
}

impl Resolution {
    /// Returns true if the path exists
    pub fn exists(&self) -> bool {
        matches!(self, Resolution::Exists)
    }

    /// Diagnostic message for 404 responses
    pub fn message(&self) -> Option<String> {
        match self {
            Resolution::Exists => None,
            Resolution::NotFound(level) => Some(Error::NotFound(*level).to_string()),
        }
    }

    /// Convert to `Ok(())` or `Err(NotFound)`
    pub fn into_result(self) -> Result<()> {
        match self {
            Resolution::Exists => Ok(()),
            Resolution::NotFound(level) => Err(Error::NotFound(level)),
        }
    }
}

/// Resolves store paths against the on-disk namespace
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Create a resolver over a database root directory (`<data>/db`)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Database root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate raw segments and resolve them against the disk
    pub fn resolve_segments<S: AsRef<str>>(&self, segments: &[S]) -> Result<Resolution> {
        let path = StorePath::from_segments(segments.iter().map(|s| s.as_ref().to_string()))?;
        Ok(self.resolve(&path))
    }

    /// Resolve against the disk only
    pub fn resolve(&self, path: &StorePath) -> Resolution {
        for prefix in path.ancestors() {
            if !self.exists_on_disk(&prefix) {
                return Resolution::NotFound(prefix.level());
            }
        }
        Resolution::Exists
    }

    /// Resolve against the disk with enqueued-but-unapplied mutations layered on top.
    ///
    /// A pending write makes a level exist and a pending delete makes it
    /// missing. Below a container that is being re-created after a pending
    /// delete, the disk no longer tells the truth, so unlisted children are
    /// treated as missing.
    pub fn resolve_pending(&self, path: &StorePath, pending: &PendingIndex) -> Resolution {
        let mut recreated_above = false;

        for prefix in path.ancestors() {
            match pending.get(&prefix) {
                Some(PendingState::Present { recreated, .. }) => {
                    recreated_above |= recreated;
                }
                Some(PendingState::Absent { .. }) => {
                    return Resolution::NotFound(prefix.level());
                }
                None => {
                    if recreated_above || !self.exists_on_disk(&prefix) {
                        return Resolution::NotFound(prefix.level());
                    }
                }
            }
        }
        Resolution::Exists
    }

    fn exists_on_disk(&self, path: &StorePath) -> bool {
        let fs_path = path.to_fs_path(&self.root);
        match path.level() {
            Level::Box => fs_path.is_file(),
            Level::Database | Level::Table => fs_path.is_dir(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn fixture() -> (tempfile::TempDir, PathResolver) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("shop/orders")).unwrap();
        std::fs::write(dir.path().join("shop/orders/order1"), b"{}").unwrap();
        let resolver = PathResolver::new(dir.path());
        (dir, resolver)
    }

    fn path(raw: &str) -> StorePath {
        StorePath::parse(raw).unwrap()
    }

    #[test]
    fn test_resolve_existing() {
        let (_dir, resolver) = fixture();
        assert!(resolver.resolve(&path("shop")).exists());
        assert!(resolver.resolve(&path("shop/orders")).exists());
        assert!(resolver.resolve(&path("shop/orders/order1")).exists());
    }

    #[test]
    fn test_most_specific_missing_level() {
        let (_dir, resolver) = fixture();
        assert_eq!(
            resolver.resolve(&path("shop/orders/order2")),
            Resolution::NotFound(Level::Box)
        );
        assert_eq!(
            resolver.resolve(&path("shop/customers/c1")),
            Resolution::NotFound(Level::Table)
        );
        assert_eq!(
            resolver.resolve(&path("mall/orders/order1")),
            Resolution::NotFound(Level::Database)
        );
        assert_eq!(
            resolver.resolve(&path("shop/customers/c1")).message().unwrap(),
            "Table does not exist."
        );
    }

    #[test]
    fn test_kind_mismatch_is_missing() {
        let (_dir, resolver) = fixture();
        // a directory is not a box, a file is not a table
        std::fs::write(resolver.root().join("shop/notes"), b"x").unwrap();
        assert_eq!(
            resolver.resolve(&path("shop/notes")),
            Resolution::NotFound(Level::Table)
        );
        std::fs::create_dir(resolver.root().join("shop/orders/dir")).unwrap();
        assert_eq!(
            resolver.resolve(&path("shop/orders/dir")),
            Resolution::NotFound(Level::Box)
        );
    }

    #[test]
    fn test_resolve_segments_validates() {
        let (_dir, resolver) = fixture();
        assert_matches!(
            resolver.resolve_segments(&["a", "b", "c", "d"]),
            Err(Error::InvalidPath(_))
        );
        assert_matches!(
            resolver.resolve_segments(&["shop", ".."]),
            Err(Error::InvalidPath(_))
        );
        assert_eq!(
            resolver.resolve_segments(&["shop", "orders"]).unwrap(),
            Resolution::Exists
        );
    }

    #[test]
    fn test_pending_write_and_delete() {
        let (_dir, resolver) = fixture();
        let mut pending = PendingIndex::default();

        pending.record_write(&path("mall"), 1);
        pending.record_write(&path("mall/stock"), 2);
        assert!(resolver
            .resolve_pending(&path("mall/stock"), &pending)
            .exists());
        assert_eq!(
            resolver.resolve_pending(&path("mall/stock/item"), &pending),
            Resolution::NotFound(Level::Box)
        );

        pending.record_delete(&path("shop/orders"), 3);
        assert_eq!(
            resolver.resolve_pending(&path("shop/orders/order1"), &pending),
            Resolution::NotFound(Level::Table)
        );
        assert!(resolver.resolve_pending(&path("shop"), &pending).exists());
    }

    #[test]
    fn test_recreated_container_hides_disk_children() {
        let (_dir, resolver) = fixture();
        let mut pending = PendingIndex::default();

        pending.record_delete(&path("shop/orders"), 1);
        pending.record_write(&path("shop/orders"), 2);

        assert!(resolver
            .resolve_pending(&path("shop/orders"), &pending)
            .exists());
        // order1 is still on disk but will be wiped by the pending delete
        assert_eq!(
            resolver.resolve_pending(&path("shop/orders/order1"), &pending),
            Resolution::NotFound(Level::Box)
        );

        pending.record_write(&path("shop/orders/order1"), 3);
        assert!(resolver
            .resolve_pending(&path("shop/orders/order1"), &pending)
            .exists());
    }
}
