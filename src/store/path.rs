//! Store Paths
//!
//! A store path addresses one level of the `database/table/box` hierarchy.
//! Every segment is validated on construction, so a `StorePath` can always be
//! joined onto the data root without escaping it.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

/// Maximum number of segments in a path (database, table, box)
pub const MAX_DEPTH: usize = 3;

/// Level of the hierarchy a path addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Database,
    Table,
    Box,
}

impl Level {
    /// Level for a path with `depth` segments
    pub fn from_depth(depth: usize) -> Option<Self> {
        match depth {
            1 => Some(Level::Database),
            2 => Some(Level::Table),
            3 => Some(Level::Box),
            _ => None,
        }
    }

    /// Number of segments needed to address this level
    pub fn depth(&self) -> usize {
        match self {
            Level::Database => 1,
            Level::Table => 2,
            Level::Box => 3,
        }
    }

    /// Capitalized name used in user-facing messages
    pub fn title(&self) -> &'static str {
        match self {
            Level::Database => "Database",
            Level::Table => "Table",
            Level::Box => "Box",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Database => write!(f, "database"),
            Level::Table => write!(f, "table"),
            Level::Box => write!(f, "box"),
        }
    }
}

/// Validated 1-3 segment path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// Build a path from already split segments
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();

        if segments.is_empty() {
            return Err(Error::InvalidPath("Path is empty.".into()));
        }
        if segments.len() > MAX_DEPTH {
            return Err(Error::InvalidPath(
                "Path exceeds depth of structure.".into(),
            ));
        }
        for segment in &segments {
            validate_segment(segment)?;
        }

        Ok(Self { segments })
    }

    /// Parse a slash separated path such as `/shop/orders/order1`.
    ///
    /// Leading, trailing and repeated slashes are ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        Self::from_segments(raw.split('/').filter(|s| !s.is_empty()))
    }

    /// Database path
    pub fn database(database: impl Into<String>) -> Result<Self> {
        Self::from_segments([database.into()])
    }

    /// Table path
    pub fn table(database: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        Self::from_segments([database.into(), table.into()])
    }

    /// Box path
    pub fn boxed(
        database: impl Into<String>,
        table: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        Self::from_segments([database.into(), table.into(), name.into()])
    }

    /// Number of segments
    #[inline]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Level this path addresses
    pub fn level(&self) -> Level {
        // depth is 1..=3 by construction
        match self.segments.len() {
            1 => Level::Database,
            2 => Level::Table,
            _ => Level::Box,
        }
    }

    /// Path segments
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Database segment
    pub fn database_name(&self) -> &str {
        &self.segments[0]
    }

    /// Last segment
    pub fn name(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// Parent path, `None` for a database
    pub fn parent(&self) -> Option<StorePath> {
        if self.segments.len() == 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Prefixes from the database down to (and including) this path
    pub fn ancestors(&self) -> impl Iterator<Item = StorePath> + '_ {
        (1..=self.segments.len()).map(move |depth| Self {
            segments: self.segments[..depth].to_vec(),
        })
    }

    /// True if `other` lies strictly beneath this path
    pub fn is_ancestor_of(&self, other: &StorePath) -> bool {
        other.segments.len() > self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Require this path to address a box
    pub fn require_box(&self) -> Result<()> {
        if self.level() != Level::Box {
            return Err(Error::InvalidPath(format!(
                "'{}' does not address a box.",
                self
            )));
        }
        Ok(())
    }

    /// Location of this path under a database root
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in &self.segments {
            path.push(segment);
        }
        path
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// Reject segments that could escape the data root or collide with temp files
fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::InvalidPath("Path segments must not be empty.".into()));
    }
    if segment == "." || segment == ".." {
        return Err(Error::InvalidPath(
            "Parent and current directory segments are not allowed.".into(),
        ));
    }
    if segment.starts_with('.') {
        return Err(Error::InvalidPath(format!(
            "'{}' is reserved: names may not start with '.'",
            segment
        )));
    }
    if segment.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidPath(format!(
            "'{}' contains a path separator or NUL byte",
            segment.escape_default()
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
