//! Core types for dirsync

use std::fmt;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{SyncError, SyncResult};
use crate::sync::protocol::{ACTION_DELETED, ACTION_FILE_MODIFIED, ACTION_MOVED};

/// Separator between fields of a header frame; never allowed inside a path
pub const FIELD_SEPARATOR: char = '|';

/// A path relative to the synchronized root
///
/// Always uses `/` separators regardless of host conventions and is stored
/// without a leading separator. Parent-directory components are rejected so
/// a resolved path can never escape the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelativePath(String);

impl RelativePath {
    /// Parse a wire or user supplied path.
    ///
    /// Backslashes are normalized to `/`, a leading separator is permitted,
    /// and empty or `.` segments are dropped.
    pub fn parse(raw: &str) -> SyncResult<Self> {
        if raw.contains(FIELD_SEPARATOR) {
            return Err(SyncError::InvalidPath(format!(
                "'{}' contains the field separator",
                raw
            )));
        }

        let normalized = raw.replace('\\', "/");
        let mut segments = Vec::new();
        for segment in normalized.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(SyncError::InvalidPath(format!(
                        "'{}' escapes the sync root",
                        raw
                    )))
                }
                s => segments.push(s),
            }
        }

        if segments.is_empty() {
            return Err(SyncError::InvalidPath(format!("'{}' is empty", raw)));
        }

        Ok(Self(segments.join("/")))
    }

    /// Build a relative path from an absolute local path under `root`
    pub fn from_local(root: &Path, local: &Path) -> SyncResult<Self> {
        let stripped = local.strip_prefix(root).map_err(|_| {
            SyncError::InvalidPath(format!(
                "{} is outside of {}",
                local.display(),
                root.display()
            ))
        })?;

        let mut segments = Vec::new();
        for component in stripped.components() {
            match component {
                Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
                Component::CurDir => continue,
                _ => {
                    return Err(SyncError::InvalidPath(format!(
                        "{} is not a plain relative path",
                        stripped.display()
                    )))
                }
            }
        }

        Self::parse(&segments.join("/"))
    }

    /// Resolve this path to a local path under `root`
    pub fn resolve(&self, root: &Path) -> PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |acc, seg| acc.join(seg))
    }

    /// The path as a `/` separated string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Substrings that exclude a path from synchronization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    segments: Vec<String>,
}

impl IgnoreList {
    /// Create an ignore list from the configured substrings
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
        }
    }

    /// True if `path` contains any ignored substring
    pub fn matches(&self, path: &str) -> bool {
        self.segments.iter().any(|s| path.contains(s.as_str()))
    }
}

/// A change to the synchronized tree, exchanged between hub and peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A file was renamed or moved
    Moved {
        from: RelativePath,
        to: RelativePath,
    },
    /// A file was removed
    Deleted { path: RelativePath },
    /// A file was created or its content changed; carries the full content
    Modified { path: RelativePath, content: Bytes },
}

impl ChangeEvent {
    /// The wire action string for this event
    pub fn action(&self) -> &'static str {
        match self {
            ChangeEvent::Moved { .. } => ACTION_MOVED,
            ChangeEvent::Deleted { .. } => ACTION_DELETED,
            ChangeEvent::Modified { .. } => ACTION_FILE_MODIFIED,
        }
    }

    /// The path the debounce filter keys on (the destination for moves)
    pub fn debounce_path(&self) -> &RelativePath {
        match self {
            ChangeEvent::Moved { to, .. } => to,
            ChangeEvent::Deleted { path } => path,
            ChangeEvent::Modified { path, .. } => path,
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeEvent::Moved { from, to } => write!(f, "moved {} -> {}", from, to),
            ChangeEvent::Deleted { path } => write!(f, "deleted {}", path),
            ChangeEvent::Modified { path, content } => {
                write!(f, "modified {} ({} bytes)", path, content.len())
            }
        }
    }
}

/// Unique identifier for a live peer session
///
/// Uses ULID so ids sort by connection time in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Create a new SessionId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.to_string();
        write!(f, "session_{}", &s[s.len() - 8..])
    }
}

/// Which end of a connection a session represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Owned by the hub, one per accepted peer
    HubSide,
    /// Owned by a peer process, its single connection to the hub
    ClientSide,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::HubSide => write!(f, "hub-side"),
            SessionRole::ClientSide => write!(f, "client-side"),
        }
    }
}
