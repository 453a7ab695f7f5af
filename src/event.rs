use std::fmt;
use std::fs::Metadata;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Serialize, Serializer};

use crate::error::WatchError;

/// Type of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    /// Symlinks are never followed, so a link to a directory is not expandable.
    Symlink,
    Other,
}

/// Last-known metadata of a watched entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryStats {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl EntryStats {
    /// Build stats from `symlink_metadata` output.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        Self {
            kind,
            size: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// An entry appeared, either during the initial scan or live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddEvent {
    pub path: String,
    pub is_directory: bool,
    pub stats: EntryStats,
    pub is_initial: bool,
}

/// A previously reported entry disappeared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveEvent {
    pub path: String,
    pub is_directory: bool,
}

/// A known file changed. Never emitted for directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub path: String,
    pub stats: EntryStats,
}

/// Lifecycle notification about a watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathEvent {
    pub path: String,
}

/// A failure, either of a whole directory watch or of a single entry.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    /// Directory for watch errors, entry for child errors.
    pub path: String,
    #[serde(serialize_with = "serialize_cause")]
    pub cause: Arc<WatchError>,
}

fn serialize_cause<S: Serializer>(cause: &Arc<WatchError>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(cause)
}

/// Events emitted by a single directory watcher.
#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    Add(AddEvent),
    Remove(RemoveEvent),
    Change(ChangeEvent),
    Ready(PathEvent),
    Close(PathEvent),
    Error(ErrorEvent),
    ChildError(ErrorEvent),
}

/// Events emitted by the tree watcher: every directory event, bubbled
/// unchanged, plus expansion state changes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeEvent {
    Add(AddEvent),
    Remove(RemoveEvent),
    Change(ChangeEvent),
    Ready(PathEvent),
    Close(PathEvent),
    Error(ErrorEvent),
    ChildError(ErrorEvent),
    Expand(PathEvent),
    Collapse(PathEvent),
}

impl From<DirectoryEvent> for TreeEvent {
    fn from(event: DirectoryEvent) -> Self {
        match event {
            DirectoryEvent::Add(e) => TreeEvent::Add(e),
            DirectoryEvent::Remove(e) => TreeEvent::Remove(e),
            DirectoryEvent::Change(e) => TreeEvent::Change(e),
            DirectoryEvent::Ready(e) => TreeEvent::Ready(e),
            DirectoryEvent::Close(e) => TreeEvent::Close(e),
            DirectoryEvent::Error(e) => TreeEvent::Error(e),
            DirectoryEvent::ChildError(e) => TreeEvent::ChildError(e),
        }
    }
}

impl TreeEvent {
    /// Canonical path the event refers to.
    pub fn path(&self) -> &str {
        match self {
            TreeEvent::Add(e) => &e.path,
            TreeEvent::Remove(e) => &e.path,
            TreeEvent::Change(e) => &e.path,
            TreeEvent::Error(e) | TreeEvent::ChildError(e) => &e.path,
            TreeEvent::Ready(e)
            | TreeEvent::Close(e)
            | TreeEvent::Expand(e)
            | TreeEvent::Collapse(e) => &e.path,
        }
    }

    /// Short lowercase name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            TreeEvent::Add(_) => "add",
            TreeEvent::Remove(_) => "remove",
            TreeEvent::Change(_) => "change",
            TreeEvent::Ready(_) => "ready",
            TreeEvent::Close(_) => "close",
            TreeEvent::Error(_) => "error",
            TreeEvent::ChildError(_) => "child_error",
            TreeEvent::Expand(_) => "expand",
            TreeEvent::Collapse(_) => "collapse",
        }
    }
}

impl fmt::Display for TreeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeEvent::Add(e) => {
                let suffix = if e.is_directory { "/" } else { "" };
                let initial = if e.is_initial { " (initial)" } else { "" };
                write!(f, "add      {}{}{}", e.path, suffix, initial)
            }
            TreeEvent::Remove(e) => {
                let suffix = if e.is_directory { "/" } else { "" };
                write!(f, "remove   {}{}", e.path, suffix)
            }
            TreeEvent::Change(e) => write!(f, "change   {} ({} bytes)", e.path, e.stats.size),
            TreeEvent::Error(e) | TreeEvent::ChildError(e) => {
                write!(f, "{:<8} {}: {}", self.name(), e.path, e.cause)
            }
            _ => write!(f, "{:<8} {}", self.name(), self.path()),
        }
    }
}
