use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, TreeError>;

/// Errors returned by tree watcher operations.
///
/// The `NotExpandable`, `NotCollapsible` and `Disposed` variants are caller
/// mistakes; runtime filesystem failures never surface here, they arrive as
/// `error` / `child_error` events instead.
#[derive(Debug, Error)]
pub enum TreeError {
    /// I/O errors while setting up the watcher.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The root handed to the tree watcher is not a usable directory.
    #[error("Invalid root: {0}")]
    InvalidRoot(String),

    /// `expand` on a path that is unknown or already watched.
    #[error("The directory '{0}' is not expandable")]
    NotExpandable(String),

    /// `collapse` on a path that is not watched.
    #[error("The directory '{0}' is not collapsible")]
    NotCollapsible(String),

    /// Any operation after `dispose`.
    #[error("The tree watcher has been disposed")]
    Disposed,
}

/// Runtime failures reported through watcher events.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Reading the directory listing failed.
    #[error("failed to list {}: {source}", .path.display())]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading metadata for a single entry failed.
    #[error("failed to stat {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The native change-notification layer failed.
    #[error("failed to watch {}: {source}", .path.display())]
    Native {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The watched directory was deleted or moved away.
    #[error("watched directory {} is no longer available", .0.display())]
    Vanished(PathBuf),
}
