//! Lazily-expandable directory tree watcher.
//!
//! Directories are watched one level at a time: expanding a directory starts
//! a non-recursive watch on it and reports its entries, collapsing it tears
//! down that watch and every watch below it. Changes are reported as
//! [`TreeEvent`]s on a broadcast channel, optionally also in debounced batches.

pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod fs;

pub use error::{Result, TreeError, WatchError};
pub use event::{DirectoryEvent, EntryKind, EntryStats, TreeEvent};
pub use fs::directory::{DirectoryWatcher, Ready};
pub use fs::tree::{TreeWatcher, TreeWatcherOptions};
pub use fs::watcher::{NativeWatch, Notification, NotificationSink, NotifyBackend, WatchBackend};
