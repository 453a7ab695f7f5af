//! Lazily-expandable tree of directory watchers.
//!
//! The tree owns one [`DirectoryWatcher`] per expanded directory. All
//! mutation happens under one lock: API calls take it directly and a pump
//! task takes it for every input posted by the watchers' background work, so
//! each state change is one serialized turn.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::buffer::EventBuffer;
use crate::error::{Result, TreeError};
use crate::event::{DirectoryEvent, EntryStats, PathEvent, TreeEvent};
use crate::fs::directory::{DirectoryWatcher, Envelope, Inbox, Ready};
use crate::fs::path::{self, ROOT};
use crate::fs::watcher::{NotifyBackend, WatchBackend};

/// Tuning knobs for a [`TreeWatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeWatcherOptions {
    /// Quiet period before a batch is emitted; `None` disables batching.
    pub buffer_delay: Option<Duration>,
    /// Capacity of the broadcast channels.
    pub channel_capacity: usize,
}

impl Default for TreeWatcherOptions {
    fn default() -> Self {
        Self {
            buffer_delay: Some(Duration::from_millis(50)),
            channel_capacity: 1024,
        }
    }
}

struct TreeState {
    root: PathBuf,
    backend: Arc<dyn WatchBackend>,
    inbox: mpsc::UnboundedSender<Envelope>,
    /// Every directory listed by a watched parent.
    directories: BTreeSet<String>,
    watchers: BTreeMap<String, DirectoryWatcher>,
    events: broadcast::Sender<TreeEvent>,
    buffer: Option<EventBuffer<TreeEvent>>,
    disposed: bool,
}

pub struct TreeWatcher {
    root: PathBuf,
    state: Arc<Mutex<TreeState>>,
    events: broadcast::Sender<TreeEvent>,
    batches: Option<broadcast::Sender<Vec<TreeEvent>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TreeWatcher {
    /// Watch `root` with default options and native notifications.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(root, TreeWatcherOptions::default())
    }

    pub fn with_options(root: impl AsRef<Path>, options: TreeWatcherOptions) -> Result<Self> {
        Self::with_backend(root, options, Arc::new(NotifyBackend::new()))
    }

    /// Watch `root` with a custom notification backend.
    ///
    /// Nothing is watched until `expand(".")` is called. Must be called from
    /// within a tokio runtime.
    pub fn with_backend(
        root: impl AsRef<Path>,
        options: TreeWatcherOptions,
        backend: Arc<dyn WatchBackend>,
    ) -> Result<Self> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .map_err(|e| TreeError::InvalidRoot(format!("{}: {}", root.display(), e)))?;
        if !root.is_dir() {
            return Err(TreeError::InvalidRoot(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let capacity = options.channel_capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        let (buffer, batches) = match options.buffer_delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                let (buffer, mut rx) = EventBuffer::new(delay);
                let (batch_tx, _) = broadcast::channel(capacity);
                let forward_tx = batch_tx.clone();
                tasks.push(tokio::spawn(async move {
                    while let Some(batch) = rx.recv().await {
                        let _ = forward_tx.send(batch);
                    }
                }));
                (Some(buffer), Some(batch_tx))
            }
            None => (None, None),
        };

        let state = Arc::new(Mutex::new(TreeState {
            root: root.clone(),
            backend,
            inbox: inbox_tx,
            directories: BTreeSet::new(),
            watchers: BTreeMap::new(),
            events: events.clone(),
            buffer,
            disposed: false,
        }));
        tasks.push(tokio::spawn(run_pump(Arc::downgrade(&state), inbox_rx)));

        info!(root = %root.display(), "tree watcher created");
        Ok(Self {
            root,
            state,
            events,
            batches,
            tasks,
        })
    }

    /// Canonical absolute root directory.
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// Receive every tree event as it happens.
    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    /// Receive debounced batches of tree events. `None` when batching is off.
    pub fn subscribe_batches(&self) -> Option<broadcast::Receiver<Vec<TreeEvent>>> {
        self.batches.as_ref().map(|tx| tx.subscribe())
    }

    /// Start watching an expandable directory.
    ///
    /// `expand` is emitted before this returns; the returned handle resolves
    /// once the directory's initial scan is done.
    pub fn expand(&self, path: &str) -> Result<Ready> {
        self.state.lock().expand(&path::normalize(path))
    }

    /// Stop watching a directory and every watched directory below it.
    pub fn collapse(&self, path: &str) -> Result<()> {
        self.state.lock().collapse(&path::normalize(path))
    }

    /// Collapse a watched directory or expand an unwatched one.
    ///
    /// Returns the readiness handle when the directory was expanded.
    pub fn toggle_expansion(&self, path: &str) -> Result<Option<Ready>> {
        let path = path::normalize(path);
        let mut state = self.state.lock();
        if state.is_collapsible(&path) {
            state.collapse(&path)?;
            Ok(None)
        } else {
            state.expand(&path).map(Some)
        }
    }

    /// Expand every directory reachable from the root, waiting for each scan
    /// before looking for more. Each path is attempted at most once per call,
    /// so directories that keep failing cannot loop forever.
    pub async fn expand_all(&self) -> Result<()> {
        let mut attempted = HashSet::new();
        loop {
            let ready = {
                let mut state = self.state.lock();
                if state.disposed {
                    return Err(TreeError::Disposed);
                }
                let next = state
                    .expandable_paths()
                    .into_iter()
                    .find(|p| !attempted.contains(p));
                let Some(next) = next else {
                    return Ok(());
                };
                attempted.insert(next.clone());
                state.expand(&next)?
            };
            ready.await;
        }
    }

    pub fn is_expandable(&self, path: &str) -> bool {
        self.state.lock().is_expandable(&path::normalize(path))
    }

    pub fn is_collapsible(&self, path: &str) -> bool {
        self.state.lock().is_collapsible(&path::normalize(path))
    }

    /// Directories that can be expanded, sorted, in native separator form.
    pub fn expandables(&self) -> Vec<String> {
        native_sorted(self.state.lock().expandable_paths())
    }

    /// Watched directories, sorted, in native separator form.
    pub fn collapsibles(&self) -> Vec<String> {
        native_sorted(self.state.lock().watchers.keys().cloned().collect())
    }

    /// Watched direct children of `path`.
    pub fn collapsibles_at(&self, path: &str) -> Vec<String> {
        let state = self.state.lock();
        native_sorted(path::find_children(&path::normalize(path), state.watchers.keys()))
    }

    /// Known entries of a watched directory, by name.
    pub fn entries(&self, path: &str) -> Option<Vec<(String, EntryStats)>> {
        let state = self.state.lock();
        state.watchers.get(&path::normalize(path)).map(|watcher| {
            watcher
                .items()
                .iter()
                .map(|(name, stats)| (name.clone(), stats.clone()))
                .collect()
        })
    }

    /// Readiness of an already watched directory.
    pub fn ready(&self, path: &str) -> Option<Ready> {
        let state = self.state.lock();
        state.watchers.get(&path::normalize(path)).map(|w| w.ready())
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Collapse everything and stop accepting expansions. Idempotent.
    pub fn dispose(&self) {
        self.state.lock().dispose();
    }
}

impl Drop for TreeWatcher {
    fn drop(&mut self) {
        self.dispose();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn run_pump(state: Weak<Mutex<TreeState>>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = inbox.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        state.lock().dispatch(envelope);
    }
}

fn native_sorted(paths: Vec<String>) -> Vec<String> {
    let mut paths: Vec<String> = paths.iter().map(|p| path::to_native(p)).collect();
    paths.sort();
    paths
}

impl TreeState {
    fn is_expandable(&self, path: &str) -> bool {
        !self.disposed
            && (path == ROOT || self.directories.contains(path))
            && !self.watchers.contains_key(path)
    }

    fn is_collapsible(&self, path: &str) -> bool {
        self.watchers.contains_key(path)
    }

    fn expandable_paths(&self) -> Vec<String> {
        let root = self.is_expandable(ROOT).then(|| ROOT.to_string());
        root.into_iter()
            .chain(
                self.directories
                    .iter()
                    .filter(|p| !self.watchers.contains_key(p.as_str()))
                    .cloned(),
            )
            .collect()
    }

    fn expand(&mut self, path: &str) -> Result<Ready> {
        if self.disposed {
            return Err(TreeError::Disposed);
        }
        if !self.is_expandable(path) {
            return Err(TreeError::NotExpandable(path.to_string()));
        }

        debug!(path, "expanding");
        let inbox = Inbox::new(path, self.inbox.clone());
        let watcher = DirectoryWatcher::new(&self.root, path, self.backend.as_ref(), inbox);
        let ready = watcher.ready();
        self.watchers.insert(path.to_string(), watcher);
        self.emit(TreeEvent::Expand(PathEvent {
            path: path.to_string(),
        }));
        Ok(ready)
    }

    fn collapse(&mut self, path: &str) -> Result<()> {
        if self.disposed {
            return Err(TreeError::Disposed);
        }
        if !self.is_collapsible(path) {
            return Err(TreeError::NotCollapsible(path.to_string()));
        }
        self.collapse_watched(path);
        Ok(())
    }

    fn collapse_watched(&mut self, path: &str) {
        for child in self.watched_children(path) {
            self.collapse_watched(&child);
        }

        let Some(mut watcher) = self.watchers.remove(path) else {
            return;
        };
        debug!(path, "collapsing");
        let events = watcher.dispose();
        self.apply(path, events);
        self.emit(TreeEvent::Collapse(PathEvent {
            path: path.to_string(),
        }));
    }

    /// Watched descendants of `path` with no other watched path in between.
    fn watched_children(&self, path: &str) -> Vec<String> {
        let below: Vec<&String> = self
            .watchers
            .keys()
            .filter(|w| path::is_descendant(path, w))
            .collect();
        below
            .iter()
            .filter(|w| {
                !below
                    .iter()
                    .any(|other| path::is_descendant(other, w))
            })
            .map(|w| (*w).clone())
            .collect()
    }

    fn dispatch(&mut self, envelope: Envelope) {
        let Some(watcher) = self
            .watchers
            .get_mut(&envelope.path)
            .filter(|w| w.id() == envelope.watcher)
        else {
            trace!(path = %envelope.path, "input for collapsed watcher dropped");
            return;
        };
        let events = watcher.handle(envelope.input);
        self.apply(&envelope.path, events);
    }

    /// Record and re-emit the events of the watcher at `path`.
    fn apply(&mut self, path: &str, events: Vec<DirectoryEvent>) {
        for event in events {
            let failed = matches!(event, DirectoryEvent::Error(_));
            match &event {
                DirectoryEvent::Add(add) if add.is_directory => {
                    self.directories.insert(add.path.clone());
                }
                DirectoryEvent::Remove(remove) if remove.is_directory => {
                    self.directories.remove(&remove.path);
                }
                DirectoryEvent::Ready(_) => debug!(path, "ready"),
                _ => {}
            }
            self.emit(event.into());

            if failed && self.watchers.contains_key(path) {
                self.collapse_watched(path);
            }
        }
    }

    fn emit(&self, event: TreeEvent) {
        trace!(%event, "emit");
        if let Some(buffer) = &self.buffer {
            buffer.push(event.clone());
        }
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        if self.watchers.contains_key(ROOT) {
            self.collapse_watched(ROOT);
        }
        // Anything left is not under the root watcher; deepest first.
        let mut rest: Vec<String> = self.watchers.keys().cloned().collect();
        rest.sort_by_key(|p| std::cmp::Reverse(path::depth(p)));
        for path in rest {
            self.collapse_watched(&path);
        }
        self.directories.clear();
        self.disposed = true;
        if let Some(buffer) = &self.buffer {
            buffer.flush();
        }
        info!(root = %self.root.display(), "tree watcher disposed");
    }
}
