//! Single-directory watcher.
//!
//! A [`DirectoryWatcher`] keeps the last-known stats of the immediate entries
//! of one directory. It never blocks: listing and stat calls run as spawned
//! tasks that post their results back through an [`Inbox`], and the owner
//! feeds every [`Input`] into [`DirectoryWatcher::handle`] one at a time. The
//! returned events are the watcher's whole output.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::future::{Future, IntoFuture};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::WatchError;
use crate::event::{
    AddEvent, ChangeEvent, DirectoryEvent, EntryStats, ErrorEvent, PathEvent, RemoveEvent,
};
use crate::fs::path;
use crate::fs::watcher::{NativeWatch, Notification, WatchBackend};

/// Identity of one watcher instance. A path that is collapsed and expanded
/// again gets a new id, so late results for the old instance can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

impl WatcherId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        WatcherId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Why a stat was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatPurpose {
    Initial,
    Added,
    Modified,
}

/// Work results and notifications delivered back to a watcher.
#[derive(Debug)]
pub enum Input {
    Listing(Result<Vec<OsString>, WatchError>),
    Stat {
        name: String,
        ticket: u64,
        purpose: StatPurpose,
        result: Result<EntryStats, WatchError>,
    },
    Native(Notification),
}

/// An [`Input`] addressed to one watcher instance.
#[derive(Debug)]
pub struct Envelope {
    pub watcher: WatcherId,
    pub path: String,
    pub input: Input,
}

/// Sending half used by a watcher's background tasks and native sink.
#[derive(Debug, Clone)]
pub struct Inbox {
    id: WatcherId,
    path: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Inbox {
    pub fn new(path: &str, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            id: WatcherId::next(),
            path: path.to_string(),
            tx,
        }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// Post an input. Dropped silently once the owner is gone.
    pub fn post(&self, input: Input) {
        let _ = self.tx.send(Envelope {
            watcher: self.id,
            path: self.path.clone(),
            input,
        });
    }
}

/// Resolves once the directory has finished its initial scan, or was
/// disposed before finishing.
#[derive(Debug, Clone)]
pub struct Ready {
    rx: watch::Receiver<bool>,
}

impl Ready {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(mut self) {
        // An error means the watcher is gone, which also ends the wait.
        let _ = self.rx.wait_for(|ready| *ready).await;
    }
}

impl IntoFuture for Ready {
    type Output = ();
    type IntoFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Waiting for the directory listing.
    Listing,
    /// Waiting for `remaining` initial stats.
    Scanning { remaining: usize },
    Ready,
    /// The watch broke; inert until disposed.
    Failed,
    Closed,
}

pub struct DirectoryWatcher {
    path: String,
    abs_path: PathBuf,
    inbox: Inbox,
    items: BTreeMap<String, EntryStats>,
    state: ScanState,
    native: Option<Box<dyn NativeWatch>>,
    ready_tx: watch::Sender<bool>,
    next_ticket: u64,
    in_flight: HashMap<String, usize>,
    removed_at: HashMap<String, u64>,
}

impl DirectoryWatcher {
    /// Start watching `path` (canonical, relative to `root`).
    ///
    /// The native watch is registered before the listing is requested, so
    /// changes racing the initial scan are not lost. Must be called from
    /// within a tokio runtime.
    pub fn new(root: &Path, path: &str, backend: &dyn WatchBackend, inbox: Inbox) -> Self {
        let abs_path = path::resolve(root, path);
        let (ready_tx, _) = watch::channel(false);

        let sink_inbox = inbox.clone();
        let native = match backend.watch(
            &abs_path,
            Box::new(move |notification| sink_inbox.post(Input::Native(notification))),
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(path, error = %e, "could not watch directory");
                inbox.post(Input::Native(Notification::Failed(e)));
                None
            }
        };

        let list_inbox = inbox.clone();
        let list_path = abs_path.clone();
        tokio::spawn(async move {
            list_inbox.post(Input::Listing(list(&list_path).await));
        });

        debug!(path, "directory watcher started");
        Self {
            path: path.to_string(),
            abs_path,
            inbox,
            items: BTreeMap::new(),
            state: ScanState::Listing,
            native,
            ready_tx,
            next_ticket: 0,
            in_flight: HashMap::new(),
            removed_at: HashMap::new(),
        }
    }

    pub fn id(&self) -> WatcherId {
        self.inbox.id()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn ready(&self) -> Ready {
        Ready {
            rx: self.ready_tx.subscribe(),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state == ScanState::Closed
    }

    /// Known entries by name with their last-known stats.
    pub fn items(&self) -> &BTreeMap<String, EntryStats> {
        &self.items
    }

    /// Apply one input and return the events it produced.
    pub fn handle(&mut self, input: Input) -> Vec<DirectoryEvent> {
        let mut events = Vec::new();
        if matches!(self.state, ScanState::Failed | ScanState::Closed) {
            trace!(path = %self.path, ?input, "input for inactive watcher dropped");
            return events;
        }

        match input {
            Input::Listing(Ok(names)) => self.start_scan(names, &mut events),
            Input::Listing(Err(e)) => self.fail(e, &mut events),
            Input::Stat {
                name,
                ticket,
                purpose,
                result,
            } => self.resolve_stat(name, ticket, purpose, result, &mut events),
            Input::Native(notification) => self.notify(notification, &mut events),
        }
        events
    }

    /// Shut the watcher down. Emits `ready` if the scan never finished, a
    /// `remove` for every known entry, then `close`. Idempotent.
    pub fn dispose(&mut self) -> Vec<DirectoryEvent> {
        let mut events = Vec::new();
        if self.state == ScanState::Closed {
            return events;
        }

        self.mark_ready(&mut events);
        for (name, stats) in std::mem::take(&mut self.items) {
            events.push(DirectoryEvent::Remove(RemoveEvent {
                path: path::join(&self.path, &name),
                is_directory: stats.is_directory(),
            }));
        }
        events.push(DirectoryEvent::Close(PathEvent {
            path: self.path.clone(),
        }));

        self.state = ScanState::Closed;
        self.native = None;
        self.in_flight.clear();
        self.removed_at.clear();
        debug!(path = %self.path, "directory watcher closed");
        events
    }

    fn start_scan(&mut self, names: Vec<OsString>, events: &mut Vec<DirectoryEvent>) {
        if self.state != ScanState::Listing {
            return;
        }
        trace!(path = %self.path, count = names.len(), "listing received");
        if names.is_empty() {
            self.state = ScanState::Ready;
            self.mark_ready(events);
            return;
        }

        self.state = ScanState::Scanning {
            remaining: names.len(),
        };
        for name in names {
            self.request_stat(&name, StatPurpose::Initial);
        }
    }

    /// Entries are keyed by their lossy UTF-8 name but stat'ed by the raw one.
    fn request_stat(&mut self, raw: &OsStr, purpose: StatPurpose) {
        let name = raw.to_string_lossy().into_owned();
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        *self.in_flight.entry(name.clone()).or_default() += 1;

        let inbox = self.inbox.clone();
        let abs = self.abs_path.join(raw);
        tokio::spawn(async move {
            let result = tokio::fs::symlink_metadata(&abs)
                .await
                .map(|metadata| EntryStats::from_metadata(&metadata))
                .map_err(|source| WatchError::Stat { path: abs, source });
            inbox.post(Input::Stat {
                name,
                ticket,
                purpose,
                result,
            });
        });
    }

    fn resolve_stat(
        &mut self,
        name: String,
        ticket: u64,
        purpose: StatPurpose,
        result: Result<EntryStats, WatchError>,
        events: &mut Vec<DirectoryEvent>,
    ) {
        let still_pending = match self.in_flight.get_mut(&name) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        // Requested before a later removal of the same name.
        let stale = self
            .removed_at
            .get(&name)
            .is_some_and(|&removed| removed > ticket);
        if still_pending == 0 {
            self.in_flight.remove(&name);
            self.removed_at.remove(&name);
        }

        match result {
            Ok(_) if stale => trace!(path = %self.path, name = %name, "stale stat discarded"),
            Ok(stats) => self.apply_stats(name, stats, purpose, events),
            // Another stat for this name is still out; it decides.
            Err(_) if stale || still_pending > 0 => {}
            Err(e) => {
                debug!(path = %self.path, name = %name, error = %e, "stat failed");
                events.push(DirectoryEvent::ChildError(ErrorEvent {
                    path: path::join(&self.path, &name),
                    cause: Arc::new(e),
                }));
            }
        }

        if purpose == StatPurpose::Initial {
            if let ScanState::Scanning { remaining } = &mut self.state {
                *remaining -= 1;
                if *remaining == 0 {
                    self.state = ScanState::Ready;
                    self.mark_ready(events);
                }
            }
        }
    }

    fn apply_stats(
        &mut self,
        name: String,
        stats: EntryStats,
        purpose: StatPurpose,
        events: &mut Vec<DirectoryEvent>,
    ) {
        let entry_path = path::join(&self.path, &name);
        let previous = self.items.insert(name, stats.clone());

        match previous {
            None => events.push(DirectoryEvent::Add(AddEvent {
                path: entry_path,
                is_directory: stats.is_directory(),
                stats,
                is_initial: purpose == StatPurpose::Initial,
            })),
            // Replaced by an entry of the other kind under the same name.
            Some(old) if old.is_directory() != stats.is_directory() => {
                events.push(DirectoryEvent::Remove(RemoveEvent {
                    path: entry_path.clone(),
                    is_directory: old.is_directory(),
                }));
                events.push(DirectoryEvent::Add(AddEvent {
                    path: entry_path,
                    is_directory: stats.is_directory(),
                    stats,
                    is_initial: false,
                }));
            }
            Some(_) if purpose == StatPurpose::Modified && !stats.is_directory() => {
                events.push(DirectoryEvent::Change(ChangeEvent {
                    path: entry_path,
                    stats,
                }));
            }
            Some(_) => {}
        }
    }

    fn notify(&mut self, notification: Notification, events: &mut Vec<DirectoryEvent>) {
        match notification {
            Notification::Renamed(raw) => {
                let name = raw.to_string_lossy();
                if self.items.contains_key(name.as_ref()) {
                    self.remove_item(&name, events);
                } else {
                    self.request_stat(&raw, StatPurpose::Added);
                }
            }
            Notification::Appeared(raw) => self.request_stat(&raw, StatPurpose::Added),
            Notification::Disappeared(raw) => {
                let name = raw.to_string_lossy();
                if self.items.contains_key(name.as_ref()) {
                    self.remove_item(&name, events);
                } else {
                    self.invalidate(&name);
                }
            }
            Notification::Modified(raw) => self.request_stat(&raw, StatPurpose::Modified),
            Notification::Failed(e) => self.fail(e, events),
        }
    }

    fn remove_item(&mut self, name: &str, events: &mut Vec<DirectoryEvent>) {
        self.invalidate(name);
        if let Some(stats) = self.items.remove(name) {
            events.push(DirectoryEvent::Remove(RemoveEvent {
                path: path::join(&self.path, name),
                is_directory: stats.is_directory(),
            }));
        }
    }

    /// Make every stat of `name` requested so far stale.
    fn invalidate(&mut self, name: &str) {
        if self.in_flight.contains_key(name) {
            self.removed_at.insert(name.to_string(), self.next_ticket);
            self.next_ticket += 1;
        }
    }

    fn fail(&mut self, cause: WatchError, events: &mut Vec<DirectoryEvent>) {
        warn!(path = %self.path, error = %cause, "directory watch failed");
        for (name, stats) in std::mem::take(&mut self.items) {
            events.push(DirectoryEvent::Remove(RemoveEvent {
                path: path::join(&self.path, &name),
                is_directory: stats.is_directory(),
            }));
        }
        events.push(DirectoryEvent::Error(ErrorEvent {
            path: self.path.clone(),
            cause: Arc::new(cause),
        }));
        self.state = ScanState::Failed;
        self.native = None;
    }

    fn mark_ready(&mut self, events: &mut Vec<DirectoryEvent>) {
        if !*self.ready_tx.borrow() {
            self.ready_tx.send_replace(true);
            events.push(DirectoryEvent::Ready(PathEvent {
                path: self.path.clone(),
            }));
        }
    }
}

async fn list(dir: &Path) -> Result<Vec<OsString>, WatchError> {
    let err = |source| WatchError::List {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(err)?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(err)? {
        names.push(entry.file_name());
    }
    Ok(names)
}
