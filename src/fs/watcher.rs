//! Native change-notification backends.
//!
//! A directory watcher only needs a per-directory stream of "this entry
//! appeared/disappeared/changed" notifications plus a failure signal. The
//! [`WatchBackend`] trait is that contract; [`NotifyBackend`] implements it on
//! top of a single shared `notify` watcher in non-recursive mode.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::WatchError;

/// A change reported for one watched directory. Entry names are kept as the
/// OS gave them so they can be stat'ed even when they are not valid UTF-8.
#[derive(Debug)]
pub enum Notification {
    /// The entry appeared or disappeared; the backend cannot tell which.
    Renamed(OsString),
    /// The entry was created or moved in.
    Appeared(OsString),
    /// The entry was deleted or moved out.
    Disappeared(OsString),
    /// The entry's content or metadata changed.
    Modified(OsString),
    /// The watch itself broke, e.g. the directory was deleted.
    Failed(WatchError),
}

/// Callback receiving notifications for one directory. Called from the
/// backend's own thread.
pub type NotificationSink = Box<dyn Fn(Notification) + Send + Sync>;

/// Handle of an active native watch. Dropping it stops the watch.
pub trait NativeWatch: Send {}

/// Source of native change notifications.
pub trait WatchBackend: Send + Sync {
    /// Start watching the immediate entries of `dir`.
    fn watch(&self, dir: &Path, sink: NotificationSink) -> Result<Box<dyn NativeWatch>, WatchError>;
}

type SinkMap = Arc<Mutex<HashMap<PathBuf, NotificationSink>>>;

/// Backend sharing one `notify::RecommendedWatcher` between every watched
/// directory. The watcher is created lazily on the first `watch` call.
#[derive(Clone, Default)]
pub struct NotifyBackend {
    inner: Arc<NotifyInner>,
}

#[derive(Default)]
struct NotifyInner {
    watcher: Mutex<Option<RecommendedWatcher>>,
    sinks: SinkMap,
}

impl NotifyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of directories currently watched through this backend.
    pub fn watched_count(&self) -> usize {
        self.inner.sinks.lock().len()
    }
}

impl WatchBackend for NotifyBackend {
    fn watch(&self, dir: &Path, sink: NotificationSink) -> Result<Box<dyn NativeWatch>, WatchError> {
        let native_error = |source: notify::Error| WatchError::Native {
            path: dir.to_path_buf(),
            source: Box::new(source),
        };

        // Register the sink first so no early event is lost. The sink lock is
        // never held while talking to the watcher thread.
        self.inner.sinks.lock().insert(dir.to_path_buf(), sink);

        let result = {
            let mut guard = self.inner.watcher.lock();
            if guard.is_none() {
                let sinks = self.inner.sinks.clone();
                match notify::recommended_watcher(move |res: notify::Result<Event>| dispatch(&sinks, res)) {
                    Ok(watcher) => *guard = Some(watcher),
                    Err(e) => {
                        drop(guard);
                        self.inner.sinks.lock().remove(dir);
                        return Err(native_error(e));
                    }
                }
            }
            match guard.as_mut() {
                Some(watcher) => watcher.watch(dir, RecursiveMode::NonRecursive),
                None => Ok(()),
            }
        };

        if let Err(e) = result {
            self.inner.sinks.lock().remove(dir);
            return Err(native_error(e));
        }

        trace!(dir = %dir.display(), "native watch started");
        Ok(Box::new(NotifyWatch {
            dir: dir.to_path_buf(),
            inner: self.inner.clone(),
        }))
    }
}

struct NotifyWatch {
    dir: PathBuf,
    inner: Arc<NotifyInner>,
}

impl NativeWatch for NotifyWatch {}

impl Drop for NotifyWatch {
    fn drop(&mut self) {
        if let Some(watcher) = self.inner.watcher.lock().as_mut() {
            // Fails when the kernel already dropped the watch of a deleted directory.
            let _ = watcher.unwatch(&self.dir);
        }
        self.inner.sinks.lock().remove(&self.dir);
        trace!(dir = %self.dir.display(), "native watch released");
    }
}

fn dispatch(sinks: &SinkMap, result: notify::Result<Event>) {
    match result {
        Ok(event) => route(&sinks.lock(), &event),
        Err(err) => {
            if err.paths.is_empty() {
                warn!(error = %err, "native watcher error without a path");
                return;
            }
            let sinks = sinks.lock();
            for path in &err.paths {
                if let Some(sink) = sinks.get(path) {
                    sink(Notification::Failed(WatchError::Native {
                        path: path.clone(),
                        source: err.to_string().into(),
                    }));
                }
            }
        }
    }
}

/// Deliver one notify event to the sinks it concerns.
///
/// A path can matter to two sinks at once: the directory's own watcher (the
/// directory itself went away) and its parent's watcher (an entry changed).
fn route(sinks: &HashMap<PathBuf, NotificationSink>, event: &Event) {
    for (index, path) in event.paths.iter().enumerate() {
        if let Some(sink) = sinks.get(path) {
            if matches!(
                event.kind,
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
            ) {
                sink(Notification::Failed(WatchError::Vanished(path.clone())));
            }
        }

        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            continue;
        };
        let Some(sink) = sinks.get(parent) else {
            continue;
        };
        let name = name.to_os_string();

        let notification = match event.kind {
            EventKind::Create(_) => Notification::Appeared(name),
            EventKind::Remove(_) => Notification::Disappeared(name),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Notification::Disappeared(name),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Notification::Appeared(name),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if index == 0 {
                    Notification::Disappeared(name)
                } else {
                    Notification::Appeared(name)
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => Notification::Renamed(name),
            EventKind::Modify(_) | EventKind::Any => Notification::Modified(name),
            EventKind::Access(_) | EventKind::Other => continue,
        };
        trace!(?notification, dir = %parent.display(), "native notification");
        sink(notification);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::sync::mpsc;
    use std::time::Duration;

    fn recording_sinks(dirs: &[&Path]) -> (HashMap<PathBuf, NotificationSink>, mpsc::Receiver<(PathBuf, String)>) {
        let (tx, rx) = mpsc::channel();
        let mut sinks: HashMap<PathBuf, NotificationSink> = HashMap::new();
        for dir in dirs {
            let tx = tx.clone();
            let dir_buf = dir.to_path_buf();
            sinks.insert(
                dir.to_path_buf(),
                Box::new(move |n: Notification| {
                    let label = match n {
                        Notification::Renamed(name) => format!("renamed {}", name.to_string_lossy()),
                        Notification::Appeared(name) => format!("appeared {}", name.to_string_lossy()),
                        Notification::Disappeared(name) => format!("disappeared {}", name.to_string_lossy()),
                        Notification::Modified(name) => format!("modified {}", name.to_string_lossy()),
                        Notification::Failed(_) => "failed".to_string(),
                    };
                    let _ = tx.send((dir_buf.clone(), label));
                }),
            );
        }
        (sinks, rx)
    }

    fn drain(rx: &mpsc::Receiver<(PathBuf, String)>) -> Vec<(PathBuf, String)> {
        rx.try_iter().collect()
    }

    #[test]
    fn child_events_go_to_the_parent_sink() {
        let root = Path::new("/w");
        let (sinks, rx) = recording_sinks(&[root]);

        route(&sinks, &Event::new(EventKind::Create(CreateKind::File)).add_path(root.join("a.txt")));
        route(&sinks, &Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(root.join("a.txt")));
        route(&sinks, &Event::new(EventKind::Remove(RemoveKind::File)).add_path(root.join("a.txt")));

        let got: Vec<String> = drain(&rx).into_iter().map(|(_, l)| l).collect();
        assert_eq!(got, vec!["appeared a.txt", "modified a.txt", "disappeared a.txt"]);
    }

    #[test]
    fn unrelated_paths_are_ignored() {
        let root = Path::new("/w");
        let (sinks, rx) = recording_sinks(&[root]);

        route(&sinks, &Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/w/deep/a.txt")));
        route(&sinks, &Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/elsewhere/a.txt")));

        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn access_events_are_dropped() {
        let root = Path::new("/w");
        let (sinks, rx) = recording_sinks(&[root]);
        route(&sinks, &Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(root.join("a.txt")));
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn renames_are_split_by_direction() {
        let root = Path::new("/w");
        let (sinks, rx) = recording_sinks(&[root]);

        route(
            &sinks,
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(root.join("old"))
                .add_path(root.join("new")),
        );
        route(&sinks, &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any))).add_path(root.join("x")));

        let got: Vec<String> = drain(&rx).into_iter().map(|(_, l)| l).collect();
        assert_eq!(got, vec!["disappeared old", "appeared new", "renamed x"]);
    }

    #[test]
    fn removing_a_watched_directory_notifies_it_and_its_parent() {
        let root = Path::new("/w");
        let foo = root.join("foo");
        let (sinks, rx) = recording_sinks(&[root, &foo]);

        route(&sinks, &Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(foo.clone()));

        let got = drain(&rx);
        assert_eq!(
            got,
            vec![
                (foo.clone(), "failed".to_string()),
                (root.to_path_buf(), "disappeared foo".to_string()),
            ]
        );
    }

    #[test]
    fn metadata_change_on_watched_directory_is_not_a_failure() {
        let root = Path::new("/w");
        let foo = root.join("foo");
        let (sinks, rx) = recording_sinks(&[&foo]);

        route(
            &sinks,
            &Event::new(EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Any)))
                .add_path(foo.clone()),
        );
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn notify_backend_reports_created_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let backend = NotifyBackend::new();

        let (tx, rx) = mpsc::channel();
        let handle = backend
            .watch(
                &root,
                Box::new(move |n| {
                    let _ = tx.send(n);
                }),
            )
            .unwrap();
        assert_eq!(backend.watched_count(), 1);

        std::fs::write(root.join("created.txt"), "x").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while std::time::Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Notification::Appeared(name)) | Ok(Notification::Renamed(name))
                    if name == "created.txt" =>
                {
                    seen = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(seen, "no notification for created.txt");

        drop(handle);
        assert_eq!(backend.watched_count(), 0);
    }

    #[test]
    fn notify_backend_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = NotifyBackend::new();
        let missing = dir.path().join("missing");
        let result = backend.watch(&missing, Box::new(|_| {}));
        assert!(matches!(result, Err(WatchError::Native { .. })));
        assert_eq!(backend.watched_count(), 0);
    }
}
