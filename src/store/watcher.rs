use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use glob::Pattern;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;

use crate::protocol::{AssetChanged, AssetKey, ChangeKind, StoreError};

use super::urls::UrlBuilder;

pub type AddCallback = Arc<dyn Fn(AssetKey, &str) + Send + Sync>;
pub type DeleteCallback = Arc<dyn Fn(AssetKey) + Send + Sync>;

/// Turns raw file system events under the physical root into add/delete
/// notifications for the owning key.
///
/// Each arming of the watcher gets a new generation. Events are dispatched
/// while holding a read lock on the current generation, and re-arming takes
/// the write lock, so once [`AssetWatcher::rearm`] returns no callback can
/// run for the previous root. Callbacks must not reconfigure the physical
/// path themselves; querying [`AssetWatcher::watched_root`] is fine.
pub struct AssetWatcher {
    shared: Arc<Dispatcher>,
    state: Mutex<Option<WatchState>>,
    // Never held while waiting on the generation lock
    watched: RwLock<Option<PathBuf>>,
}

struct WatchState {
    root: PathBuf,
    // Dropping the watcher ends the OS watch
    _watcher: RecommendedWatcher,
}

struct Dispatcher {
    generation: RwLock<u64>,
    on_add: RwLock<Option<AddCallback>>,
    on_delete: RwLock<Option<DeleteCallback>>,
    urls: Arc<dyn UrlBuilder>,
    event_tx: broadcast::Sender<AssetChanged>,
}

impl AssetWatcher {
    pub fn new(urls: Arc<dyn UrlBuilder>) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            shared: Arc::new(Dispatcher {
                generation: RwLock::new(0),
                on_add: RwLock::new(None),
                on_delete: RwLock::new(None),
                urls,
                event_tx,
            }),
            state: Mutex::new(None),
            watched: RwLock::new(None),
        }
    }

    /// Receive every dispatched notification, independently of the callbacks
    pub fn subscribe(&self) -> broadcast::Receiver<AssetChanged> {
        self.shared.event_tx.subscribe()
    }

    /// Replace the add callback
    pub fn set_add_callback(&self, callback: AddCallback) {
        *self
            .shared
            .on_add
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Replace the delete callback
    pub fn set_delete_callback(&self, callback: DeleteCallback) {
        *self
            .shared
            .on_delete
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Root currently being monitored, if the OS watch is active
    pub fn watched_root(&self) -> Option<PathBuf> {
        self.watched
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_watched(&self, root: Option<PathBuf>) {
        *self.watched.write().unwrap_or_else(PoisonError::into_inner) = root;
    }

    /// Stop monitoring the current root and start monitoring `root` for files
    /// matching `pattern`. An empty root leaves the watcher idle.
    ///
    /// Failure to establish the OS watch is logged and otherwise ignored:
    /// notifications stay off until the next re-arm.
    pub fn rearm(&self, root: &Path, pattern: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = self.retire_generation();

        if let Some(old) = state.take() {
            self.set_watched(None);
            tracing::info!("Stopped watching {}", old.root.display());
        }

        if root.as_os_str().is_empty() {
            tracing::debug!("No physical path configured; change watcher idle");
            return;
        }

        match self.start(root, pattern, generation) {
            Ok(watch) => {
                tracing::info!("Watching {} for {}", root.display(), pattern);
                self.set_watched(Some(watch.root.clone()));
                *state = Some(watch);
            }
            Err(e) => tracing::warn!(
                "{}; add/delete notifications disabled until the physical path is reconfigured",
                e
            ),
        }
    }

    /// Stop monitoring without starting a new watch
    pub fn stop(&self) {
        self.rearm(Path::new(""), "");
    }

    /// Invalidate in-flight and future events of the current watch, waiting
    /// for running callbacks to finish. Returns the next generation.
    fn retire_generation(&self) -> u64 {
        let mut current = self
            .shared
            .generation
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current += 1;
        *current
    }

    fn start(&self, root: &Path, pattern: &str, generation: u64) -> Result<WatchState, StoreError> {
        let unavailable = |message: String| StoreError::WatchUnavailable {
            path: root.display().to_string(),
            message,
        };

        let pattern = Pattern::new(pattern).map_err(|e| unavailable(e.to_string()))?;
        let dispatcher = self.shared.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => dispatcher.handle_event(generation, &event, &pattern),
            Err(e) => tracing::warn!("File watch error: {}", e),
        })
        .map_err(|e| unavailable(e.to_string()))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| unavailable(e.to_string()))?;

        Ok(WatchState {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }
}

impl Dispatcher {
    fn handle_event(&self, generation: u64, event: &Event, pattern: &Pattern) {
        let current = self
            .generation
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != generation {
            tracing::trace!("Dropping event from a retired watch: {:?}", event.paths);
            return;
        }

        for (path, kind) in classify_event(event) {
            if !matches_pattern(path, pattern) {
                continue;
            }
            match AssetKey::from_file_path(path) {
                Some(key) => self.dispatch(key, kind, path),
                None => tracing::trace!("Ignoring {} outside a key directory", path.display()),
            }
        }
        drop(current);
    }

    fn dispatch(&self, key: AssetKey, kind: ChangeKind, path: &Path) {
        let url = match kind {
            ChangeKind::Deleted => {
                let callback = self
                    .on_delete
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(callback) = callback {
                    callback(key);
                }
                None
            }
            ChangeKind::Added => {
                let url = self.urls.build_asset_url(&key);
                let callback = self
                    .on_add
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(callback) = callback {
                    callback(key, &url);
                }
                Some(url)
            }
        };
        tracing::debug!("Asset {} {:?} ({})", key, kind, path.display());

        // No subscribers is fine
        let _ = self.event_tx.send(AssetChanged {
            key,
            kind,
            url,
            path: path.display().to_string(),
            observed_at: Utc::now(),
        });
    }
}

/// Creation and deletion carried by a raw event, one entry per affected path
fn classify_event(event: &Event) -> Vec<(&Path, ChangeKind)> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Added,
        EventKind::Remove(_) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Added,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            return event
                .paths
                .iter()
                .map(|path| {
                    let kind = if path.exists() {
                        ChangeKind::Added
                    } else {
                        ChangeKind::Deleted
                    };
                    (path.as_path(), kind)
                })
                .collect();
        }
        // Backends that pair renames also report each side separately
        _ => return Vec::new(),
    };
    event.paths.iter().map(|path| (path.as_path(), kind)).collect()
}

fn matches_pattern(path: &Path, pattern: &Pattern) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| pattern.matches(name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn watcher() -> AssetWatcher {
        AssetWatcher::new(Arc::new(|key: &AssetKey| format!("/assets/{}/bundle.css", key)))
    }

    fn css_pattern() -> Pattern {
        Pattern::new("*.css").unwrap()
    }

    fn event(kind: EventKind, path: PathBuf) -> Event {
        Event::new(kind).add_path(path)
    }

    fn key_file(key: &AssetKey) -> PathBuf {
        PathBuf::from("/srv/assets")
            .join(key.to_string())
            .join("bundle.css")
    }

    fn current_generation(watcher: &AssetWatcher) -> u64 {
        *watcher.shared.generation.read().unwrap()
    }

    fn recording_add(watcher: &AssetWatcher) -> Arc<Mutex<Vec<(AssetKey, String)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        watcher.set_add_callback(Arc::new(move |key: AssetKey, url: &str| {
            sink.lock().unwrap().push((key, url.to_string()));
        }));
        seen
    }

    fn recording_delete(watcher: &AssetWatcher) -> Arc<Mutex<Vec<AssetKey>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        watcher.set_delete_callback(Arc::new(move |key: AssetKey| {
            sink.lock().unwrap().push(key)
        }));
        seen
    }

    #[test]
    fn test_create_in_key_directory_invokes_add_once_with_url() {
        let watcher = watcher();
        let added = recording_add(&watcher);
        let key = AssetKey::parse("3fa85f64-5717-4562-b3fc-2c963f66afa6").unwrap();

        watcher.shared.handle_event(
            current_generation(&watcher),
            &event(EventKind::Create(CreateKind::File), key_file(&key)),
            &css_pattern(),
        );

        let added = added.lock().unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0, key);
        assert_eq!(
            added[0].1,
            "/assets/3fa85f64-5717-4562-b3fc-2c963f66afa6/bundle.css"
        );
    }

    #[test]
    fn test_uppercase_key_directory_is_ignored() {
        let watcher = watcher();
        let added = recording_add(&watcher);
        let deleted = recording_delete(&watcher);
        let generation = current_generation(&watcher);
        let file = PathBuf::from("/srv/assets")
            .join("3FA85F64-5717-4562-B3FC-2C963F66AFA6")
            .join("bundle.css");

        watcher.shared.handle_event(
            generation,
            &event(EventKind::Create(CreateKind::File), file.clone()),
            &css_pattern(),
        );
        watcher.shared.handle_event(
            generation,
            &event(EventKind::Remove(RemoveKind::File), file),
            &css_pattern(),
        );

        assert!(added.lock().unwrap().is_empty());
        assert!(deleted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_create_outside_key_directory_is_ignored() {
        let watcher = watcher();
        let added = recording_add(&watcher);

        watcher.shared.handle_event(
            current_generation(&watcher),
            &event(
                EventKind::Create(CreateKind::File),
                PathBuf::from("/srv/assets/not-a-guid/file.css"),
            ),
            &css_pattern(),
        );

        assert!(added.lock().unwrap().is_empty());
    }

    #[test]
    fn test_non_matching_files_are_ignored() {
        let watcher = watcher();
        let added = recording_add(&watcher);
        let key = AssetKey::new();
        let temp_file = PathBuf::from("/srv/assets")
            .join(key.to_string())
            .join(".tmpA1b2C3");

        watcher.shared.handle_event(
            current_generation(&watcher),
            &event(EventKind::Create(CreateKind::File), temp_file),
            &css_pattern(),
        );

        assert!(added.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_invokes_delete_callback() {
        let watcher = watcher();
        let deleted = recording_delete(&watcher);
        let added = recording_add(&watcher);
        let key = AssetKey::new();

        watcher.shared.handle_event(
            current_generation(&watcher),
            &event(EventKind::Remove(RemoveKind::File), key_file(&key)),
            &css_pattern(),
        );

        assert_eq!(*deleted.lock().unwrap(), vec![key]);
        assert!(added.lock().unwrap().is_empty());
    }

    #[test]
    fn test_renames_map_to_add_and_delete() {
        let watcher = watcher();
        let added = recording_add(&watcher);
        let deleted = recording_delete(&watcher);
        let key = AssetKey::new();
        let generation = current_generation(&watcher);

        watcher.shared.handle_event(
            generation,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::To)),
                key_file(&key),
            ),
            &css_pattern(),
        );
        watcher.shared.handle_event(
            generation,
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                key_file(&key),
            ),
            &css_pattern(),
        );
        watcher.shared.handle_event(
            generation,
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(key_file(&key))
                .add_path(key_file(&AssetKey::new())),
            &css_pattern(),
        );

        assert_eq!(added.lock().unwrap().len(), 1);
        assert_eq!(*deleted.lock().unwrap(), vec![key]);
    }

    #[test]
    fn test_content_modifications_are_ignored() {
        let watcher = watcher();
        let added = recording_add(&watcher);
        let deleted = recording_delete(&watcher);

        watcher.shared.handle_event(
            current_generation(&watcher),
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                key_file(&AssetKey::new()),
            ),
            &css_pattern(),
        );

        assert!(added.lock().unwrap().is_empty());
        assert!(deleted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_repeated_events_are_not_deduplicated() {
        let watcher = watcher();
        let added = recording_add(&watcher);
        let key = AssetKey::new();
        let generation = current_generation(&watcher);

        for _ in 0..3 {
            watcher.shared.handle_event(
                generation,
                &event(EventKind::Create(CreateKind::File), key_file(&key)),
                &css_pattern(),
            );
        }

        assert_eq!(added.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_registering_replaces_previous_callback() {
        let watcher = watcher();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        {
            let first = first.clone();
            watcher.set_delete_callback(Arc::new(move |_: AssetKey| {
                first.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let second = second.clone();
            watcher.set_delete_callback(Arc::new(move |_: AssetKey| {
                second.fetch_add(1, Ordering::SeqCst);
            }));
        }

        watcher.shared.handle_event(
            current_generation(&watcher),
            &event(EventKind::Remove(RemoveKind::File), key_file(&AssetKey::new())),
            &css_pattern(),
        );

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_events_from_retired_generation_are_dropped() {
        let watcher = watcher();
        let added = recording_add(&watcher);
        let stale = current_generation(&watcher);

        watcher.stop();
        watcher.shared.handle_event(
            stale,
            &event(EventKind::Create(CreateKind::File), key_file(&AssetKey::new())),
            &css_pattern(),
        );

        assert!(added.lock().unwrap().is_empty());
        assert_eq!(watcher.watched_root(), None);
    }

    #[test]
    fn test_dispatch_is_published_on_broadcast_feed() {
        let watcher = watcher();
        let mut rx = watcher.subscribe();
        let key = AssetKey::new();

        watcher.shared.handle_event(
            current_generation(&watcher),
            &event(EventKind::Create(CreateKind::File), key_file(&key)),
            &css_pattern(),
        );

        let change = rx.try_recv().unwrap();
        assert_eq!(change.key, key);
        assert_eq!(change.kind, ChangeKind::Added);
        assert_eq!(change.url, Some(format!("/assets/{}/bundle.css", key)));
    }

    #[test]
    fn test_missing_root_leaves_watcher_unarmed() {
        let watcher = watcher();
        let temp = tempfile::TempDir::new().unwrap();

        watcher.rearm(&temp.path().join("does-not-exist"), "*.css");
        assert_eq!(watcher.watched_root(), None);

        watcher.rearm(temp.path(), "*.css");
        assert_eq!(watcher.watched_root(), Some(temp.path().to_path_buf()));
    }

    #[test]
    fn test_callback_can_query_root_while_rearm_waits() {
        let watcher = Arc::new(watcher());
        let temp = tempfile::TempDir::new().unwrap();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let entered_tx = Mutex::new(entered_tx);
        let done_tx = Mutex::new(done_tx);
        let observer = Arc::downgrade(&watcher);
        watcher.set_add_callback(Arc::new(move |_: AssetKey, _: &str| {
            entered_tx.lock().unwrap().send(()).unwrap();
            // Give the re-arm below time to block on this dispatch
            thread::sleep(Duration::from_millis(200));
            let root = observer.upgrade().and_then(|w| w.watched_root());
            done_tx.lock().unwrap().send(root).unwrap();
        }));

        let generation = current_generation(&watcher);
        let dispatching = {
            let watcher = watcher.clone();
            thread::spawn(move || {
                watcher.shared.handle_event(
                    generation,
                    &event(EventKind::Create(CreateKind::File), key_file(&AssetKey::new())),
                    &css_pattern(),
                );
            })
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let rearming = {
            let watcher = watcher.clone();
            let root = temp.path().to_path_buf();
            thread::spawn(move || watcher.rearm(&root, "*.css"))
        };

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        dispatching.join().unwrap();
        rearming.join().unwrap();
        assert_eq!(watcher.watched_root(), Some(temp.path().to_path_buf()));
    }
}
