//! Content-fingerprint file watcher.
//!
//! OS-level change events fire multiple times per logical save and on
//! metadata-only touches. [`ContentWatcher`] therefore never forwards raw
//! events: a raw event only *arms* a subscription, and after a quiet
//! debounce window the file is re-read and re-hashed. An update is emitted
//! only when the SHA-256 content fingerprint actually differs from the
//! previously recorded one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info};

use hotmod_kernel::ModuleId;

/// SHA-256 content fingerprint of a file, as a hex string.
pub fn content_fingerprint(path: &Path) -> std::io::Result<String> {
    let contents = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Quiet window between a raw change signal and the fingerprint check.
    pub debounce_window: Duration,
    /// How often armed subscriptions are swept for expired windows.
    pub sweep_interval: Duration,
    /// Poll interval for the notify fallback backend.
    pub poll_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(25),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl WatchConfig {
    /// Create a new watch config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debounce window.
    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Source of module update notifications.
///
/// The runtime treats this as a seam: production uses [`ContentWatcher`],
/// tests can drive updates by hand. A runtime built without a watcher (the
/// production configuration of the original server) only reloads on
/// explicit request.
pub trait Watch: Send + Sync {
    /// Start delivering events. Must be called from within a tokio runtime.
    fn start(&mut self) -> Result<(), notify::Error>;

    /// Watch the resource backing `id`. Replaces any existing subscription
    /// for the same resource.
    fn watch(&self, id: ModuleId, path: &Path) -> Result<(), notify::Error>;

    /// Synchronously stop watching `id`; no further updates are emitted
    /// for it.
    fn unwatch(&self, id: &ModuleId);

    /// Take the update receiver (can only be taken once).
    fn take_update_receiver(&mut self) -> Option<mpsc::Receiver<ModuleId>>;

    /// Drop every subscription and release the underlying OS watch handles.
    fn close_all(&self);
}

struct Subscription {
    id: ModuleId,
    fingerprint: Option<String>,
}

struct WatcherShared {
    /// Watched file path → subscription.
    subscriptions: Mutex<HashMap<PathBuf, Subscription>>,
    /// Armed fingerprint checks: path → deadline.
    pending: Mutex<HashMap<PathBuf, Instant>>,
    /// Parent directories registered with notify, refcounted per
    /// subscription. Directories are watched (non-recursively) instead of
    /// files so rename-over saves don't orphan the watch.
    dirs: Mutex<HashMap<PathBuf, usize>>,
}

/// Content-hash based implementation of [`Watch`].
pub struct ContentWatcher {
    config: WatchConfig,
    shared: Arc<WatcherShared>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    update_tx: mpsc::Sender<ModuleId>,
    update_rx: Option<mpsc::Receiver<ModuleId>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl ContentWatcher {
    /// Create a new content watcher. No OS resources are claimed until
    /// [`Watch::start`].
    pub fn new(config: WatchConfig) -> Self {
        let (update_tx, update_rx) = mpsc::channel(1024);

        Self {
            config,
            shared: Arc::new(WatcherShared {
                subscriptions: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                dirs: Mutex::new(HashMap::new()),
            }),
            watcher: Mutex::new(None),
            update_tx,
            update_rx: Some(update_rx),
            shutdown_tx: Mutex::new(None),
        }
    }

    fn watch_dir(&self, dir: &Path) -> Result<(), notify::Error> {
        let mut dirs = self.shared.dirs.lock();
        let count = dirs.entry(dir.to_path_buf()).or_insert(0);
        if *count == 0
            && let Some(watcher) = self.watcher.lock().as_mut()
        {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }
        *count += 1;
        Ok(())
    }

    fn unwatch_dir(&self, dir: &Path) {
        let mut dirs = self.shared.dirs.lock();
        let Some(count) = dirs.get_mut(dir) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            dirs.remove(dir);
            if let Some(watcher) = self.watcher.lock().as_mut()
                && let Err(err) = watcher.unwatch(dir)
            {
                debug!(dir = %dir.display(), error = %err, "failed to release directory watch");
            }
        }
    }

    fn spawn_sweeper(&self, mut raw_rx: mpsc::Receiver<Event>, mut shutdown_rx: mpsc::Receiver<()>) {
        let shared = self.shared.clone();
        let update_tx = self.update_tx.clone();
        let debounce = self.config.debounce_window;
        let sweep = self.config.sweep_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_event = raw_rx.recv() => {
                        let Some(event) = maybe_event else { return };
                        let deadline = Instant::now() + debounce;
                        let subscriptions = shared.subscriptions.lock();
                        let mut pending = shared.pending.lock();
                        for path in event.paths {
                            // Raw events only arm the check; the fingerprint
                            // comparison decides whether anything changed.
                            if subscriptions.contains_key(&path) {
                                pending.insert(path, deadline);
                            }
                        }
                    }

                    _ = tokio::time::sleep(sweep) => {
                        let now = Instant::now();
                        let ready: Vec<PathBuf> = {
                            let mut pending = shared.pending.lock();
                            let ready: Vec<PathBuf> = pending
                                .iter()
                                .filter(|(_, deadline)| **deadline <= now)
                                .map(|(path, _)| path.clone())
                                .collect();
                            for path in &ready {
                                pending.remove(path);
                            }
                            ready
                        };

                        for path in ready {
                            if let Some(id) = detect_update(&shared, &path) {
                                debug!(module = %id, "content changed, emitting update");
                                if update_tx.send(id).await.is_err() {
                                    debug!("update receiver dropped, stopping sweeper");
                                    return;
                                }
                            }
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        debug!("content watcher sweeper shutting down");
                        return;
                    }
                }
            }
        });
    }
}

impl Watch for ContentWatcher {
    fn start(&mut self) -> Result<(), notify::Error> {
        if self.watcher.lock().is_some() {
            return Err(notify::Error::generic("content watcher already started"));
        }

        info!("starting content watcher");

        let (raw_tx, raw_rx) = mpsc::channel(1024);
        let notify_config = NotifyConfig::default().with_poll_interval(self.config.poll_interval);

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = raw_tx.blocking_send(event);
                }
            },
            notify_config,
        )?;

        // Register directories for subscriptions added before start.
        {
            let dirs = self.shared.dirs.lock();
            for dir in dirs.keys() {
                watcher.watch(dir, RecursiveMode::NonRecursive)?;
            }
        }

        *self.watcher.lock() = Some(watcher);

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        self.spawn_sweeper(raw_rx, shutdown_rx);

        Ok(())
    }

    fn watch(&self, id: ModuleId, path: &Path) -> Result<(), notify::Error> {
        let path = path.to_path_buf();
        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();

        let replacing = self.shared.subscriptions.lock().contains_key(&path);
        if !replacing {
            self.watch_dir(&dir)?;
        }

        // Baseline fingerprint so an untouched file never produces an
        // update. An unreadable file starts with no baseline; the first
        // successful check emits.
        let fingerprint = match content_fingerprint(&path) {
            Ok(hash) => Some(hash),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "no baseline fingerprint");
                None
            }
        };

        info!(module = %id, path = %path.display(), "watching");
        self.shared
            .subscriptions
            .lock()
            .insert(path, Subscription { id, fingerprint });
        Ok(())
    }

    fn unwatch(&self, id: &ModuleId) {
        let removed = {
            let mut subscriptions = self.shared.subscriptions.lock();
            let path = subscriptions
                .iter()
                .find(|(_, sub)| &sub.id == id)
                .map(|(path, _)| path.clone());
            path.and_then(|path| subscriptions.remove(&path).map(|_| path))
        };

        let Some(path) = removed else { return };
        self.shared.pending.lock().remove(&path);
        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        self.unwatch_dir(&dir);
        info!(module = %id, path = %path.display(), "unwatched");
    }

    fn take_update_receiver(&mut self) -> Option<mpsc::Receiver<ModuleId>> {
        self.update_rx.take()
    }

    fn close_all(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.try_send(());
        }

        let had_watcher = self.watcher.lock().take().is_some();
        self.shared.subscriptions.lock().clear();
        self.shared.pending.lock().clear();
        self.shared.dirs.lock().clear();

        if had_watcher {
            info!("content watcher closed");
        }
    }
}

impl Drop for ContentWatcher {
    fn drop(&mut self) {
        // Release OS handles even if the owner never called close_all.
        self.close_all();
    }
}

fn detect_update(shared: &WatcherShared, path: &Path) -> Option<ModuleId> {
    let current = match content_fingerprint(path) {
        Ok(hash) => hash,
        Err(err) => {
            // Resource vanished or is mid-write; skip this cycle, the watch
            // stays armed for the next signal.
            debug!(path = %path.display(), error = %err, "fingerprint unavailable, skipping cycle");
            return None;
        }
    };

    let mut subscriptions = shared.subscriptions.lock();
    let subscription = subscriptions.get_mut(path)?;
    if subscription.fingerprint.as_deref() == Some(current.as_str()) {
        return None;
    }
    subscription.fingerprint = Some(current);
    Some(subscription.id.clone())
}
