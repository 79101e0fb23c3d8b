//! Module registry.
//!
//! One [`ModuleEntry`] per identifier, owning the persistent state and the
//! currently published export. The export slot is swapped whole under a
//! short write lock by the single reload writer, so readers always observe
//! either the pre-reload or the post-reload export, never an intermediate.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hotmod_kernel::{ExportObject, ModuleId, ModuleObject, StateObject};

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Lifecycle phase of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ModulePhase {
    /// Entry exists, nothing published yet.
    #[default]
    Registered,
    /// A load/reload cycle is resolving code and releasing the previous
    /// activation.
    Loading,
    /// Waiting for an activation (possibly deferred) to complete.
    Activating,
    /// An export is published and no cycle is running.
    Active,
    /// The last cycle failed. A previously published export, if any, is
    /// still being served.
    Failed(String),
    /// Permanent unload in progress.
    Removing,
}

impl std::fmt::Display for ModulePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModulePhase::Registered => write!(f, "Registered"),
            ModulePhase::Loading => write!(f, "Loading"),
            ModulePhase::Activating => write!(f, "Activating"),
            ModulePhase::Active => write!(f, "Active"),
            ModulePhase::Failed(err) => write!(f, "Failed: {}", err),
            ModulePhase::Removing => write!(f, "Removing"),
        }
    }
}

/// Introspectable per-module bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Module identifier.
    pub id: ModuleId,
    /// Current lifecycle phase.
    pub phase: ModulePhase,
    /// Filesystem resource backing the module, if any.
    pub source_path: Option<PathBuf>,
    /// First successful load, epoch seconds.
    pub loaded_at: Option<u64>,
    /// Most recent successful reload, epoch seconds.
    pub last_reload: Option<u64>,
    /// Successful reloads since the first load.
    pub reload_count: u32,
    /// Version of the currently published export (0 = none yet).
    pub export_version: u64,
    /// Identifier of the live activation.
    pub activation_id: Option<String>,
    /// Most recent cycle error, kept until the next successful cycle.
    pub last_error: Option<String>,
}

impl ModuleInfo {
    fn new(id: ModuleId, source_path: Option<PathBuf>) -> Self {
        Self {
            id,
            phase: ModulePhase::Registered,
            source_path,
            loaded_at: None,
            last_reload: None,
            reload_count: 0,
            export_version: 0,
            activation_id: None,
            last_error: None,
        }
    }

    fn mark_published(&mut self, version: u64, activation_id: String) {
        self.phase = ModulePhase::Active;
        self.export_version = version;
        self.activation_id = Some(activation_id);
        self.last_error = None;
        if self.loaded_at.is_none() {
            self.loaded_at = Some(epoch_secs());
        } else {
            self.last_reload = Some(epoch_secs());
            self.reload_count += 1;
        }
    }

    fn mark_failed(&mut self, error: String) {
        self.phase = ModulePhase::Failed(error.clone());
        self.last_error = Some(error);
    }
}

/// Registry record for one module identifier.
///
/// Persistent state is exclusively owned here and borrowed by the active
/// implementation for the duration of one activation; the reload
/// coordinator is the only writer of the export slot.
pub struct ModuleEntry {
    id: ModuleId,
    module: RwLock<ModuleObject>,
    persistent: RwLock<Option<StateObject>>,
    export: RwLock<Option<ExportObject>>,
    version: AtomicU64,
    info: RwLock<ModuleInfo>,
    // Reload serialization: at most one worker per identifier, with a
    // pending flag coalescing updates that arrive mid-cycle.
    in_flight: AtomicBool,
    pending: AtomicBool,
}

impl ModuleEntry {
    fn new(id: ModuleId, module: ModuleObject, source_path: Option<PathBuf>) -> Self {
        let info = ModuleInfo::new(id.clone(), source_path);
        Self {
            id,
            module: RwLock::new(module),
            persistent: RwLock::new(None),
            export: RwLock::new(None),
            version: AtomicU64::new(0),
            info: RwLock::new(info),
            in_flight: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        }
    }

    /// Module identifier.
    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    /// The current implementation object.
    pub fn module(&self) -> ModuleObject {
        self.module.read().clone()
    }

    pub(crate) fn set_module(&self, module: ModuleObject) {
        *self.module.write() = module;
    }

    /// Persistent state, if initialized.
    pub fn persistent(&self) -> Option<StateObject> {
        self.persistent.read().clone()
    }

    pub(crate) fn set_persistent(&self, state: StateObject) {
        *self.persistent.write() = Some(state);
    }

    pub(crate) fn take_persistent(&self) -> Option<StateObject> {
        self.persistent.write().take()
    }

    /// The currently published export, whole or absent. Non-blocking.
    pub fn export(&self) -> Option<ExportObject> {
        self.export.read().clone()
    }

    /// Version of the published export (0 = none yet).
    pub fn export_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Atomically replace the published export. Single-writer: only the
    /// reload coordinator calls this.
    pub(crate) fn publish(&self, export: ExportObject, activation_id: String) -> u64 {
        let version = {
            let mut slot = self.export.write();
            let version = self.version.load(Ordering::Acquire) + 1;
            *slot = Some(export);
            self.version.store(version, Ordering::Release);
            version
        };
        self.info.write().mark_published(version, activation_id);
        version
    }

    pub(crate) fn set_phase(&self, phase: ModulePhase) {
        self.info.write().phase = phase;
    }

    pub(crate) fn mark_failed(&self, error: String) {
        self.info.write().mark_failed(error);
    }

    /// Snapshot of the entry's bookkeeping.
    pub fn info(&self) -> ModuleInfo {
        self.info.read().clone()
    }

    /// Queue a reload cycle. Returns true when the caller must spawn the
    /// worker (none is running); false when a running worker picked the
    /// request up.
    pub(crate) fn request_cycle(&self) -> bool {
        self.pending.store(true, Ordering::SeqCst);
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Consume one queued request.
    pub(crate) fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Release the worker slot. Returns true when a request raced in after
    /// the last [`take_pending`] and this worker reacquired the slot; the
    /// caller must then run again.
    ///
    /// [`take_pending`]: ModuleEntry::take_pending
    pub(crate) fn release_worker(&self) -> bool {
        self.in_flight.store(false, Ordering::SeqCst);
        self.pending.load(Ordering::SeqCst)
            && self
                .in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }
}

/// Registry-wide statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Registered entries.
    pub total_modules: usize,
    /// Entries with a published export.
    pub active_modules: usize,
    /// Entries whose last cycle failed.
    pub failed_modules: usize,
    /// Successful reloads across all entries.
    pub total_reloads: usize,
}

/// Identifier-keyed table of module entries.
///
/// The only broadly shared structure in the runtime; all members take short
/// non-async critical sections so consumers can query exports from
/// synchronous contexts.
#[derive(Default)]
pub struct ModuleRegistry {
    entries: RwLock<HashMap<ModuleId, Arc<ModuleEntry>>>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing entry for `id` or create one. Idempotent per
    /// identifier until [`remove`] is called; a second caller's `module`
    /// argument is ignored in favor of the existing entry.
    ///
    /// [`remove`]: ModuleRegistry::remove
    pub fn get_or_create(
        &self,
        id: ModuleId,
        module: ModuleObject,
        source_path: Option<PathBuf>,
    ) -> (Arc<ModuleEntry>, bool) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(&id) {
            return (entry.clone(), false);
        }
        info!(module = %id, "registering module");
        let entry = Arc::new(ModuleEntry::new(id.clone(), module, source_path));
        entries.insert(id, entry.clone());
        (entry, true)
    }

    /// Look up an entry.
    pub fn get(&self, id: &str) -> Option<Arc<ModuleEntry>> {
        self.entries.read().get(id).cloned()
    }

    /// Whether an entry exists for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Delete the entry, returning it for teardown.
    pub fn remove(&self, id: &str) -> Option<Arc<ModuleEntry>> {
        let entry = self.entries.write().remove(id);
        if let Some(entry) = &entry {
            debug!(module = %entry.id(), "deregistered module");
        }
        entry
    }

    /// All current entries.
    pub fn entries(&self) -> Vec<Arc<ModuleEntry>> {
        self.entries.read().values().cloned().collect()
    }

    /// Take every entry out of the registry (shutdown path).
    pub fn drain(&self) -> Vec<Arc<ModuleEntry>> {
        self.entries.write().drain().map(|(_, entry)| entry).collect()
    }

    /// The published export for `id`, if any. Non-blocking.
    pub fn export(&self, id: &str) -> Option<ExportObject> {
        self.get(id).and_then(|entry| entry.export())
    }

    /// Bookkeeping snapshot for `id`.
    pub fn info(&self, id: &str) -> Option<ModuleInfo> {
        self.get(id).map(|entry| entry.info())
    }

    /// Bookkeeping snapshots for every entry.
    pub fn list(&self) -> Vec<ModuleInfo> {
        self.entries
            .read()
            .values()
            .map(|entry| entry.info())
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> RegistryStats {
        let entries = self.entries.read();
        let mut stats = RegistryStats {
            total_modules: entries.len(),
            ..RegistryStats::default()
        };
        for entry in entries.values() {
            let info = entry.info();
            match info.phase {
                ModulePhase::Active => stats.active_modules += 1,
                ModulePhase::Failed(_) => stats.failed_modules += 1,
                _ => {}
            }
            stats.total_reloads += info.reload_count as usize;
        }
        stats
    }
}

/// Typed consumer handle over a module entry.
///
/// Cheap to clone; `exports()` reads whatever is currently published, so a
/// handle obtained before a reload transparently serves the post-reload
/// export afterwards.
pub struct ModuleHandle<E> {
    entry: Arc<ModuleEntry>,
    _export: PhantomData<fn() -> E>,
}

impl<E> Clone for ModuleHandle<E> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            _export: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for ModuleHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("id", self.entry.id())
            .field("export_version", &self.entry.export_version())
            .finish()
    }
}

impl<E: Send + Sync + 'static> ModuleHandle<E> {
    pub(crate) fn new(entry: Arc<ModuleEntry>) -> Self {
        Self {
            entry,
            _export: PhantomData,
        }
    }

    /// Module identifier.
    pub fn id(&self) -> &ModuleId {
        self.entry.id()
    }

    /// The currently published export, downcast to `E`. `None` when nothing
    /// is published or the published export has a different type.
    pub fn exports(&self) -> Option<Arc<E>> {
        self.entry
            .export()
            .and_then(|export| export.downcast::<E>().ok())
    }

    /// Version of the published export.
    pub fn export_version(&self) -> u64 {
        self.entry.export_version()
    }

    /// Bookkeeping snapshot.
    pub fn info(&self) -> ModuleInfo {
        self.entry.info()
    }
}
