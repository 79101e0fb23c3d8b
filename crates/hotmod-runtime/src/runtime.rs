//! Runtime supervisor.
//!
//! [`HmrRuntime`] wires the watcher, registry, loader, and coordinator
//! together and owns process-wide lifecycle: ordered startup, the consumer
//! query surface, and bulk shutdown. Shutdown releases resources in
//! dependency order — watches first, then every live activation, then every
//! persistent state — collecting failures instead of aborting on them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use hotmod_kernel::{HotSwapConfig, ModuleId, ReloadEvent};

use crate::coordinator::ReloadCoordinator;
use crate::error::{ReloadError, ShutdownReport};
use crate::loader::ModuleLoader;
use crate::registry::{
    ModuleEntry, ModuleHandle, ModuleInfo, ModulePhase, ModuleRegistry, RegistryStats,
};
use crate::resolver::ModuleResolver;
use crate::watcher::Watch;

/// Builder for [`HmrRuntime`].
pub struct HmrRuntimeBuilder {
    resolver: Arc<dyn ModuleResolver>,
    watcher: Option<Box<dyn Watch>>,
    config: HotSwapConfig,
}

impl HmrRuntimeBuilder {
    /// Set the hot-swap configuration.
    pub fn with_config(mut self, config: HotSwapConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a change watcher. Without one the runtime only reloads on
    /// explicit [`HmrRuntime::reload`] calls — the production configuration
    /// of a server that hot-reloads in development only.
    pub fn with_watcher(mut self, watcher: Box<dyn Watch>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Build the runtime.
    pub fn build(self) -> HmrRuntime {
        let registry = Arc::new(ModuleRegistry::new());
        let loader = Arc::new(ModuleLoader::new(
            self.resolver.clone(),
            self.config.activation_timeout,
        ));
        let coordinator =
            ReloadCoordinator::new(registry.clone(), loader.clone(), self.config.clone());

        HmrRuntime {
            registry,
            loader,
            coordinator,
            resolver: self.resolver,
            watcher: Mutex::new(self.watcher),
            config: self.config,
            shutdown_tx: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

/// The hot-module-reload runtime.
///
/// One instance supervises a set of module identifiers: it loads them,
/// watches their backing resources, swaps their exports atomically on
/// change, and tears everything down in order on shutdown.
pub struct HmrRuntime {
    registry: Arc<ModuleRegistry>,
    loader: Arc<ModuleLoader>,
    coordinator: ReloadCoordinator,
    resolver: Arc<dyn ModuleResolver>,
    watcher: Mutex<Option<Box<dyn Watch>>>,
    config: HotSwapConfig,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl HmrRuntime {
    /// Start building a runtime over `resolver`.
    pub fn builder(resolver: Arc<dyn ModuleResolver>) -> HmrRuntimeBuilder {
        HmrRuntimeBuilder {
            resolver,
            watcher: None,
            config: HotSwapConfig::default(),
        }
    }

    /// Start the runtime: bring up the watcher and update listener, then
    /// load `ids` in order. Ordering matters when later modules consume
    /// exports of earlier ones.
    ///
    /// With `abort_on_start_error` set (the default) the first failing load
    /// aborts startup; otherwise failures are reported and startup
    /// continues with the remaining identifiers.
    pub async fn start(&self, ids: &[ModuleId]) -> Result<(), ReloadError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReloadError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ReloadError::AlreadyStarted);
        }

        info!("starting hmr runtime");

        let watch_rx = {
            let mut guard = self.watcher.lock();
            match guard.as_mut() {
                Some(watcher) => {
                    watcher
                        .start()
                        .map_err(|e| ReloadError::Watch(e.to_string()))?;
                    watcher.take_update_receiver()
                }
                None => None,
            }
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        self.coordinator.spawn_listener(watch_rx, shutdown_rx);

        for id in ids {
            if let Err(err) = self.import_entry(id.clone()).await {
                if self.config.abort_on_start_error {
                    error!(module = %id, error = %err, "initial load failed, aborting startup");
                    return Err(err);
                }
                error!(module = %id, error = %err, "initial load failed, continuing startup");
            }
        }

        info!(modules = self.registry.len(), "hmr runtime started");
        Ok(())
    }

    /// Load `id` now (no-op when already loaded) and return a typed handle
    /// to its published export.
    pub async fn import<E: Send + Sync + 'static>(
        &self,
        id: impl Into<ModuleId>,
    ) -> Result<ModuleHandle<E>, ReloadError> {
        let entry = self.import_entry(id.into()).await?;
        Ok(ModuleHandle::new(entry))
    }

    /// A typed handle to an already-imported module.
    pub fn handle<E: Send + Sync + 'static>(&self, id: &str) -> Option<ModuleHandle<E>> {
        self.registry.get(id).map(ModuleHandle::new)
    }

    /// The currently published export of `id`, downcast to `E`. Always
    /// non-blocking; `None` while nothing is published (or for a type
    /// mismatch).
    pub fn export<E: Send + Sync + 'static>(&self, id: &str) -> Option<Arc<E>> {
        self.registry
            .export(id)
            .and_then(|export| export.downcast::<E>().ok())
    }

    /// Request a reload of `id`, regardless of strategy. Outcome surfaces
    /// on the event stream.
    pub fn reload(&self, id: &str) -> Result<(), ReloadError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReloadError::ShuttingDown);
        }
        self.coordinator.request_reload(id)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.coordinator.subscribe()
    }

    /// Bookkeeping snapshot for `id`.
    pub fn info(&self, id: &str) -> Option<ModuleInfo> {
        self.registry.info(id)
    }

    /// Bookkeeping snapshots for every module.
    pub fn list(&self) -> Vec<ModuleInfo> {
        self.registry.list()
    }

    /// Registry-wide statistics.
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// The underlying registry.
    pub fn registry(&self) -> Arc<ModuleRegistry> {
        self.registry.clone()
    }

    /// Permanently unload `id`: stop watching it, deactivate its export,
    /// tear down its persistent state, and delete the entry. Teardown
    /// failures are reported on the event stream but do not abort the
    /// unload.
    pub async fn remove(&self, id: &str) -> Result<(), ReloadError> {
        let entry = self
            .registry
            .remove(id)
            .ok_or_else(|| ReloadError::NotFound(ModuleId::new(id)))?;

        if let Some(watcher) = self.watcher.lock().as_ref() {
            watcher.unwatch(entry.id());
        }

        entry.set_phase(ModulePhase::Removing);
        let mut report = ShutdownReport::default();
        self.deactivate_entry(&entry, &mut report).await;
        self.teardown_entry(&entry, &mut report).await;
        self.coordinator.emit(ReloadEvent::ModuleRemoved {
            id: entry.id().clone(),
        });
        info!(module = %entry.id(), "module removed");
        Ok(())
    }

    /// Shut the runtime down: release every watch, deactivate every live
    /// module, then tear down every persistent state. Best effort
    /// throughout — every module is attempted and all failures are
    /// aggregated into the returned report.
    pub async fn close_all(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.closed.swap(true, Ordering::SeqCst) {
            return report;
        }

        info!("closing hmr runtime");
        self.coordinator.close();

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.try_send(());
        }

        // Watches go first so nothing re-arms a reload mid-shutdown.
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.close_all();
        }

        let entries = self.registry.drain();

        // Deactivate every live activation, then tear down every
        // persistent state.
        for entry in &entries {
            entry.set_phase(ModulePhase::Removing);
            self.deactivate_entry(entry, &mut report).await;
        }
        for entry in &entries {
            self.teardown_entry(entry, &mut report).await;
            report.modules_closed += 1;
            self.coordinator.emit(ReloadEvent::ModuleRemoved {
                id: entry.id().clone(),
            });
        }

        if report.is_clean() {
            info!(modules = report.modules_closed, "hmr runtime closed");
        } else {
            warn!(
                modules = report.modules_closed,
                failures = report.errors.len(),
                "hmr runtime closed with teardown failures"
            );
        }
        report
    }

    async fn import_entry(&self, id: ModuleId) -> Result<Arc<ModuleEntry>, ReloadError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReloadError::ShuttingDown);
        }
        if let Some(existing) = self.registry.get(id.as_str()) {
            return Ok(existing);
        }

        let module = self.loader.resolve_latest(&id).await?;
        let source_path = self.resolver.resolve_path(&id);
        let (entry, created) = self
            .registry
            .get_or_create(id.clone(), module, source_path.clone());
        if !created {
            return Ok(entry);
        }

        if let Err(err) = self.coordinator.initial_load(&entry).await {
            // A failed first load must not leave a half-initialized entry
            // behind: tear down whatever persistent state was created, then
            // delete the registration.
            let mut report = ShutdownReport::default();
            self.teardown_entry(&entry, &mut report).await;
            self.registry.remove(id.as_str());
            return Err(err);
        }

        if let Some(path) = source_path
            && let Some(watcher) = self.watcher.lock().as_ref()
            && let Err(err) = watcher.watch(id.clone(), &path)
        {
            warn!(module = %id, error = %err, "failed to watch module source");
        }

        Ok(entry)
    }

    async fn deactivate_entry(&self, entry: &Arc<ModuleEntry>, report: &mut ShutdownReport) {
        let id = entry.id().clone();
        let module = entry.module();
        if let (Some(state), Some(export)) = (entry.persistent(), entry.export())
            && let Err(err) = self.loader.unload(&id, &module, state, export).await
        {
            warn!(module = %id, error = %err, "deactivate failed during unload");
            self.coordinator.emit(ReloadEvent::TeardownFailed {
                id: id.clone(),
                error: err.to_string(),
            });
            report.record(id, err);
        }
    }

    async fn teardown_entry(&self, entry: &Arc<ModuleEntry>, report: &mut ShutdownReport) {
        let id = entry.id().clone();
        let module = entry.module();
        if let Some(state) = entry.take_persistent()
            && let Err(err) = self.loader.teardown(&id, &module, state).await
        {
            warn!(module = %id, error = %err, "persistent state teardown failed");
            self.coordinator.emit(ReloadEvent::TeardownFailed {
                id: id.clone(),
                error: err.to_string(),
            });
            report.record(id, err);
        }
    }
}

/// Wait for a termination signal.
///
/// Unix: `SIGINT`, `SIGTERM`, `SIGQUIT`. Elsewhere: Ctrl-C. Each call
/// installs independent listeners.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Wait for a termination signal (Ctrl-C on non-unix platforms).
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
