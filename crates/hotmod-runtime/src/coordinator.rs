//! Reload coordination.
//!
//! Per identifier, a reload cycle walks `Loading → Activating → published`,
//! with failures retaining the previously published export. Cycles for one
//! identifier are strictly serialized: updates arriving mid-cycle coalesce
//! into a single follow-up cycle instead of interleaving. Cycles for
//! different identifiers run independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use hotmod_kernel::{
    HotSwapConfig, ModuleId, ModuleObject, ReloadEvent, ReloadStrategy, UpdateEmitter,
};

use crate::error::ReloadError;
use crate::loader::ModuleLoader;
use crate::registry::{ModuleEntry, ModulePhase, ModuleRegistry};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEBOUNCE_SWEEP: Duration = Duration::from_millis(25);

/// Orchestrates reload cycles over the registry.
pub struct ReloadCoordinator {
    inner: Arc<Inner>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<ModuleId>>>,
}

struct Inner {
    registry: Arc<ModuleRegistry>,
    loader: Arc<ModuleLoader>,
    config: HotSwapConfig,
    events: broadcast::Sender<ReloadEvent>,
    updates_tx: mpsc::UnboundedSender<ModuleId>,
    closed: AtomicBool,
}

impl ReloadCoordinator {
    /// Create a coordinator over the given registry and loader.
    pub fn new(
        registry: Arc<ModuleRegistry>,
        loader: Arc<ModuleLoader>,
        config: HotSwapConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                registry,
                loader,
                config,
                events,
                updates_tx,
                closed: AtomicBool::new(false),
            }),
            updates_rx: Mutex::new(Some(updates_rx)),
        }
    }

    /// Subscribe to reload events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ReloadEvent) {
        self.inner.emit(event);
    }

    /// Stop accepting updates and reload requests.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Request a reload of `id`. Returns once the cycle is queued; progress
    /// and outcome surface on the event stream.
    pub fn request_reload(&self, id: &str) -> Result<(), ReloadError> {
        if self.inner.is_closed() {
            return Err(ReloadError::ShuttingDown);
        }
        let entry = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| ReloadError::NotFound(ModuleId::new(id)))?;
        Inner::schedule(self.inner.clone(), entry);
        Ok(())
    }

    /// First load of a freshly created entry: initialize persistent state,
    /// activate, publish. The caller removes the entry on error.
    pub(crate) async fn initial_load(&self, entry: &Arc<ModuleEntry>) -> Result<u64, ReloadError> {
        self.inner.initial_load(entry).await
    }

    /// Spawn the update listener: watcher updates and module-emitted
    /// updates funnel through here into scheduled cycles, subject to the
    /// configured strategy.
    pub(crate) fn spawn_listener(
        &self,
        watch_rx: Option<mpsc::Receiver<ModuleId>>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let inner = self.inner.clone();
        let mut emitter_rx = self
            .updates_rx
            .lock()
            .take()
            .expect("update listener spawned twice");

        // No watcher configured: a pre-closed channel keeps the select
        // uniform; the branch disables itself on first poll.
        let mut watch_rx = watch_rx.unwrap_or_else(|| {
            let (_tx, rx) = mpsc::channel(1);
            rx
        });

        tokio::spawn(async move {
            let mut held: HashMap<ModuleId, Instant> = HashMap::new();

            loop {
                tokio::select! {
                    Some(id) = watch_rx.recv() => {
                        Inner::on_update(&inner, id, &mut held, false);
                    }

                    Some(id) = emitter_rx.recv() => {
                        Inner::on_update(&inner, id, &mut held, true);
                    }

                    _ = tokio::time::sleep(DEBOUNCE_SWEEP), if !held.is_empty() => {
                        let now = Instant::now();
                        let ready: Vec<ModuleId> = held
                            .iter()
                            .filter(|(_, deadline)| **deadline <= now)
                            .map(|(id, _)| id.clone())
                            .collect();
                        for id in ready {
                            held.remove(&id);
                            Inner::dispatch(&inner, &id);
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        debug!("update listener shutting down");
                        return;
                    }

                    else => return,
                }
            }
        });
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emitter(&self, id: &ModuleId) -> UpdateEmitter {
        UpdateEmitter::new(id.clone(), self.updates_tx.clone())
    }

    fn emit(&self, event: ReloadEvent) {
        let _ = self.events.send(event);
    }

    async fn initial_load(&self, entry: &Arc<ModuleEntry>) -> Result<u64, ReloadError> {
        let module = entry.module();
        entry.set_phase(ModulePhase::Loading);
        match self.execute_load(entry, module).await {
            Ok(version) => {
                info!(module = %entry.id(), version, "module loaded");
                self.emit(ReloadEvent::ModuleLoaded {
                    id: entry.id().clone(),
                    version,
                });
                Ok(version)
            }
            Err(err) => {
                entry.mark_failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Queue a reload cycle. Updates landing while a cycle runs coalesce
    /// into exactly one follow-up cycle (single writer per identifier).
    fn schedule(self: Arc<Self>, entry: Arc<ModuleEntry>) {
        if self.is_closed() {
            return;
        }
        if !entry.request_cycle() {
            debug!(module = %entry.id(), "reload already in flight, request coalesced");
            return;
        }

        tokio::spawn(async move {
            loop {
                while entry.take_pending() {
                    if self.is_closed() {
                        return;
                    }
                    self.run_reload_cycle(&entry).await;
                }
                if !entry.release_worker() {
                    return;
                }
            }
        });
    }

    /// One full reload cycle for `entry`.
    async fn run_reload_cycle(&self, entry: &Arc<ModuleEntry>) {
        let id = entry.id().clone();
        let started = Instant::now();

        info!(module = %id, "reloading");
        self.emit(ReloadEvent::ReloadStarted { id: id.clone() });
        entry.set_phase(ModulePhase::Loading);

        // Release the previous activation's resources. Best effort: a
        // failing deactivate is reported but never blocks delivery of the
        // new version.
        let old_module = entry.module();
        if let (Some(state), Some(export)) = (entry.persistent(), entry.export())
            && let Err(err) = self.loader.unload(&id, &old_module, state, export).await
        {
            warn!(module = %id, error = %err, "deactivate failed, continuing reload");
            self.emit(ReloadEvent::DeactivateFailed {
                id: id.clone(),
                error: err.to_string(),
            });
        }

        let module = match self.loader.resolve_latest(&id).await {
            Ok(module) => module,
            Err(err) => {
                self.fail_cycle(entry, ReloadError::Resolve(err));
                return;
            }
        };

        match self.execute_load(entry, module).await {
            Ok(version) => {
                let duration = started.elapsed();
                info!(module = %id, version, ?duration, "reload complete");
                self.emit(ReloadEvent::ReloadCompleted {
                    id,
                    version,
                    duration,
                });
            }
            Err(err) => self.fail_cycle(entry, err),
        }
    }

    /// Shared tail of first loads and reloads: ensure persistent state,
    /// activate, publish atomically.
    async fn execute_load(
        &self,
        entry: &Arc<ModuleEntry>,
        module: ModuleObject,
    ) -> Result<u64, ReloadError> {
        let id = entry.id().clone();

        if module.refresh_persistent()
            && let Some(old_state) = entry.take_persistent()
        {
            // The outgoing implementation tears down the state it created.
            let old_module = entry.module();
            if let Err(err) = self.loader.teardown(&id, &old_module, old_state).await {
                warn!(module = %id, error = %err, "persistent state teardown failed during refresh");
                self.emit(ReloadEvent::TeardownFailed {
                    id: id.clone(),
                    error: err.to_string(),
                });
            }
        }

        let state = match entry.persistent() {
            Some(state) => state,
            None => {
                let state = self.loader.init_persistent(&id, &module).await?;
                entry.set_persistent(state.clone());
                state
            }
        };

        entry.set_phase(ModulePhase::Activating);
        let outcome = self
            .loader
            .load(&id, &module, state, self.emitter(&id))
            .await?;

        // Publish point: the new implementation and export become visible
        // together; readers saw the previous export up to here.
        entry.set_module(module);
        let version = entry.publish(outcome.export, outcome.activation_id);
        Ok(version)
    }

    fn fail_cycle(&self, entry: &Arc<ModuleEntry>, err: ReloadError) {
        error!(
            module = %entry.id(),
            error = %err,
            "reload failed; previous export retained"
        );
        entry.mark_failed(err.to_string());
        self.emit(ReloadEvent::ReloadFailed {
            id: entry.id().clone(),
            error: err.to_string(),
        });
    }

    fn on_update(
        this: &Arc<Self>,
        id: ModuleId,
        held: &mut HashMap<ModuleId, Instant>,
        from_module: bool,
    ) {
        if this.is_closed() {
            return;
        }
        if from_module {
            debug!(module = %id, "module requested its own republish");
            this.emit(ReloadEvent::ExternalUpdate { id: id.clone() });
        }

        match this.config.strategy {
            ReloadStrategy::Immediate => Self::dispatch(this, &id),
            ReloadStrategy::Debounced(window) => {
                held.insert(id, Instant::now() + window);
            }
            ReloadStrategy::Manual => {
                debug!(module = %id, "update ignored (manual reload strategy)");
            }
            _ => {
                debug!(module = %id, "unhandled reload strategy, ignoring update");
            }
        }
    }

    fn dispatch(this: &Arc<Self>, id: &ModuleId) {
        match this.registry.get(id.as_str()) {
            Some(entry) => Self::schedule(this.clone(), entry),
            None => debug!(module = %id, "update for unregistered module, ignoring"),
        }
    }
}
