//! Shared fixtures for the hotmod integration suite.
//!
//! [`ScriptedModule`] is a hot module whose lifecycle behavior is chosen
//! per test; every instance produced by a factory shares one [`Recorder`]
//! so tests can assert hook counts, activation overlap, and persistent
//! state identity across reloads.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast};

use hotmod_kernel::{
    Activation, HotModule, HotSwapConfig, ModuleError, ModuleResult, ReloadEvent, UpdateEmitter,
};
use hotmod_runtime::{HmrRuntime, StaticResolver};

/// Persistent state carried across reloads: a plain counter the export
/// handler reads.
#[derive(Debug, Default)]
pub struct Counter {
    /// Current count; mutated only by tests, never by reloads.
    pub count: AtomicU64,
}

/// Export published by the scripted modules.
pub struct RouterExport {
    /// Human label of the build that produced this export.
    pub label: String,
    /// Build number; the label is always `"v{version}"` so readers can
    /// check an export is internally consistent.
    pub version: u64,
    handler: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl RouterExport {
    /// Serve one request.
    pub fn handle(&self) -> u64 {
        (self.handler)()
    }
}

/// What a scripted activation should do.
#[derive(Clone)]
pub enum Behavior {
    /// Activate synchronously.
    Ready,
    /// Fail the activation.
    FailActivate,
    /// Activate fine, but fail the matching deactivate.
    FailDeactivate,
    /// Defer the export by a fixed delay.
    Deferred(Duration),
    /// Defer the export until the semaphore yields a permit.
    Gated(Arc<Semaphore>),
    /// Activate synchronously, then request a single self-republish.
    SelfUpdating(Duration),
}

/// Probe shared by every module instance a test's factories produce.
#[derive(Default)]
pub struct Recorder {
    pub inits: AtomicU32,
    pub activations: AtomicU32,
    pub deactivations: AtomicU32,
    pub teardowns: AtomicU32,
    concurrent: AtomicU32,
    pub max_concurrent: AtomicU32,
    state_ptrs: Mutex<Vec<usize>>,
    pub log: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter_activation(&self, label: &str, state: &Arc<Counter>) {
        self.activations.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        self.state_ptrs.lock().push(Arc::as_ptr(state) as usize);
        self.log.lock().push(format!("activate:{label}:start"));
    }

    fn exit_activation(&self, label: &str) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().push(format!("activate:{label}:end"));
    }

    /// True when every activation observed the same persistent state
    /// object (referential identity, not equality).
    pub fn state_was_stable(&self) -> bool {
        let ptrs = self.state_ptrs.lock();
        ptrs.windows(2).all(|pair| pair[0] == pair[1])
    }

    /// True when no activation span overlapped another.
    pub fn activations_were_sequential(&self) -> bool {
        let mut depth = 0i32;
        for line in self.log.lock().iter() {
            if line.starts_with("activate:") {
                if line.ends_with(":start") {
                    depth += 1;
                    if depth > 1 {
                        return false;
                    }
                } else if line.ends_with(":end") {
                    depth -= 1;
                }
            }
        }
        true
    }
}

fn make_export(label: &str, version: u64, state: Arc<Counter>) -> RouterExport {
    RouterExport {
        label: label.to_string(),
        version,
        handler: Box::new(move || state.count.load(Ordering::SeqCst)),
    }
}

/// A module whose lifecycle is scripted per test.
pub struct ScriptedModule {
    pub label: String,
    pub version: u64,
    pub behavior: Behavior,
    pub recorder: Arc<Recorder>,
}

#[async_trait::async_trait]
impl HotModule for ScriptedModule {
    type Persistent = Counter;
    type Export = RouterExport;

    async fn init_persistent(&self) -> ModuleResult<Self::Persistent> {
        self.recorder.inits.fetch_add(1, Ordering::SeqCst);
        Ok(Counter::default())
    }

    async fn activate(
        &self,
        state: Arc<Self::Persistent>,
        updates: UpdateEmitter,
    ) -> ModuleResult<Activation<Self::Export>> {
        let recorder = self.recorder.clone();
        recorder.enter_activation(&self.label, &state);

        match &self.behavior {
            Behavior::FailActivate => {
                recorder.exit_activation(&self.label);
                Err(ModuleError::ActivationFailed(format!(
                    "{} refused to activate",
                    self.label
                )))
            }

            Behavior::Ready | Behavior::FailDeactivate => {
                let export = make_export(&self.label, self.version, state);
                recorder.exit_activation(&self.label);
                Ok(Activation::ready(export))
            }

            Behavior::SelfUpdating(after) => {
                let export = make_export(&self.label, self.version, state);
                recorder.exit_activation(&self.label);

                // One republish request, from the first activation only.
                if recorder.activations.load(Ordering::SeqCst) == 1 {
                    let after = *after;
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        updates.emit();
                    });
                }
                Ok(Activation::ready(export))
            }

            Behavior::Deferred(delay) => {
                let delay = *delay;
                let label = self.label.clone();
                let version = self.version;
                Ok(Activation::deferred(async move {
                    tokio::time::sleep(delay).await;
                    let export = make_export(&label, version, state);
                    recorder.exit_activation(&label);
                    Ok(export)
                }))
            }

            Behavior::Gated(gate) => {
                let gate = gate.clone();
                let label = self.label.clone();
                let version = self.version;
                Ok(Activation::deferred(async move {
                    let _permit = gate.acquire().await.map_err(|_| {
                        ModuleError::ActivationFailed("activation gate closed".to_string())
                    })?;
                    let export = make_export(&label, version, state);
                    recorder.exit_activation(&label);
                    Ok(export)
                }))
            }
        }
    }

    async fn deactivate(
        &self,
        _state: Arc<Self::Persistent>,
        export: Arc<Self::Export>,
    ) -> ModuleResult<()> {
        self.recorder.deactivations.fetch_add(1, Ordering::SeqCst);
        self.recorder
            .log
            .lock()
            .push(format!("deactivate:{}", export.label));
        if matches!(self.behavior, Behavior::FailDeactivate) {
            return Err(ModuleError::DeactivationFailed(format!(
                "{} cleanup failed",
                self.label
            )));
        }
        Ok(())
    }

    async fn teardown_persistent(&self, _state: Arc<Self::Persistent>) -> ModuleResult<()> {
        self.recorder.teardowns.fetch_add(1, Ordering::SeqCst);
        self.recorder.log.lock().push("teardown".to_string());
        Ok(())
    }
}

/// A module whose export is the current content of a file — the smallest
/// useful model of a "router read from source on every reload".
pub struct FileBackedModule {
    pub source: PathBuf,
    pub recorder: Arc<Recorder>,
}

#[async_trait::async_trait]
impl HotModule for FileBackedModule {
    type Persistent = Counter;
    type Export = RouterExport;

    async fn init_persistent(&self) -> ModuleResult<Self::Persistent> {
        self.recorder.inits.fetch_add(1, Ordering::SeqCst);
        Ok(Counter::default())
    }

    async fn activate(
        &self,
        state: Arc<Self::Persistent>,
        _updates: UpdateEmitter,
    ) -> ModuleResult<Activation<Self::Export>> {
        let content = tokio::fs::read_to_string(&self.source).await?;
        let label = content.trim().to_string();
        self.recorder.enter_activation(&label, &state);
        let version = self.recorder.activations.load(Ordering::SeqCst) as u64;
        // Unlike the scripted handler, this one counts hits, so tests can
        // prove the counter rides across file-driven reloads.
        let export = RouterExport {
            label: label.clone(),
            version,
            handler: Box::new(move || state.count.fetch_add(1, Ordering::SeqCst) + 1),
        };
        self.recorder.exit_activation(&label);
        Ok(Activation::ready(export))
    }
}

/// A resolver + runtime pair wired with one shared recorder.
pub struct TestBed {
    pub resolver: Arc<StaticResolver>,
    pub runtime: Arc<HmrRuntime>,
    pub recorder: Arc<Recorder>,
}

impl TestBed {
    /// Runtime with default configuration and no watcher.
    pub fn new() -> Self {
        Self::with_config(HotSwapConfig::default())
    }

    /// Runtime with explicit configuration and no watcher.
    pub fn with_config(config: HotSwapConfig) -> Self {
        let resolver = Arc::new(StaticResolver::new());
        let runtime = Arc::new(
            HmrRuntime::builder(resolver.clone())
                .with_config(config)
                .build(),
        );
        Self {
            resolver,
            runtime,
            recorder: Recorder::new(),
        }
    }

    /// Install (or replace) the factory for `id`; every produced instance
    /// reports into this bed's recorder.
    pub fn install(&self, id: &str, label: &str, version: u64, behavior: Behavior) {
        let recorder = self.recorder.clone();
        let label = label.to_string();
        self.resolver.register(id, move || ScriptedModule {
            label: label.clone(),
            version,
            behavior: behavior.clone(),
            recorder: recorder.clone(),
        });
    }

    /// The published export for `id`, panicking on type mismatch in tests.
    pub fn export(&self, id: &str) -> Option<Arc<RouterExport>> {
        self.runtime.export::<RouterExport>(id)
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait (bounded) for the first event matching `pred`.
pub async fn await_event<F>(
    events: &mut broadcast::Receiver<ReloadEvent>,
    mut pred: F,
) -> ReloadEvent
where
    F: FnMut(&ReloadEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn poll_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
