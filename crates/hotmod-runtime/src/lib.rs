//! # hotmod-runtime
//!
//! In-process hot-module-reload: load, watch, and atomically swap modules
//! while the process keeps serving.
//!
//! ## Architecture
//! ```text
//!  ContentWatcher ──updates──► ReloadCoordinator ──hooks──► ModuleLoader
//!   (fingerprint,                (serialize per id,           (resolver,
//!    debounce)                    coalesce, publish)           lifecycle)
//!                                      │
//!                                      ▼
//!                                ModuleRegistry ──getExport──► consumers
//!                                (persistent state,             (route tables,
//!                                 atomic export slot)            handlers)
//! ```
//!
//! The [`HmrRuntime`] supervisor owns the pieces: `start` performs ordered
//! initial loads, `import`/`export` serve consumers, `close_all` shuts the
//! set down watches-first with aggregated error reporting.
//!
//! ## Guarantees
//! - **Atomic publish** — consumers reading an export observe either the
//!   pre-reload or the post-reload value, never an intermediate.
//! - **State durability** — a module's persistent state is created once and
//!   carried, by reference, across every reload of its code.
//! - **Serialized reloads** — per identifier, cycles never overlap; updates
//!   arriving mid-cycle coalesce into one follow-up cycle.
//! - **Failure isolation** — a broken reload keeps the previous export
//!   serving and is reported on the event stream; nothing panics, nothing
//!   unpublishes.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! use hotmod_runtime::{
//!     Activation, HmrRuntime, HotModule, ModuleResult, StaticResolver, UpdateEmitter,
//! };
//!
//! struct HitCounter;
//!
//! /// Export consumers call; the counter itself is persistent state and
//! /// survives every reload of the module's code.
//! struct HitApi {
//!     hits: Arc<AtomicU64>,
//! }
//!
//! impl HitApi {
//!     fn hit(&self) -> u64 {
//!         self.hits.fetch_add(1, Ordering::Relaxed)
//!     }
//! }
//!
//! #[async_trait::async_trait]
//! impl HotModule for HitCounter {
//!     type Persistent = AtomicU64;
//!     type Export = HitApi;
//!
//!     async fn init_persistent(&self) -> ModuleResult<Self::Persistent> {
//!         Ok(AtomicU64::new(0))
//!     }
//!
//!     async fn activate(
//!         &self,
//!         state: Arc<Self::Persistent>,
//!         _updates: UpdateEmitter,
//!     ) -> ModuleResult<Activation<Self::Export>> {
//!         Ok(Activation::ready(HitApi { hits: state }))
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let resolver = Arc::new(StaticResolver::new());
//!     resolver.register("hits", || HitCounter);
//!
//!     let runtime = HmrRuntime::builder(resolver).build();
//!     let handle = runtime.import::<HitApi>("hits").await?;
//!
//!     let api = handle.exports().expect("published");
//!     assert_eq!(api.hit(), 0);
//!     runtime.close_all().await;
//!     Ok(())
//! }
//! ```

pub mod coordinator;
pub mod error;
pub mod library;
pub mod loader;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod watcher;

// ---- Public re-exports ----

pub use coordinator::ReloadCoordinator;
pub use error::{LoadError, ReloadError, ShutdownReport};
pub use library::{LibraryResolver, ModuleLibrary};
pub use loader::{LoadOutcome, ModuleLoader};
pub use registry::{
    ModuleEntry, ModuleHandle, ModuleInfo, ModulePhase, ModuleRegistry, RegistryStats,
};
pub use resolver::{ModuleResolver, StaticResolver};
pub use runtime::{HmrRuntime, HmrRuntimeBuilder, wait_for_shutdown_signal};
pub use watcher::{ContentWatcher, Watch, WatchConfig, content_fingerprint};

// Re-export the module contract so implementors depend on one crate.
pub use hotmod_kernel::{
    Activation, AnyActivation, AnyModule, ExportObject, HotModule, HotSwapConfig, ModuleError,
    ModuleId, ModuleObject, ModuleResult, ReloadEvent, ReloadStrategy, StateObject, UpdateEmitter,
};
