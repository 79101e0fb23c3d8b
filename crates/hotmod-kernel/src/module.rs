//! The hot module contract.
//!
//! [`HotModule`] is the typed trait module authors implement. The runtime
//! stores modules type-erased as [`AnyModule`] trait objects so one registry
//! can hold modules with unrelated persistent/export types; the blanket impl
//! below bridges the two.

use std::any::Any;
use std::borrow::Borrow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ModuleError, ModuleResult};

/// Stable key naming a hot-reloadable unit. Used as the registry key for the
/// lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(String);

impl ModuleId {
    /// Create an identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ModuleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for ModuleId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Type-erased persistent state owned by a registry entry.
pub type StateObject = Arc<dyn Any + Send + Sync>;

/// Type-erased export published for consumers.
pub type ExportObject = Arc<dyn Any + Send + Sync>;

/// A module implementation in its type-erased object form.
pub type ModuleObject = Arc<dyn AnyModule>;

/// Handle a module receives in [`HotModule::activate`] to request its own
/// republish (e.g. after one of the module's *own* external resources
/// changed, independent of its code).
///
/// Emitted updates travel the same coordinator queue as file-change updates,
/// so they obey the same per-identifier serialization and coalescing rules.
#[derive(Clone)]
pub struct UpdateEmitter {
    id: ModuleId,
    tx: mpsc::UnboundedSender<ModuleId>,
}

impl UpdateEmitter {
    /// Create an emitter feeding the given update queue.
    pub fn new(id: ModuleId, tx: mpsc::UnboundedSender<ModuleId>) -> Self {
        Self { id, tx }
    }

    /// Create an emitter whose updates go nowhere. Useful for driving a
    /// module outside a runtime (tests, one-shot tooling).
    pub fn detached(id: ModuleId) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { id, tx }
    }

    /// Request a reload of this module. Never blocks; if the runtime is
    /// already gone the request is dropped.
    pub fn emit(&self) {
        if self.tx.send(self.id.clone()).is_err() {
            tracing::debug!(module = %self.id, "update emitted after runtime shutdown, dropped");
        }
    }

    /// The identifier this emitter belongs to.
    pub fn module_id(&self) -> &ModuleId {
        &self.id
    }
}

impl fmt::Debug for UpdateEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateEmitter").field("id", &self.id).finish()
    }
}

/// The value [`HotModule::activate`] produces: either an export that is
/// ready to use, or a deferred one the runtime must await before publishing.
///
/// While a deferred activation is pending, the previously published export
/// keeps serving; consumers never observe a half-constructed export.
pub enum Activation<E> {
    /// Export is fully constructed.
    Ready(E),
    /// Export becomes available once the future resolves.
    Deferred(BoxFuture<'static, ModuleResult<E>>),
}

impl<E> Activation<E> {
    /// Wrap an immediately available export.
    pub fn ready(export: E) -> Self {
        Self::Ready(export)
    }

    /// Wrap an asynchronously constructed export.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = ModuleResult<E>> + Send + 'static,
    {
        Self::Deferred(Box::pin(future))
    }

    /// Whether the export is still pending.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

impl<E> fmt::Debug for Activation<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Activation::Ready"),
            Self::Deferred(_) => f.write_str("Activation::Deferred"),
        }
    }
}

/// Contract every hot-reloadable unit implements.
///
/// Hook order over a module's life:
///
/// ```text
/// init_persistent ─► activate ─► [deactivate ─► activate]* ─► deactivate ─► teardown_persistent
///                    (load)       (every reload)               (permanent unload)
/// ```
///
/// `Persistent` is shared with the module behind an `Arc` and is
/// *referentially the same value* on every activation; modules that need to
/// mutate it use interior mutability (atomics, locks, pools).
#[async_trait::async_trait]
pub trait HotModule: Send + Sync + 'static {
    /// State carried across reloads of this module's code.
    type Persistent: Send + Sync + 'static;
    /// Value published for consumers while an activation is live.
    type Export: Send + Sync + 'static;

    /// Called once per identifier, before the first activation.
    async fn init_persistent(&self) -> ModuleResult<Self::Persistent>;

    /// Construct a fresh export from the module's current code plus its
    /// persistent state. Called on every (re)load.
    async fn activate(
        &self,
        state: Arc<Self::Persistent>,
        updates: UpdateEmitter,
    ) -> ModuleResult<Activation<Self::Export>>;

    /// Release resources created by the matching [`activate`] call
    /// (handlers, timers, buffers). Called before every reload and on
    /// permanent unload. Must not touch persistent state.
    ///
    /// [`activate`]: HotModule::activate
    async fn deactivate(
        &self,
        _state: Arc<Self::Persistent>,
        _export: Arc<Self::Export>,
    ) -> ModuleResult<()> {
        Ok(())
    }

    /// Destroy the persistent state. Called only on permanent unload or
    /// process shutdown, never on reload.
    async fn teardown_persistent(&self, _state: Arc<Self::Persistent>) -> ModuleResult<()> {
        Ok(())
    }

    /// When true, the runtime tears down and re-initializes persistent state
    /// on every reload instead of carrying it over. Rarely wanted; defaults
    /// to preserving state.
    fn refresh_persistent(&self) -> bool {
        false
    }
}

/// [`Activation`] in type-erased form.
pub enum AnyActivation {
    /// Export is fully constructed.
    Ready(ExportObject),
    /// Export becomes available once the future resolves.
    Deferred(BoxFuture<'static, ModuleResult<ExportObject>>),
}

impl AnyActivation {
    /// Whether the export is still pending.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

impl fmt::Debug for AnyActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("AnyActivation::Ready"),
            Self::Deferred(_) => f.write_str("AnyActivation::Deferred"),
        }
    }
}

/// Object-safe form of [`HotModule`] the runtime stores and drives.
///
/// Implemented for every `HotModule` by the blanket impl below; implement it
/// directly only when the persistent/export types are themselves dynamic
/// (e.g. modules loaded from a shared library).
#[async_trait::async_trait]
pub trait AnyModule: Send + Sync {
    /// Type-erased [`HotModule::init_persistent`].
    async fn init_persistent(&self) -> ModuleResult<StateObject>;

    /// Type-erased [`HotModule::activate`].
    async fn activate(
        &self,
        state: StateObject,
        updates: UpdateEmitter,
    ) -> ModuleResult<AnyActivation>;

    /// Type-erased [`HotModule::deactivate`].
    async fn deactivate(&self, state: StateObject, export: ExportObject) -> ModuleResult<()>;

    /// Type-erased [`HotModule::teardown_persistent`].
    async fn teardown_persistent(&self, state: StateObject) -> ModuleResult<()>;

    /// See [`HotModule::refresh_persistent`].
    fn refresh_persistent(&self) -> bool;
}

fn downcast_state<T: Send + Sync + 'static>(state: StateObject) -> ModuleResult<Arc<T>> {
    state.downcast::<T>().map_err(|_| ModuleError::StateType {
        expected: std::any::type_name::<T>(),
    })
}

fn downcast_export<T: Send + Sync + 'static>(export: ExportObject) -> ModuleResult<Arc<T>> {
    export.downcast::<T>().map_err(|_| ModuleError::ExportType {
        expected: std::any::type_name::<T>(),
    })
}

#[async_trait::async_trait]
impl<M> AnyModule for M
where
    M: HotModule,
{
    async fn init_persistent(&self) -> ModuleResult<StateObject> {
        let state = HotModule::init_persistent(self).await?;
        Ok(Arc::new(state) as StateObject)
    }

    async fn activate(
        &self,
        state: StateObject,
        updates: UpdateEmitter,
    ) -> ModuleResult<AnyActivation> {
        let state = downcast_state::<M::Persistent>(state)?;
        match HotModule::activate(self, state, updates).await? {
            Activation::Ready(export) => Ok(AnyActivation::Ready(Arc::new(export) as ExportObject)),
            Activation::Deferred(future) => Ok(AnyActivation::Deferred(Box::pin(async move {
                let export = future.await?;
                Ok(Arc::new(export) as ExportObject)
            }))),
        }
    }

    async fn deactivate(&self, state: StateObject, export: ExportObject) -> ModuleResult<()> {
        let state = downcast_state::<M::Persistent>(state)?;
        let export = downcast_export::<M::Export>(export)?;
        HotModule::deactivate(self, state, export).await
    }

    async fn teardown_persistent(&self, state: StateObject) -> ModuleResult<()> {
        let state = downcast_state::<M::Persistent>(state)?;
        HotModule::teardown_persistent(self, state).await
    }

    fn refresh_persistent(&self) -> bool {
        HotModule::refresh_persistent(self)
    }
}
