//! Module code resolution.
//!
//! "Get the latest code for identifier X" is environment-specific: an
//! in-process factory table, a shared library, a scripting engine. The
//! [`ModuleResolver`] trait isolates that mechanism so the loader and
//! coordinator stay independent of how code replacement is physically
//! achieved. [`crate::library::LibraryResolver`] is the shared-library
//! implementation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use hotmod_kernel::{AnyModule, HotModule, ModuleId, ModuleObject};

use crate::error::LoadError;

/// Resolves a module identifier to a loadable unit.
#[async_trait::async_trait]
pub trait ModuleResolver: Send + Sync {
    /// Resolve the identifier to its latest implementation. Called on every
    /// (re)load; each call must observe the current code, not a stale cache.
    async fn resolve_latest(&self, id: &ModuleId) -> Result<ModuleObject, LoadError>;

    /// The filesystem resource backing the identifier, if any. Used to
    /// register content watches; identifiers without a path are simply not
    /// watched.
    fn resolve_path(&self, _id: &ModuleId) -> Option<PathBuf> {
        None
    }
}

type ModuleFactory = dyn Fn() -> ModuleObject + Send + Sync;

/// Factory-table resolver for in-process modules.
///
/// Every `resolve_latest` call invokes the registered factory, so replacing
/// a factory at runtime models a code change; tests and embedded setups use
/// this to drive reloads without touching the filesystem.
#[derive(Default)]
pub struct StaticResolver {
    factories: RwLock<HashMap<ModuleId, Arc<ModuleFactory>>>,
    paths: RwLock<HashMap<ModuleId, PathBuf>>,
}

impl StaticResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `id`.
    pub fn register<F, M>(&self, id: impl Into<ModuleId>, factory: F)
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: HotModule,
    {
        let id = id.into();
        debug!(module = %id, "registering module factory");
        self.factories.write().insert(
            id,
            Arc::new(move || Arc::new(factory()) as Arc<dyn AnyModule>),
        );
    }

    /// Register (or replace) a factory that already produces erased
    /// module objects.
    pub fn register_object<F>(&self, id: impl Into<ModuleId>, factory: F)
    where
        F: Fn() -> ModuleObject + Send + Sync + 'static,
    {
        self.factories.write().insert(id.into(), Arc::new(factory));
    }

    /// Associate a filesystem path with `id` so the runtime can watch it.
    /// The path is informational; the factory still provides the code.
    pub fn set_path(&self, id: impl Into<ModuleId>, path: impl Into<PathBuf>) {
        self.paths.write().insert(id.into(), path.into());
    }

    /// Remove the factory (and path) for `id`.
    pub fn unregister(&self, id: &ModuleId) {
        self.factories.write().remove(id);
        self.paths.write().remove(id);
    }
}

#[async_trait::async_trait]
impl ModuleResolver for StaticResolver {
    async fn resolve_latest(&self, id: &ModuleId) -> Result<ModuleObject, LoadError> {
        let factory = self
            .factories
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| LoadError::UnknownIdentifier(id.clone()))?;
        Ok(factory())
    }

    fn resolve_path(&self, id: &ModuleId) -> Option<PathBuf> {
        self.paths.read().get(id).cloned()
    }
}
