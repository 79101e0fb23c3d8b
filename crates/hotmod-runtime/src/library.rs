//! Shared-library module resolution.
//!
//! [`LibraryResolver`] maps identifiers to cdylib paths and keeps one open
//! [`ModuleLibrary`] per identifier. A reload re-fingerprints the file: an
//! unchanged hash reuses the open library, a changed one drops it and opens
//! the new build. Module instances hold the library `Arc` so mapped code
//! outlives cache eviction while an activation is still live.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use libloading::{Library, Symbol};
use tokio::sync::RwLock;
use tracing::{debug, info};

use hotmod_kernel::{
    AnyActivation, AnyModule, ExportObject, ModuleId, ModuleResult, StateObject, UpdateEmitter,
};

use crate::error::LoadError;
use crate::resolver::ModuleResolver;
use crate::watcher::content_fingerprint;

/// Contract version compiled into module libraries via [`declare_module!`].
pub const CURRENT_ABI_VERSION: u32 = 1;

/// An open module library.
pub struct ModuleLibrary {
    path: PathBuf,
    library: Library,
    fingerprint: String,
    abi_version: u32,
}

impl ModuleLibrary {
    /// Open the library at `path` and validate its contract version.
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let fingerprint = content_fingerprint(path)?;

        let library =
            unsafe { Library::new(path).map_err(|e| LoadError::Library(e.to_string()))? };

        let abi_version = unsafe {
            let version_fn: Result<Symbol<unsafe extern "C" fn() -> u32>, _> =
                library.get(b"_hotmod_abi_version");
            match version_fn {
                Ok(func) => func(),
                // Default to version 1 if not specified.
                Err(_) => 1,
            }
        };

        if abi_version != CURRENT_ABI_VERSION {
            return Err(LoadError::AbiMismatch {
                expected: CURRENT_ABI_VERSION,
                actual: abi_version,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            library,
            fingerprint,
            abi_version,
        })
    }

    /// Path the library was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content fingerprint of the file at open time.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Contract version the library reported.
    pub fn abi_version(&self) -> u32 {
        self.abi_version
    }

    /// Create a module instance from this library's `_hotmod_create` export.
    ///
    /// # Safety
    /// Calls an `extern "C"` constructor from a dynamic library; the library
    /// must have been built with [`declare_module!`] against the same
    /// contract version.
    pub unsafe fn create_instance(&self) -> Result<Box<dyn AnyModule>, LoadError> {
        unsafe {
            let create_fn: Symbol<unsafe extern "C" fn() -> *mut dyn AnyModule> = self
                .library
                .get(b"_hotmod_create")
                .map_err(|e| LoadError::SymbolNotFound(format!("_hotmod_create: {}", e)))?;

            let raw = create_fn();
            if raw.is_null() {
                return Err(LoadError::NullConstructor);
            }

            Ok(Box::from_raw(raw))
        }
    }
}

impl Drop for ModuleLibrary {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "unloading module library");
    }
}

/// A module instance pinned to the library that produced it.
///
/// Field order matters: the instance must drop before the mapping it points
/// into.
struct LibraryModule {
    instance: Box<dyn AnyModule>,
    _library: Arc<ModuleLibrary>,
}

#[async_trait::async_trait]
impl AnyModule for LibraryModule {
    async fn init_persistent(&self) -> ModuleResult<StateObject> {
        self.instance.init_persistent().await
    }

    async fn activate(
        &self,
        state: StateObject,
        updates: UpdateEmitter,
    ) -> ModuleResult<AnyActivation> {
        self.instance.activate(state, updates).await
    }

    async fn deactivate(&self, state: StateObject, export: ExportObject) -> ModuleResult<()> {
        self.instance.deactivate(state, export).await
    }

    async fn teardown_persistent(&self, state: StateObject) -> ModuleResult<()> {
        self.instance.teardown_persistent(state).await
    }

    fn refresh_persistent(&self) -> bool {
        self.instance.refresh_persistent()
    }
}

/// [`ModuleResolver`] backed by cdylibs on disk.
pub struct LibraryResolver {
    paths: parking_lot::RwLock<HashMap<ModuleId, PathBuf>>,
    libraries: RwLock<HashMap<ModuleId, Arc<ModuleLibrary>>>,
    reopen_delay: Duration,
}

impl LibraryResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self {
            paths: parking_lot::RwLock::new(HashMap::new()),
            libraries: RwLock::new(HashMap::new()),
            // Editors and linkers may still hold the file right after the
            // change event; give the handle a moment to settle.
            reopen_delay: Duration::from_millis(100),
        }
    }

    /// Map `id` to the cdylib at `path`.
    pub fn register(&self, id: impl Into<ModuleId>, path: impl AsRef<Path>) {
        let id = id.into();
        let path = path.as_ref().to_path_buf();
        debug!(module = %id, path = %path.display(), "registering module library");
        self.paths.write().insert(id, path);
    }

    /// Remove the mapping (and any open library) for `id`.
    pub async fn unregister(&self, id: &ModuleId) {
        self.paths.write().remove(id);
        self.libraries.write().await.remove(id);
    }

    /// Whether the on-disk build differs from the currently open library.
    pub async fn has_changed(&self, id: &ModuleId) -> Result<bool, LoadError> {
        let path = self.registered_path(id)?;
        let libraries = self.libraries.read().await;
        match libraries.get(id) {
            Some(library) => Ok(content_fingerprint(&path)? != library.fingerprint()),
            // Not open yet, so consider it changed.
            None => Ok(true),
        }
    }

    fn registered_path(&self, id: &ModuleId) -> Result<PathBuf, LoadError> {
        self.paths
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| LoadError::UnknownIdentifier(id.clone()))
    }

    fn instance_from(library: &Arc<ModuleLibrary>) -> Result<Arc<dyn AnyModule>, LoadError> {
        let instance = unsafe { library.create_instance()? };
        Ok(Arc::new(LibraryModule {
            instance,
            _library: library.clone(),
        }))
    }
}

impl Default for LibraryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ModuleResolver for LibraryResolver {
    async fn resolve_latest(&self, id: &ModuleId) -> Result<Arc<dyn AnyModule>, LoadError> {
        let path = self.registered_path(id)?;
        let current = content_fingerprint(&path)?;

        {
            let libraries = self.libraries.read().await;
            if let Some(library) = libraries.get(id)
                && library.fingerprint() == current
            {
                return Self::instance_from(library);
            }
        }

        // Stale or missing: evict first so the old mapping can be released
        // before the new build is opened.
        let evicted = self.libraries.write().await.remove(id).is_some();
        if evicted {
            tokio::time::sleep(self.reopen_delay).await;
        }

        let library = Arc::new(ModuleLibrary::open(&path)?);
        info!(
            module = %id,
            path = %path.display(),
            fingerprint = %library.fingerprint(),
            "loaded module library"
        );

        let instance = Self::instance_from(&library)?;
        self.libraries.write().await.insert(id.clone(), library);
        Ok(instance)
    }

    fn resolve_path(&self, id: &ModuleId) -> Option<PathBuf> {
        self.paths.read().get(id).cloned()
    }
}

/// Export a module constructor from a cdylib.
///
/// The expression is evaluated once per instantiation and must produce a
/// value implementing `AnyModule` (any `HotModule` does, via the blanket
/// impl).
///
/// ```ignore
/// hotmod_runtime::declare_module!(MyRouter::new());
/// ```
#[macro_export]
macro_rules! declare_module {
    ($module:expr) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _hotmod_create() -> *mut dyn $crate::AnyModule {
            let module: Box<dyn $crate::AnyModule> = Box::new($module);
            Box::into_raw(module)
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _hotmod_abi_version() -> u32 {
            $crate::library::CURRENT_ABI_VERSION
        }
    };
}
