//! Runtime error types.

use std::time::Duration;

use thiserror::Error;

use hotmod_kernel::{ModuleError, ModuleId};

/// Errors while resolving an identifier to loadable module code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    /// No code source is registered for the identifier.
    #[error("no module source registered for identifier: {0}")]
    UnknownIdentifier(ModuleId),

    /// The backing shared library could not be opened.
    #[error("failed to load library: {0}")]
    Library(String),

    /// A required export symbol is missing from the library.
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// The library's constructor returned null.
    #[error("module constructor returned null")]
    NullConstructor,

    /// The library was built against an incompatible contract version.
    #[error("ABI version mismatch: expected {expected}, got {actual}")]
    AbiMismatch {
        /// Version this runtime speaks.
        expected: u32,
        /// Version the library reported.
        actual: u32,
    },

    /// An I/O error while reading or fingerprinting module code.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a load or reload cycle.
///
/// None of these ever unpublish a previously published export: a failed
/// cycle leaves consumers on the pre-reload export.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReloadError {
    /// The identifier has no registry entry.
    #[error("module not found: {0}")]
    NotFound(ModuleId),

    /// Resolving the latest code failed.
    #[error("resolve failed: {0}")]
    Resolve(#[from] LoadError),

    /// `init_persistent` failed; the module has nothing to activate with.
    #[error("{0}")]
    Init(#[source] ModuleError),

    /// `activate` failed or its deferred export rejected.
    #[error("{0}")]
    Activation(#[source] ModuleError),

    /// A deferred activation outlived the configured bound.
    #[error("activation timed out after {0:?}")]
    ActivationTimeout(Duration),

    /// The content watcher rejected a subscription.
    #[error("watch error: {0}")]
    Watch(String),

    /// `start` was called twice.
    #[error("runtime already started")]
    AlreadyStarted,

    /// The runtime is shutting down and no longer accepts work.
    #[error("runtime is shutting down")]
    ShuttingDown,
}

/// Aggregated result of [`close_all`]: every module's teardown is attempted
/// and every failure is collected rather than aborting the sequence.
///
/// [`close_all`]: crate::runtime::HmrRuntime::close_all
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Teardown failures, in teardown order.
    pub errors: Vec<(ModuleId, ModuleError)>,
    /// Number of modules torn down (cleanly or not).
    pub modules_closed: usize,
}

impl ShutdownReport {
    /// Whether every module shut down cleanly.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn record(&mut self, id: ModuleId, error: ModuleError) {
        self.errors.push((id, error));
    }
}
