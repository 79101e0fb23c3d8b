//! Typed errors returned by module lifecycle hooks.

use thiserror::Error;

/// Module hook result type using the typed [`ModuleError`].
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Errors a hot module can report from its lifecycle hooks, plus the
/// downcast failures the type-erased contract can surface.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModuleError {
    /// `init_persistent` failed; the module has no usable persistent state.
    #[error("persistent state initialization failed: {0}")]
    InitFailed(String),

    /// `activate` failed or its deferred export rejected.
    #[error("activation failed: {0}")]
    ActivationFailed(String),

    /// `deactivate` failed while releasing per-activation resources.
    #[error("deactivation failed: {0}")]
    DeactivationFailed(String),

    /// `teardown_persistent` failed during permanent unload.
    #[error("persistent state teardown failed: {0}")]
    TeardownFailed(String),

    /// The erased persistent state did not downcast to the module's
    /// `Persistent` type. Indicates a registry entry fed to the wrong module.
    #[error("persistent state has unexpected type (expected {expected})")]
    StateType {
        /// Type name the module expected.
        expected: &'static str,
    },

    /// The erased export did not downcast to the module's `Export` type.
    #[error("export has unexpected type (expected {expected})")]
    ExportType {
        /// Type name the module expected.
        expected: &'static str,
    },

    /// An I/O error surfaced inside a module hook.
    #[error("module I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for errors that don't fit the above categories.
    #[error("{0}")]
    Other(String),
}

impl ModuleError {
    /// Shorthand for [`ModuleError::Other`] from any displayable value.
    pub fn other(err: impl std::fmt::Display) -> Self {
        Self::Other(err.to_string())
    }
}
