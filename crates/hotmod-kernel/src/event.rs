//! Observable runtime events.
//!
//! The runtime broadcasts one [`ReloadEvent`] per lifecycle step. The stream
//! doubles as the operator-visible error channel: reload and teardown
//! failures never crash the process, they surface here (and in the logs).

use std::time::Duration;

use crate::module::ModuleId;

/// Lifecycle events published on the runtime's broadcast channel.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ReloadEvent {
    /// A module completed its first load and published its initial export.
    ModuleLoaded {
        /// Module identifier.
        id: ModuleId,
        /// Export version published (1 for a first load).
        version: u64,
    },
    /// A reload cycle began.
    ReloadStarted {
        /// Module identifier.
        id: ModuleId,
    },
    /// A reload cycle published a new export.
    ReloadCompleted {
        /// Module identifier.
        id: ModuleId,
        /// Export version now published.
        version: u64,
        /// Wall time from update to publish.
        duration: Duration,
    },
    /// A reload cycle failed; the previously published export is retained.
    ReloadFailed {
        /// Module identifier.
        id: ModuleId,
        /// Rendered error.
        error: String,
    },
    /// `deactivate` failed during a reload; the reload proceeded anyway
    /// (best-effort cleanup).
    DeactivateFailed {
        /// Module identifier.
        id: ModuleId,
        /// Rendered error.
        error: String,
    },
    /// `deactivate` or `teardown_persistent` failed during permanent unload
    /// or shutdown; remaining teardown still ran.
    TeardownFailed {
        /// Module identifier.
        id: ModuleId,
        /// Rendered error.
        error: String,
    },
    /// A module was permanently unloaded and its entry deleted.
    ModuleRemoved {
        /// Module identifier.
        id: ModuleId,
    },
    /// A module requested its own republish via its `UpdateEmitter`.
    ExternalUpdate {
        /// Module identifier.
        id: ModuleId,
    },
}

impl ReloadEvent {
    /// The identifier the event concerns.
    pub fn module_id(&self) -> &ModuleId {
        match self {
            Self::ModuleLoaded { id, .. }
            | Self::ReloadStarted { id }
            | Self::ReloadCompleted { id, .. }
            | Self::ReloadFailed { id, .. }
            | Self::DeactivateFailed { id, .. }
            | Self::TeardownFailed { id, .. }
            | Self::ModuleRemoved { id }
            | Self::ExternalUpdate { id } => id,
        }
    }

    /// Whether the event reports a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ReloadFailed { .. } | Self::DeactivateFailed { .. } | Self::TeardownFailed { .. }
        )
    }
}
