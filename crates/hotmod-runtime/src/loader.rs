//! Module loader.
//!
//! Resolves identifiers through the configured [`ModuleResolver`] and drives
//! lifecycle hooks to completion. Deferred activations are awaited here
//! (optionally bounded by the activation timeout) so callers only ever see a
//! fully resolved export; the previously published export keeps serving in
//! the meantime.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use hotmod_kernel::{
    AnyActivation, ExportObject, ModuleId, ModuleObject, ModuleResult, StateObject, UpdateEmitter,
};

use crate::error::{LoadError, ReloadError};
use crate::resolver::ModuleResolver;

/// Result of driving one activation to completion.
pub struct LoadOutcome {
    /// The fully constructed export, ready to publish.
    pub export: ExportObject,
    /// Whether the module deferred its activation.
    pub deferred: bool,
    /// Identifier of this activation, for bookkeeping and log correlation.
    pub activation_id: String,
}

impl std::fmt::Debug for LoadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadOutcome")
            .field("deferred", &self.deferred)
            .field("activation_id", &self.activation_id)
            .finish_non_exhaustive()
    }
}

/// Invokes module lifecycle hooks on behalf of the coordinator.
pub struct ModuleLoader {
    resolver: Arc<dyn ModuleResolver>,
    activation_timeout: Option<Duration>,
}

impl ModuleLoader {
    /// Create a loader over the given resolver.
    pub fn new(resolver: Arc<dyn ModuleResolver>, activation_timeout: Option<Duration>) -> Self {
        Self {
            resolver,
            activation_timeout,
        }
    }

    /// The resolver this loader reads code from.
    pub fn resolver(&self) -> &Arc<dyn ModuleResolver> {
        &self.resolver
    }

    /// Resolve the latest implementation for `id`.
    pub async fn resolve_latest(&self, id: &ModuleId) -> Result<ModuleObject, LoadError> {
        self.resolver.resolve_latest(id).await
    }

    /// Initialize persistent state for a first load (or an explicit
    /// refresh).
    pub async fn init_persistent(
        &self,
        id: &ModuleId,
        module: &ModuleObject,
    ) -> Result<StateObject, ReloadError> {
        debug!(module = %id, "initializing persistent state");
        module.init_persistent().await.map_err(ReloadError::Init)
    }

    /// Activate `module` and drive a deferred export to completion.
    ///
    /// A failure here never touches the registry: the caller decides what
    /// to do with the previous export (it stays published).
    pub async fn load(
        &self,
        id: &ModuleId,
        module: &ModuleObject,
        state: StateObject,
        updates: UpdateEmitter,
    ) -> Result<LoadOutcome, ReloadError> {
        let activation_id = uuid::Uuid::now_v7().to_string();
        debug!(module = %id, activation = %activation_id, "activating");

        let activation = module
            .activate(state, updates)
            .await
            .map_err(ReloadError::Activation)?;

        let (export, deferred) = match activation {
            AnyActivation::Ready(export) => (export, false),
            AnyActivation::Deferred(future) => {
                debug!(module = %id, activation = %activation_id, "activation deferred, awaiting export");
                let export = match self.activation_timeout {
                    Some(limit) => tokio::time::timeout(limit, future)
                        .await
                        .map_err(|_| ReloadError::ActivationTimeout(limit))?
                        .map_err(ReloadError::Activation)?,
                    None => future.await.map_err(ReloadError::Activation)?,
                };
                (export, true)
            }
        };

        Ok(LoadOutcome {
            export,
            deferred,
            activation_id,
        })
    }

    /// Release the per-activation resources of `export` via `deactivate`.
    pub async fn unload(
        &self,
        id: &ModuleId,
        module: &ModuleObject,
        state: StateObject,
        export: ExportObject,
    ) -> ModuleResult<()> {
        debug!(module = %id, "deactivating");
        module.deactivate(state, export).await
    }

    /// Destroy persistent state via `teardown_persistent`.
    pub async fn teardown(
        &self,
        id: &ModuleId,
        module: &ModuleObject,
        state: StateObject,
    ) -> ModuleResult<()> {
        debug!(module = %id, "tearing down persistent state");
        module.teardown_persistent(state).await
    }
}
