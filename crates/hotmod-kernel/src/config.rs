//! Reload behavior configuration.

use std::time::Duration;

/// How the coordinator reacts to update notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReloadStrategy {
    /// Reload as soon as an update arrives. The content watcher already
    /// debounces raw filesystem noise, so this is the default.
    Immediate,
    /// Hold updates for a quiet window and reload once per burst.
    Debounced(Duration),
    /// Ignore update notifications; reload only on explicit request.
    Manual,
}

impl Default for ReloadStrategy {
    fn default() -> Self {
        Self::Immediate
    }
}

/// Hot-swap configuration shared by the coordinator and supervisor.
#[derive(Debug, Clone)]
pub struct HotSwapConfig {
    /// Reload strategy.
    pub strategy: ReloadStrategy,
    /// Upper bound on a deferred activation. `None` (the default) lets a
    /// hung activation wait forever while the previous export keeps
    /// serving; `Some` fails the reload on expiry, also keeping the
    /// previous export.
    pub activation_timeout: Option<Duration>,
    /// Whether a failed initial load during `start` aborts startup. Later
    /// *re*loads never abort anything regardless of this setting.
    pub abort_on_start_error: bool,
}

impl Default for HotSwapConfig {
    fn default() -> Self {
        Self {
            strategy: ReloadStrategy::default(),
            activation_timeout: None,
            abort_on_start_error: true,
        }
    }
}

impl HotSwapConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reload strategy.
    pub fn with_strategy(mut self, strategy: ReloadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Bound deferred activations.
    pub fn with_activation_timeout(mut self, timeout: Duration) -> Self {
        self.activation_timeout = Some(timeout);
        self
    }

    /// Set whether initial-load failures abort `start`.
    pub fn with_abort_on_start_error(mut self, abort: bool) -> Self {
        self.abort_on_start_error = abort;
        self
    }
}
