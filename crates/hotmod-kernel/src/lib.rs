//! # hotmod-kernel
//!
//! Contract types for the hotmod hot-reload runtime.
//!
//! A *hot module* is a unit of code the runtime can load, tear down, and
//! atomically swap while the process keeps serving. The contract separates
//! two kinds of state:
//!
//! - **Persistent state** — created once per module identifier by
//!   [`HotModule::init_persistent`] and carried, by reference, across every
//!   reload of the module's code. Destroyed only on permanent unload.
//! - **Activation state** — whatever [`HotModule::activate`] builds into the
//!   export; recreated on every reload and released by
//!   [`HotModule::deactivate`].
//!
//! The runtime half of the system lives in `hotmod-runtime`; this crate only
//! defines what a module must implement ([`HotModule`]), the type-erased
//! object form the runtime stores ([`AnyModule`]), the reload configuration
//! ([`HotSwapConfig`]), the observable event stream ([`ReloadEvent`]), and
//! the typed errors module hooks return ([`ModuleError`]).

pub mod config;
pub mod error;
pub mod event;
pub mod module;

pub use config::{HotSwapConfig, ReloadStrategy};
pub use error::{ModuleError, ModuleResult};
pub use event::ReloadEvent;
pub use module::{
    Activation, AnyActivation, AnyModule, ExportObject, HotModule, ModuleId, ModuleObject,
    StateObject, UpdateEmitter,
};
