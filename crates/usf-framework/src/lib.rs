//! # USF Framework
//!
//! An in-process service-oriented module framework: a host process
//! dynamically loads, activates, and composes independently-developed
//! modules which publish and consume services through a central,
//! priority-ordered registry. Module, service, and framework events are
//! delivered synchronously to heterogeneous listener callables.
//!
//! | Area          | Description                                              | Key types                                      |
//! |---------------|----------------------------------------------------------|------------------------------------------------|
//! | **Framework** | Embedded runtime; init/start/stop, module 0              | [`Framework`], [`FrameworkConfig`]             |
//! | **Modules**   | Install/start/stop lifecycle, activator discovery        | [`Module`], [`ModuleInfo`], [`ModuleActivator`]|
//! | **Services**  | Ranked, filterable registry with per-consumer use counts | [`ServiceRegistration`], [`ServiceReference`]  |
//! | **Listeners** | Add/remove by value or token, callable identity          | [`Listener`], [`ListenerToken`]                |
//! | **Filters**   | LDAP-style predicates over service properties            | [`Filter`]                                     |
//!
//! ```no_run
//! use usf_framework::{Framework, FrameworkConfig, FrameworkListener};
//!
//! fn main() -> usf_framework::Result<()> {
//!     let framework = Framework::new(FrameworkConfig::new());
//!     framework.init()?;
//!
//!     let context = framework.context()?;
//!     context.add_framework_listener(&FrameworkListener::from_closure(|event| {
//!         println!("{:?}", event);
//!     }))?;
//!
//!     framework.start()?;
//!     // ... install modules, look up services ...
//!     framework.stop()?;
//!     framework.wait_for_stop(std::time::Duration::ZERO);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod events;
pub mod filter;
pub mod framework;
pub mod listeners;
pub mod module;
pub mod registry;
pub mod symbols;

mod dispatcher;
mod state;

// Re-export commonly used items
pub use config::{FrameworkConfig, LogSink, FRAMEWORK_LOG};
pub use context::ModuleContext;
pub use events::{
    FrameworkEvent, FrameworkEventType, ModuleEvent, ModuleEventType, ServiceEvent,
    ServiceEventType,
};
pub use filter::Filter;
pub use framework::{Framework, FRAMEWORK_MODULE_NAME};
pub use listeners::{
    CallableIdentity, EventHandler, FrameworkListener, Listener, ListenerToken, ModuleListener,
    ServiceListener,
};
pub use module::{Module, ModuleInfo, ModuleState};
pub use registry::{
    ServiceFactory, ServiceObject, ServiceReference, ServiceRegistration, OBJECTCLASS, SERVICE_ID,
    SERVICE_RANKING,
};
#[cfg(unix)]
pub use symbols::DynamicLibrary;
pub use symbols::{
    activator_symbol, ActivatorFactory, ActivatorInstanceFn, BoxedActivator, ModuleActivator,
    SymbolResolver, SymbolTable, ACTIVATOR_SYMBOL_PREFIX,
};

// Re-export the shared value and error types
pub use usf_common::{AnyValue, Error, ModuleId, ModuleVersion, Properties, Result, ServiceId};
