//! Modules and their lifecycle.
//!
//! A module is installed from a [`ModuleInfo`] record plus a symbol
//! resolver for its native image. Lifecycle:
//!
//! ```text
//! Installed -> Starting -> Active -> Stopping -> Installed -> Uninstalled
//! ```
//!
//! `Starting` and `Stopping` are transient and observed only by the thread
//! executing the transition. Activator discovery, the `LOADING`/`LOADED`
//! and `UNLOADING`/`UNLOADED` events, and the failure rollback rules all
//! live here. No lock is held across activator callbacks or event
//! delivery.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use usf_common::{AnyValue, Error, ModuleId, ModuleVersion, Properties, Result};

use crate::context::ModuleContext;
use crate::dispatcher::panic_message;
use crate::events::{FrameworkEvent, ModuleEvent, ModuleEventType};
use crate::registry::ServiceReference;
use crate::state::FrameworkState;
use crate::symbols::{activator_symbol, ActivatorFactory, BoxedActivator, SymbolResolver};

/// Host-supplied installation record. Read-only after install.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Short name; used for activator symbol resolution and logs.
    pub name: String,
    /// Originating path or URI.
    pub location: String,
    /// Module version.
    #[serde(default)]
    pub version: ModuleVersion,
    /// Manifest property map.
    #[serde(default)]
    pub manifest: Properties,
    /// Directory scanned when autoload is enabled. Falls back to the
    /// `module.autoload_dir` manifest key.
    #[serde(default)]
    pub autoload_dir: Option<PathBuf>,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            ..Default::default()
        }
    }
}

/// Module lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Installed,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

impl ModuleState {
    /// Returns a short stable label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Installed => "INSTALLED",
            ModuleState::Starting => "STARTING",
            ModuleState::Active => "ACTIVE",
            ModuleState::Stopping => "STOPPING",
            ModuleState::Uninstalled => "UNINSTALLED",
        }
    }
}

struct ModuleInner {
    state: ModuleState,
    context: Option<Arc<ModuleContext>>,
    activator: Option<BoxedActivator>,
}

/// An installed module.
pub struct Module {
    id: ModuleId,
    info: ModuleInfo,
    resolver: Arc<dyn SymbolResolver>,
    core: Weak<FrameworkState>,
    self_weak: Weak<Module>,
    inner: Mutex<ModuleInner>,
}

impl Module {
    /// Manifest key for the framework-assigned module id (read-only).
    pub const PROP_ID: &'static str = "module.id";
    /// Manifest key for the module's short name.
    pub const PROP_NAME: &'static str = "module.name";
    /// Manifest key for the module's originating location.
    pub const PROP_LOCATION: &'static str = "module.location";
    /// Manifest key for the module's version string.
    pub const PROP_VERSION: &'static str = "module.version";
    /// Manifest key for free-text vendor information.
    pub const PROP_VENDOR: &'static str = "module.vendor";
    /// Manifest key for a free-text description.
    pub const PROP_DESCRIPTION: &'static str = "module.description";
    /// Manifest key naming the autoload directory.
    pub const PROP_AUTOLOAD_DIR: &'static str = "module.autoload_dir";

    pub(crate) fn new(
        id: ModuleId,
        info: ModuleInfo,
        resolver: Arc<dyn SymbolResolver>,
        core: Weak<FrameworkState>,
    ) -> Arc<Module> {
        Arc::new_cyclic(|self_weak| Module {
            id,
            info,
            resolver,
            core,
            self_weak: self_weak.clone(),
            inner: Mutex::new(ModuleInner {
                state: ModuleState::Installed,
                context: None,
                activator: None,
            }),
        })
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn location(&self) -> &str {
        &self.info.location
    }

    pub fn version(&self) -> &ModuleVersion {
        &self.info.version
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ModuleState {
        self.inner.lock().unwrap().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == ModuleState::Active
    }

    /// The module's context while active.
    pub fn context(&self) -> Option<Arc<ModuleContext>> {
        self.inner.lock().unwrap().context.clone()
    }

    /// Looks up a module property: the synthesized `module.*` keys first,
    /// then the manifest.
    pub fn property(&self, key: &str) -> Option<AnyValue> {
        match key {
            Module::PROP_ID => Some(AnyValue::Int(self.id.get())),
            Module::PROP_NAME => Some(AnyValue::from(self.info.name.as_str())),
            Module::PROP_LOCATION => Some(AnyValue::from(self.info.location.as_str())),
            Module::PROP_VERSION => Some(AnyValue::from(self.info.version.to_string())),
            _ => self.info.manifest.get(key).cloned(),
        }
    }

    /// All property keys visible through [`Module::property`].
    pub fn property_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = [
            Module::PROP_ID,
            Module::PROP_NAME,
            Module::PROP_LOCATION,
            Module::PROP_VERSION,
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();
        keys.extend(self.info.manifest.keys().cloned());
        keys.sort();
        keys.dedup();
        keys
    }

    /// References to the services this module has registered.
    pub fn registered_services(&self) -> Vec<ServiceReference> {
        self.core.upgrade().map_or_else(Vec::new, |core| {
            core.registry()
                .registered_by(self.id)
                .iter()
                .map(ServiceReference::new)
                .collect()
        })
    }

    /// References to the services this module currently uses.
    pub fn services_in_use(&self) -> Vec<ServiceReference> {
        self.core
            .upgrade()
            .map_or_else(Vec::new, |core| core.registry().used_by(self.id))
    }

    /// The directory scanned during autoload, if configured.
    pub fn autoload_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.info.autoload_dir {
            return Some(dir.clone());
        }
        match self.info.manifest.get(Module::PROP_AUTOLOAD_DIR) {
            Some(AnyValue::String(s)) if !s.is_empty() => Some(PathBuf::from(s)),
            _ => None,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the module: creates a fresh context, resolves and runs the
    /// activator, and fires `LOADING`/`LOADED`.
    ///
    /// Starting an already-active module is a warned no-op. If activator
    /// construction or `load` fails, a framework `ERROR` event is fired,
    /// every registration and listener added during the failed load is
    /// rolled back, the module returns to `Installed`, and the failure is
    /// returned to the caller.
    pub fn start(&self) -> Result<()> {
        let core = self.core()?;
        let this = self.self_arc()?;

        let context = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ModuleState::Installed => {}
                ModuleState::Active => {
                    warn!("[Module] {} already started", self.name());
                    core.log_line(&format!("Module {} already started.", self.name()));
                    return Ok(());
                }
                ModuleState::Starting | ModuleState::Stopping => {
                    return Err(Error::illegal_state(format!(
                        "module '{}' is mid-transition on another thread",
                        self.name()
                    )));
                }
                ModuleState::Uninstalled => {
                    return Err(Error::illegal_state(format!(
                        "module '{}' has been uninstalled",
                        self.name()
                    )));
                }
            }
            inner.state = ModuleState::Starting;
            let context = Arc::new(ModuleContext::new(&this, Arc::downgrade(&core)));
            inner.context = Some(context.clone());
            context
        };

        // Activator discovery precedes LOADING; a resolution-facility
        // failure aborts without framework events.
        let symbol = activator_symbol(self.name());
        let factory = match self.resolver.activator_instance(&symbol) {
            Ok(factory) => factory,
            Err(err) => {
                self.abort_start(&context);
                return Err(err);
            }
        };

        core.dispatch_module_event(ModuleEvent::new(ModuleEventType::Loading, this.clone()));

        let activator = match self.construct_and_load(factory, &context) {
            Ok(activator) => activator,
            Err(err) => {
                core.release_module_resources(&this);
                self.abort_start(&context);
                core.dispatch_framework_event(FrameworkEvent::error(
                    Some(this.clone()),
                    format!("Loading module '{}' failed", self.name()),
                    Error::activator_failure(self.name(), err.to_string()),
                ));
                return Err(err);
            }
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.activator = activator;
            inner.state = ModuleState::Active;
        }
        debug!("[Module] {} started", self.name());

        if core.config().autoload_enabled() {
            if let Some(dir) = self.autoload_dir() {
                core.autoload(&dir);
            }
        }

        core.dispatch_module_event(ModuleEvent::new(ModuleEventType::Loaded, this));
        Ok(())
    }

    /// Stops the module: fires `UNLOADING`, runs the activator's `unload`,
    /// and uninitializes.
    ///
    /// Stopping a non-active module is a warned no-op. An `unload` failure
    /// is captured, uninitialization still runs, and the failure is then
    /// returned to the caller.
    pub fn stop(&self) -> Result<()> {
        let core = self.core()?;
        let this = self.self_arc()?;

        let (context, activator) = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ModuleState::Active => {}
                ModuleState::Installed => {
                    warn!("[Module] {} already stopped", self.name());
                    core.log_line(&format!("Module {} already stopped.", self.name()));
                    return Ok(());
                }
                ModuleState::Starting | ModuleState::Stopping => {
                    return Err(Error::illegal_state(format!(
                        "module '{}' is mid-transition on another thread",
                        self.name()
                    )));
                }
                ModuleState::Uninstalled => {
                    return Err(Error::illegal_state(format!(
                        "module '{}' has been uninstalled",
                        self.name()
                    )));
                }
            }
            let context = inner.context.clone().ok_or_else(|| {
                Error::illegal_state(format!("active module '{}' has no context", self.name()))
            })?;
            inner.state = ModuleState::Stopping;
            (context, inner.activator.take())
        };

        core.dispatch_module_event(ModuleEvent::new(ModuleEventType::Unloading, this.clone()));

        let mut unload_failure: Option<Error> = None;
        if let Some(mut activator) = activator {
            unload_failure = match catch_unwind(AssertUnwindSafe(|| activator.unload(&context))) {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(Error::activator_failure(self.name(), err.to_string())),
                Err(payload) => {
                    Some(Error::activator_failure(self.name(), panic_message(payload)))
                }
            };
            if unload_failure.is_some() {
                warn!("[Module] activator unload() of {} failed", self.name());
                core.log_line(&format!(
                    "Calling the activator unload() of module {} failed!",
                    self.name()
                ));
            }
            // the activator is dropped here, after unload returned
        }

        self.uninit(&core, &this);

        match unload_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stops the module if needed, removes it from the framework, and
    /// fires `UNINSTALLED`. Terminal.
    pub fn uninstall(&self) -> Result<()> {
        let core = self.core()?;
        let this = self.self_arc()?;

        if self.state() == ModuleState::Active {
            self.stop()?;
        }
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ModuleState::Uninstalled {
                return Err(Error::illegal_state(format!(
                    "module '{}' has already been uninstalled",
                    self.name()
                )));
            }
            inner.state = ModuleState::Uninstalled;
        }
        core.remove_module(self.id);
        core.dispatch_module_event(ModuleEvent::new(ModuleEventType::Uninstalled, this));
        Ok(())
    }

    /// Idempotent teardown: releases the module's registrations and
    /// listeners, invalidates the context, and fires `UNLOADED`. Safe to
    /// call when the context is already gone.
    fn uninit(&self, core: &Arc<FrameworkState>, this: &Arc<Module>) {
        let context = {
            let mut inner = self.inner.lock().unwrap();
            let context = inner.context.take();
            inner.activator = None;
            if inner.state != ModuleState::Uninstalled {
                inner.state = ModuleState::Installed;
            }
            context
        };
        let Some(context) = context else {
            return;
        };
        core.release_module_resources(this);
        context.invalidate();
        core.dispatch_module_event(ModuleEvent::new(ModuleEventType::Unloaded, this.clone()));
    }

    /// Start-failure rollback before the module ever reached `Active`. No
    /// `UNLOADED` is fired; the module never was loaded.
    fn abort_start(&self, context: &Arc<ModuleContext>) {
        context.invalidate();
        let mut inner = self.inner.lock().unwrap();
        inner.context = None;
        inner.activator = None;
        inner.state = ModuleState::Installed;
    }

    fn construct_and_load(
        &self,
        factory: Option<ActivatorFactory>,
        context: &Arc<ModuleContext>,
    ) -> Result<Option<BoxedActivator>> {
        let Some(factory) = factory else {
            // activator-less module
            return Ok(None);
        };
        let mut activator = match catch_unwind(AssertUnwindSafe(|| factory())) {
            Ok(activator) => activator,
            Err(payload) => {
                return Err(Error::activator_failure(
                    self.name(),
                    format!(
                        "creating the module activator failed: {}",
                        panic_message(payload)
                    ),
                ));
            }
        };
        match catch_unwind(AssertUnwindSafe(|| activator.load(context))) {
            Ok(Ok(())) => Ok(Some(activator)),
            Ok(Err(err)) => Err(Error::activator_failure(self.name(), err.to_string())),
            Err(payload) => Err(Error::activator_failure(self.name(), panic_message(payload))),
        }
    }

    /// Attaches a pre-built context; used only for the framework module,
    /// whose context must exist before start so hosts can add listeners.
    pub(crate) fn attach_context(&self, context: Arc<ModuleContext>) {
        self.inner.lock().unwrap().context = Some(context);
    }

    /// Direct `Installed -> Active` transition for the framework module,
    /// which has no activator and keeps its init-time context.
    pub(crate) fn mark_active(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            ModuleState::Installed if inner.context.is_some() => {
                inner.state = ModuleState::Active;
                Ok(())
            }
            ModuleState::Active => Ok(()),
            state => Err(Error::illegal_state(format!(
                "framework module cannot become active from {}",
                state.as_str()
            ))),
        }
    }

    fn core(&self) -> Result<Arc<FrameworkState>> {
        self.core
            .upgrade()
            .ok_or_else(|| Error::illegal_state("framework is no longer active"))
    }

    fn self_arc(&self) -> Result<Arc<Module>> {
        self.self_weak
            .upgrade()
            .ok_or_else(|| Error::illegal_state("module handle has been dropped"))
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Module[id={}, loc={}, name={}]",
            self.id, self.info.location, self.info.name
        )
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .field("state", &self.state())
            .finish()
    }
}
