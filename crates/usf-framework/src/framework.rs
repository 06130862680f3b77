//! The host-facing framework handle.
//!
//! A [`Framework`] is embedded into a host process. The host initializes
//! it, obtains the framework context to add listeners and install modules,
//! and later stops it. The framework itself appears as module 0. Stop
//! releases every listener: a listener added before `stop` is never
//! invoked by a later `start` unless re-added.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};
use usf_common::{Error, ModuleId, Result};

use crate::config::FrameworkConfig;
use crate::context::ModuleContext;
use crate::events::{FrameworkEvent, FrameworkEventType, ModuleEvent, ModuleEventType};
use crate::module::{Module, ModuleInfo};
use crate::state::{FrameworkState, Phase};
use crate::symbols::SymbolResolver;

/// Short name of the framework's own module (module 0).
pub const FRAMEWORK_MODULE_NAME: &str = "framework";

/// An embedded service-module framework instance.
pub struct Framework {
    config: FrameworkConfig,
    state: Mutex<Arc<FrameworkState>>,
}

impl Framework {
    /// Creates a framework; nothing runs until [`Framework::init`] or
    /// [`Framework::start`].
    pub fn new(config: FrameworkConfig) -> Self {
        Self {
            state: Mutex::new(FrameworkState::new(config.clone())),
            config,
        }
    }

    /// Initializes the framework: fresh state, module 0 installed, its
    /// context ready for listeners. Callable once per lifecycle; a second
    /// `init` before a completed stop fails with `IllegalState`.
    pub fn init(&self) -> Result<()> {
        let mut slot = self.state.lock().unwrap();
        match slot.phase() {
            Phase::Created | Phase::Stopped => {
                let fresh = FrameworkState::new(self.config.clone());
                fresh.set_phase(Phase::Initialized);
                fresh.install_framework_module()?;
                *slot = fresh;
                debug!("[Framework] initialized");
                Ok(())
            }
            _ => Err(Error::illegal_state(
                "init() may only be called once per framework lifecycle",
            )),
        }
    }

    /// Starts the framework (initializing first if needed) and fires
    /// `FrameworkEvent::Started`. Starting an active framework is a
    /// warned no-op.
    pub fn start(&self) -> Result<()> {
        if let Err(err) = self.ensure_init() {
            return Err(err);
        }
        let state = self.current();
        if !state.try_transition(Phase::Initialized, Phase::Active) {
            match state.phase() {
                Phase::Active => {
                    warn!("[Framework] already started");
                    state.log_line("Framework already started.");
                    return Ok(());
                }
                phase => {
                    return Err(Error::illegal_state(format!(
                        "cannot start the framework while {:?}",
                        phase
                    )));
                }
            }
        }

        let module0 = state
            .framework_module()
            .ok_or_else(|| Error::illegal_state("framework module is missing"))?;
        state.dispatch_module_event(ModuleEvent::new(ModuleEventType::Loading, module0.clone()));
        module0.mark_active()?;
        state.dispatch_module_event(ModuleEvent::new(ModuleEventType::Loaded, module0.clone()));

        state.dispatch_framework_event(FrameworkEvent::new(
            FrameworkEventType::Started,
            Some(module0),
            "Framework Started",
        ));
        debug!("[Framework] started");
        Ok(())
    }

    /// Stops the framework synchronously: every active module is stopped
    /// in reverse install order (the framework module last), then all
    /// listeners are released and waiters are woken. Termination is
    /// signaled by the `Stopped` event yielded from
    /// [`Framework::wait_for_stop`].
    pub fn stop(&self) -> Result<()> {
        let state = self.current();
        let stopping = state.try_transition(Phase::Active, Phase::Stopping)
            || state.try_transition(Phase::Initialized, Phase::Stopping);
        if !stopping {
            warn!("[Framework] stop is a no-op in phase {:?}", state.phase());
            return Ok(());
        }

        for module in state.modules().into_iter().rev() {
            if module.id() == ModuleId::FRAMEWORK {
                continue;
            }
            if !module.is_active() {
                continue;
            }
            if let Err(err) = module.stop() {
                state.dispatch_framework_event(FrameworkEvent::error(
                    Some(module.clone()),
                    format!("Stopping module '{}' failed", module.name()),
                    err,
                ));
            }
        }
        if let Some(module0) = state.framework_module() {
            if module0.is_active() {
                // no activator; only releases resources and fires events
                let _ = module0.stop();
            } else if let Some(context) = module0.context() {
                // initialized but never started: retire the context directly
                context.invalidate();
            }
        }

        state.listeners().clear();
        state.set_phase(Phase::Stopped);
        debug!("[Framework] stopped");
        Ok(())
    }

    /// Blocks until the framework has stopped, yielding the `Stopped`
    /// event, or a `WaitTimedout` event if `timeout` elapses first. A zero
    /// timeout waits indefinitely.
    pub fn wait_for_stop(&self, timeout: Duration) -> FrameworkEvent {
        self.current().wait_for_stop(timeout)
    }

    /// Installs a module from a host-supplied record and symbol resolver.
    pub fn install_module(
        &self,
        resolver: Arc<dyn SymbolResolver>,
        info: ModuleInfo,
    ) -> Result<Arc<Module>> {
        self.current().install_module(resolver, info)
    }

    /// Uninstalls a module, stopping it first if active.
    pub fn uninstall_module(&self, module: &Arc<Module>) -> Result<()> {
        module.uninstall()
    }

    /// The framework context (module 0's context).
    pub fn context(&self) -> Result<Arc<ModuleContext>> {
        let state = self.current();
        let module0 = state
            .framework_module()
            .ok_or_else(|| Error::illegal_state("framework is not initialized"))?;
        module0
            .context()
            .ok_or_else(|| Error::illegal_state("framework is not initialized"))
    }

    /// The framework's own module (module 0), once initialized.
    pub fn module(&self) -> Option<Arc<Module>> {
        self.current().framework_module()
    }

    /// A module by id.
    pub fn get_module(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.current().get_module(id)
    }

    /// All installed modules in install order.
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.current().modules()
    }

    fn ensure_init(&self) -> Result<()> {
        let needs_init = {
            let slot = self.state.lock().unwrap();
            matches!(slot.phase(), Phase::Created | Phase::Stopped)
        };
        if needs_init {
            // a concurrent init may win the race; that is fine
            match self.init() {
                Ok(()) | Err(Error::IllegalState { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn current(&self) -> Arc<FrameworkState> {
        self.state.lock().unwrap().clone()
    }
}

impl fmt::Debug for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framework")
            .field("phase", &self.current().phase())
            .finish()
    }
}
