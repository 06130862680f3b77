//! Process-wide framework state.
//!
//! All framework-global data (module table, service registry, listener
//! table, phase) lives in one explicitly constructed [`FrameworkState`]
//! whose lifetime is tied to framework init/stop. There are no lazy
//! process-wide statics. Lock order: module table > registry index >
//! listener table; none of them is held across user callbacks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use usf_common::{Error, ModuleId, Properties, Result};

use crate::config::FrameworkConfig;
use crate::context::ModuleContext;
use crate::events::{
    FrameworkEvent, FrameworkEventType, ModuleEvent, ModuleEventType, ServiceEvent,
    ServiceEventType,
};
use crate::framework::FRAMEWORK_MODULE_NAME;
use crate::listeners::ListenerTable;
use crate::module::{Module, ModuleInfo, ModuleState};
use crate::registry::{
    self, RegistrationData, ServiceInstance, ServiceReference, ServiceRegistration,
    ServiceRegistry,
};
use crate::symbols::{SymbolResolver, SymbolTable};

/// Framework run phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Created,
    Initialized,
    Active,
    Stopping,
    Stopped,
}

struct ModuleTable {
    by_id: BTreeMap<ModuleId, Arc<Module>>,
    next_id: i64,
}

pub(crate) struct FrameworkState {
    config: FrameworkConfig,
    modules: RwLock<ModuleTable>,
    registry: ServiceRegistry,
    listeners: ListenerTable,
    phase: Mutex<Phase>,
    phase_cv: Condvar,
    self_weak: Weak<FrameworkState>,
}

impl FrameworkState {
    pub fn new(config: FrameworkConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            config,
            modules: RwLock::new(ModuleTable {
                by_id: BTreeMap::new(),
                next_id: 0,
            }),
            registry: ServiceRegistry::default(),
            listeners: ListenerTable::default(),
            phase: Mutex::new(Phase::Created),
            phase_cv: Condvar::new(),
            self_weak: self_weak.clone(),
        })
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn listeners(&self) -> &ListenerTable {
        &self.listeners
    }

    /// Writes one diagnostic line to the configured sink, if any. The
    /// framework serializes its writes through the sink's lock.
    pub fn log_line(&self, line: &str) {
        debug!("[Framework] {}", line);
        if let Some(sink) = self.config.log_sink() {
            if let Ok(mut sink) = sink.lock() {
                let _ = writeln!(sink, "{}", line);
            }
        }
    }

    // =========================================================================
    // Phase
    // =========================================================================

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    pub fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap() = phase;
        self.phase_cv.notify_all();
    }

    /// Atomically moves `from` to `to`; `false` when the phase is
    /// something else.
    pub fn try_transition(&self, from: Phase, to: Phase) -> bool {
        let mut phase = self.phase.lock().unwrap();
        if *phase == from {
            *phase = to;
            self.phase_cv.notify_all();
            true
        } else {
            false
        }
    }

    /// Blocks until the framework has stopped. A zero timeout waits
    /// indefinitely; on elapse a `WAIT_TIMEDOUT` event is yielded instead
    /// of `STOPPED`.
    pub fn wait_for_stop(&self, timeout: Duration) -> FrameworkEvent {
        let module0 = self.framework_module();
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut phase = self.phase.lock().unwrap();
        loop {
            if matches!(*phase, Phase::Created | Phase::Stopped) {
                return FrameworkEvent::new(
                    FrameworkEventType::Stopped,
                    module0,
                    "Framework Stopped",
                );
            }
            match deadline {
                None => {
                    phase = self.phase_cv.wait(phase).unwrap();
                }
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                        return FrameworkEvent::new(
                            FrameworkEventType::WaitTimedout,
                            module0,
                            "Framework stop wait timed out",
                        );
                    };
                    let (guard, _) = self.phase_cv.wait_timeout(phase, remaining).unwrap();
                    phase = guard;
                }
            }
        }
    }

    // =========================================================================
    // Module table
    // =========================================================================

    /// Installs a module: validates the info record, assigns the next id,
    /// and fires `INSTALLED`.
    pub fn install_module(
        &self,
        resolver: Arc<dyn SymbolResolver>,
        info: ModuleInfo,
    ) -> Result<Arc<Module>> {
        match self.phase() {
            Phase::Initialized | Phase::Active => {}
            phase => {
                return Err(Error::illegal_state(format!(
                    "cannot install modules while the framework is {:?}",
                    phase
                )));
            }
        }
        if info.name.is_empty() {
            return Err(Error::invalid_argument("module name must not be empty"));
        }

        let module = {
            let mut table = self.modules.write().unwrap();
            let duplicate = table.by_id.values().any(|m| {
                m.name() == info.name && m.state() != ModuleState::Uninstalled
            });
            if duplicate {
                return Err(Error::invalid_argument(format!(
                    "a module named '{}' is already installed",
                    info.name
                )));
            }
            let id = ModuleId::new(table.next_id);
            table.next_id += 1;
            let module = Module::new(id, info, resolver, self.self_weak.clone());
            table.by_id.insert(id, module.clone());
            module
        };
        debug!("[Framework] installed {}", module);

        self.dispatch_module_event(ModuleEvent::new(ModuleEventType::Installed, module.clone()));
        Ok(module)
    }

    /// Installs the framework itself as module 0, with its context already
    /// attached so hosts can add listeners before start. No `INSTALLED`
    /// event is fired for the framework module.
    pub fn install_framework_module(&self) -> Result<Arc<Module>> {
        let mut table = self.modules.write().unwrap();
        if table.next_id != 0 {
            return Err(Error::illegal_state("framework module is already installed"));
        }
        let id = ModuleId::new(table.next_id);
        table.next_id += 1;
        let info = ModuleInfo::new(FRAMEWORK_MODULE_NAME, "");
        let module = Module::new(id, info, Arc::new(SymbolTable::new()), self.self_weak.clone());
        module.attach_context(Arc::new(ModuleContext::new(&module, self.self_weak.clone())));
        table.by_id.insert(id, module.clone());
        Ok(module)
    }

    pub fn get_module(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.modules.read().unwrap().by_id.get(&id).cloned()
    }

    pub fn framework_module(&self) -> Option<Arc<Module>> {
        self.get_module(ModuleId::FRAMEWORK)
    }

    /// All installed modules in id (install) order.
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules.read().unwrap().by_id.values().cloned().collect()
    }

    pub fn remove_module(&self, id: ModuleId) {
        self.modules.write().unwrap().by_id.remove(&id);
    }

    // =========================================================================
    // Service coordination
    // =========================================================================

    /// Registers a service and fires `REGISTERED` to listeners whose
    /// filter matches the properties as of registration.
    pub fn register_service(
        &self,
        owner: &Arc<Module>,
        interfaces: &[String],
        instance: ServiceInstance,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        let data = self
            .registry
            .insert(owner.id(), interfaces, instance, properties)?;
        let registration = ServiceRegistration::new(data.clone(), self.self_weak.clone());
        self.dispatch_service_event(ServiceEvent::new(
            ServiceEventType::Registered,
            ServiceReference::new(&data),
        ));
        Ok(registration)
    }

    /// Withdraws a registration. `UNREGISTERING` is fully delivered before
    /// consumers lose access; afterwards remaining factory objects are
    /// released.
    pub fn unregister_service(&self, data: &Arc<RegistrationData>) -> Result<()> {
        registry::begin_unregister(data)?;
        self.dispatch_service_event(ServiceEvent::new(
            ServiceEventType::Unregistering,
            ServiceReference::new(data),
        ));
        let cleanups = registry::finish_unregister(data);
        self.registry.remove(data);
        for (factory, consumer, object) in cleanups {
            if let Some(module) = self.get_module(consumer) {
                factory.unget_service(&module, &ServiceReference::new(data), object);
            }
        }
        Ok(())
    }

    /// Replaces a registration's properties and re-matches service
    /// listeners: `MODIFIED` for listeners matching the new properties,
    /// `MODIFIED_ENDMATCH` for listeners that only matched the old ones.
    pub fn modify_service_properties(
        &self,
        data: &Arc<RegistrationData>,
        properties: Properties,
    ) -> Result<()> {
        let old = registry::replace_properties(data, properties)?;
        self.dispatch_service_modified(&ServiceReference::new(data), &old);
        Ok(())
    }

    /// Rolls back everything a module put into the framework: its service
    /// registrations, its remaining service uses, and its listeners. Used
    /// at uninit and for failed loads.
    pub fn release_module_resources(&self, module: &Arc<Module>) {
        for data in self.registry.registered_by(module.id()) {
            if let Err(err) = self.unregister_service(&data) {
                debug!("[Framework] releasing {}: {}", module, err);
            }
        }
        for reference in self.registry.used_by(module.id()) {
            if let Some(data) = reference.registration() {
                while registry::release_service(&data, module) {}
            }
        }
        let removed = self.listeners.remove_owner(module.id());
        if removed > 0 {
            debug!("[Framework] dropped {} listeners of {}", removed, module);
        }
    }

    // =========================================================================
    // Autoload
    // =========================================================================

    /// Scans an autoload directory depth-first in lexicographic order,
    /// installing and starting every loadable sibling. Failures surface as
    /// framework `ERROR` events and do not abort the scan.
    pub fn autoload(&self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                self.report_autoload_failure(
                    dir,
                    Error::autoload_failure(dir.display().to_string(), err.to_string()),
                );
                return;
            }
        };
        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();
        for path in paths {
            if path.is_dir() {
                self.autoload(&path);
            } else if is_loadable_library(&path) {
                if let Err(err) = self.autoload_one(&path) {
                    self.report_autoload_failure(&path, err);
                }
            }
        }
    }

    #[cfg(unix)]
    fn autoload_one(&self, path: &Path) -> Result<()> {
        let wrap = |err: Error| Error::autoload_failure(path.display().to_string(), err.to_string());
        let library = crate::symbols::DynamicLibrary::open(path).map_err(wrap)?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let name = stem.strip_prefix("lib").unwrap_or(stem);
        if name.is_empty() {
            return Err(Error::autoload_failure(
                path.display().to_string(),
                "cannot derive a module name from the file name",
            ));
        }
        let info = ModuleInfo::new(name, path.display().to_string());
        let module = self.install_module(Arc::new(library), info).map_err(wrap)?;
        module.start().map_err(wrap)
    }

    #[cfg(not(unix))]
    fn autoload_one(&self, path: &Path) -> Result<()> {
        Err(Error::autoload_failure(
            path.display().to_string(),
            "dynamic module loading is not supported on this platform",
        ))
    }

    fn report_autoload_failure(&self, path: &Path, err: Error) {
        warn!("[Framework] autoload of {} failed: {}", path.display(), err);
        self.log_line(&format!("Autoloading {} failed: {}", path.display(), err));
        self.dispatch_framework_event(FrameworkEvent::error(
            self.framework_module(),
            format!("Autoloading {} failed", path.display()),
            err,
        ));
    }
}

fn is_loadable_library(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("so" | "dylib" | "dll")
    )
}
