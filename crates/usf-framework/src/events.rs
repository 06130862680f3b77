//! Module, service, and framework event types.
//!
//! Events are plain, cloneable records. They are delivered synchronously on
//! the thread that caused them; see the dispatcher for the delivery rules.

use std::fmt;
use std::sync::Arc;

use usf_common::Error;

use crate::module::Module;
use crate::registry::ServiceReference;

/// Module lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleEventType {
    /// The module has been installed.
    Installed,
    /// The module is about to be loaded; its activator has not run yet.
    Loading,
    /// The module has been loaded and is active.
    Loaded,
    /// The module is about to be unloaded.
    Unloading,
    /// The module has been unloaded.
    Unloaded,
    /// The module has been uninstalled; terminal.
    Uninstalled,
}

impl ModuleEventType {
    /// Returns a short stable label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleEventType::Installed => "INSTALLED",
            ModuleEventType::Loading => "LOADING",
            ModuleEventType::Loaded => "LOADED",
            ModuleEventType::Unloading => "UNLOADING",
            ModuleEventType::Unloaded => "UNLOADED",
            ModuleEventType::Uninstalled => "UNINSTALLED",
        }
    }
}

impl fmt::Display for ModuleEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event describing a module lifecycle change.
#[derive(Clone)]
pub struct ModuleEvent {
    event_type: ModuleEventType,
    module: Arc<Module>,
}

impl ModuleEvent {
    pub fn new(event_type: ModuleEventType, module: Arc<Module>) -> Self {
        Self { event_type, module }
    }

    pub fn event_type(&self) -> ModuleEventType {
        self.event_type
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }
}

impl fmt::Debug for ModuleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleEvent[{}, {}]", self.event_type, self.module)
    }
}

/// Service registration change event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceEventType {
    /// A service has been registered.
    Registered,
    /// A registration's properties changed and still match the listener.
    Modified,
    /// A registration's properties changed and no longer match the
    /// listener's filter.
    ModifiedEndmatch,
    /// The service is being withdrawn; consumers still hold access while
    /// this event is delivered.
    Unregistering,
}

impl ServiceEventType {
    /// Returns a short stable label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceEventType::Registered => "REGISTERED",
            ServiceEventType::Modified => "MODIFIED",
            ServiceEventType::ModifiedEndmatch => "MODIFIED_ENDMATCH",
            ServiceEventType::Unregistering => "UNREGISTERING",
        }
    }
}

impl fmt::Display for ServiceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event describing a service registry change.
#[derive(Clone)]
pub struct ServiceEvent {
    event_type: ServiceEventType,
    reference: ServiceReference,
}

impl ServiceEvent {
    pub fn new(event_type: ServiceEventType, reference: ServiceReference) -> Self {
        Self {
            event_type,
            reference,
        }
    }

    pub fn event_type(&self) -> ServiceEventType {
        self.event_type
    }

    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }
}

impl fmt::Debug for ServiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServiceEvent[{}, service.id={}]",
            self.event_type,
            self.reference.service_id()
        )
    }
}

/// Framework-level event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameworkEventType {
    /// The framework reached the active state.
    Started,
    /// An error, typically a failed activator or a panicking listener.
    Error,
    /// A warning.
    Warning,
    /// Informational.
    Info,
    /// The framework has stopped; yielded by `wait_for_stop`.
    Stopped,
    /// `wait_for_stop` gave up before the framework stopped.
    WaitTimedout,
}

impl FrameworkEventType {
    /// Returns a short stable label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameworkEventType::Started => "STARTED",
            FrameworkEventType::Error => "ERROR",
            FrameworkEventType::Warning => "WARNING",
            FrameworkEventType::Info => "INFO",
            FrameworkEventType::Stopped => "STOPPED",
            FrameworkEventType::WaitTimedout => "WAIT_TIMEDOUT",
        }
    }
}

impl fmt::Display for FrameworkEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event describing a framework state change or a contained failure.
#[derive(Clone)]
pub struct FrameworkEvent {
    event_type: FrameworkEventType,
    module: Option<Arc<Module>>,
    message: String,
    error: Option<Arc<Error>>,
}

impl FrameworkEvent {
    pub fn new(
        event_type: FrameworkEventType,
        module: Option<Arc<Module>>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            module,
            message: message.into(),
            error: None,
        }
    }

    /// Creates an ERROR event carrying a captured failure.
    pub fn error(module: Option<Arc<Module>>, message: impl Into<String>, error: Error) -> Self {
        Self {
            event_type: FrameworkEventType::Error,
            module,
            message: message.into(),
            error: Some(Arc::new(error)),
        }
    }

    pub fn event_type(&self) -> FrameworkEventType {
        self.event_type
    }

    pub fn module(&self) -> Option<&Arc<Module>> {
        self.module.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The captured failure, if any.
    pub fn error_detail(&self) -> Option<&Arc<Error>> {
        self.error.as_ref()
    }
}

impl fmt::Debug for FrameworkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameworkEvent[{}, \"{}\"", self.event_type, self.message)?;
        if let Some(m) = &self.module {
            write!(f, ", {}", m)?;
        }
        if let Some(e) = &self.error {
            write!(f, ", error: {}", e)?;
        }
        write!(f, "]")
    }
}
