//! Per-module capability handles.
//!
//! A [`ModuleContext`] is created when its module starts and invalidated at
//! uninit; every operation on an invalidated context fails with
//! `IllegalState`. The context carries only weak back-references, so a
//! stopped framework or an uninstalled module is detected rather than kept
//! alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use usf_common::{AnyValue, Error, ModuleId, Properties, Result};

use crate::filter::Filter;
use crate::listeners::{
    FrameworkListener, ListenerToken, ModuleListener, ServiceListener,
};
use crate::module::{Module, ModuleInfo};
use crate::registry::{
    acquire_service, release_service, ServiceFactory, ServiceInstance, ServiceObject,
    ServiceReference, ServiceRegistration,
};
use crate::state::FrameworkState;
use crate::symbols::SymbolResolver;

/// A module's capability handle into the framework: register services,
/// add listeners, query the registry, install further modules.
pub struct ModuleContext {
    module: Weak<Module>,
    core: Weak<FrameworkState>,
    valid: AtomicBool,
}

impl ModuleContext {
    pub(crate) fn new(module: &Arc<Module>, core: Weak<FrameworkState>) -> Self {
        Self {
            module: Arc::downgrade(module),
            core,
            valid: AtomicBool::new(true),
        }
    }

    /// Marks the context unusable; part of module uninit.
    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    /// The module this context belongs to.
    pub fn module(&self) -> Result<Arc<Module>> {
        self.guard()?;
        self.owner()
    }

    /// A module by id, if installed.
    pub fn get_module(&self, id: ModuleId) -> Result<Option<Arc<Module>>> {
        let core = self.guard()?;
        Ok(core.get_module(id))
    }

    /// All installed modules, in id order.
    pub fn modules(&self) -> Result<Vec<Arc<Module>>> {
        let core = self.guard()?;
        Ok(core.modules())
    }

    /// A framework property by key.
    pub fn property(&self, key: &str) -> Option<AnyValue> {
        self.core
            .upgrade()
            .and_then(|core| core.config().properties().get(key).cloned())
    }

    /// Installs a module from a host-supplied info record and symbol
    /// resolver.
    pub fn install_module(
        &self,
        resolver: Arc<dyn SymbolResolver>,
        info: ModuleInfo,
    ) -> Result<Arc<Module>> {
        let core = self.guard()?;
        core.install_module(resolver, info)
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Registers a shared service object under one or more interfaces.
    /// Fires `REGISTERED`.
    pub fn register_service(
        &self,
        interfaces: &[&str],
        object: ServiceObject,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        let core = self.guard()?;
        let owner = self.owner()?;
        core.register_service(
            &owner,
            &to_owned(interfaces),
            ServiceInstance::Object(object),
            properties,
        )
    }

    /// Registers a service factory; each consuming module receives its own
    /// object. Fires `REGISTERED`.
    pub fn register_service_factory(
        &self,
        interfaces: &[&str],
        factory: Arc<dyn ServiceFactory>,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        let core = self.guard()?;
        let owner = self.owner()?;
        core.register_service(
            &owner,
            &to_owned(interfaces),
            ServiceInstance::Factory(factory),
            properties,
        )
    }

    /// References for `interface`, ordered by `(ranking desc, service.id
    /// asc)` and narrowed by an optional LDAP filter. No match is an empty
    /// sequence; a malformed filter is `InvalidFilter`.
    pub fn get_service_references(
        &self,
        interface: &str,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceReference>> {
        let core = self.guard()?;
        let filter = filter.map(Filter::new).transpose()?;
        Ok(core.registry().collect(interface, filter.as_ref()))
    }

    /// The best reference for `interface` (highest ranking, then lowest
    /// id), if any service matches.
    pub fn get_service_reference(&self, interface: &str) -> Result<Option<ServiceReference>> {
        Ok(self.get_service_references(interface, None)?.into_iter().next())
    }

    /// Acquires the service behind `reference` for this module, bumping
    /// its use count. Fails with `ServiceWithdrawn` once the registration
    /// is no longer active.
    pub fn get_service(&self, reference: &ServiceReference) -> Result<ServiceObject> {
        self.guard()?;
        let consumer = self.owner()?;
        let data = reference
            .registration()
            .ok_or_else(|| Error::service_withdrawn(reference.service_id()))?;
        acquire_service(&data, &consumer)
    }

    /// Releases one use of `reference`. Returns whether this module held a
    /// positive use count.
    pub fn unget_service(&self, reference: &ServiceReference) -> bool {
        if self.guard().is_err() {
            return false;
        }
        let Ok(consumer) = self.owner() else {
            return false;
        };
        match reference.registration() {
            Some(data) => release_service(&data, &consumer),
            None => false,
        }
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Adds a module listener; returns its token. An identity-carrying
    /// listener that is already present yields the existing token.
    pub fn add_module_listener(&self, listener: &ModuleListener) -> Result<ListenerToken> {
        let core = self.guard()?;
        Ok(core.listeners().add_module_listener(listener, self.owner_id()?))
    }

    /// Adds a service listener with an optional LDAP filter over service
    /// properties.
    pub fn add_service_listener(
        &self,
        listener: &ServiceListener,
        filter: Option<&str>,
    ) -> Result<ListenerToken> {
        let core = self.guard()?;
        let filter = filter.map(Filter::new).transpose()?;
        Ok(core
            .listeners()
            .add_service_listener(listener, self.owner_id()?, filter))
    }

    /// Adds a framework listener; returns its token.
    pub fn add_framework_listener(&self, listener: &FrameworkListener) -> Result<ListenerToken> {
        let core = self.guard()?;
        Ok(core
            .listeners()
            .add_framework_listener(listener, self.owner_id()?))
    }

    /// Removes a module listener by value. `false` when the callable has
    /// no identity, nothing matches, or the identity is ambiguous.
    pub fn remove_module_listener(&self, listener: &ModuleListener) -> bool {
        self.with_core(|core| core.listeners().remove_module_listener(listener))
    }

    /// Removes a service listener by value.
    pub fn remove_service_listener(&self, listener: &ServiceListener) -> bool {
        self.with_core(|core| core.listeners().remove_service_listener(listener))
    }

    /// Removes a framework listener by value.
    pub fn remove_framework_listener(&self, listener: &FrameworkListener) -> bool {
        self.with_core(|core| core.listeners().remove_framework_listener(listener))
    }

    /// Removes a module listener by token; `true` exactly once.
    pub fn remove_module_listener_token(&self, token: ListenerToken) -> bool {
        self.with_core(|core| core.listeners().remove_module_listener_token(token))
    }

    /// Removes a service listener by token; `true` exactly once.
    pub fn remove_service_listener_token(&self, token: ListenerToken) -> bool {
        self.with_core(|core| core.listeners().remove_service_listener_token(token))
    }

    /// Removes a framework listener by token; `true` exactly once.
    pub fn remove_framework_listener_token(&self, token: ListenerToken) -> bool {
        self.with_core(|core| core.listeners().remove_framework_listener_token(token))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn guard(&self) -> Result<Arc<FrameworkState>> {
        if !self.valid.load(Ordering::SeqCst) {
            return Err(Error::illegal_state(
                "module context is no longer valid",
            ));
        }
        self.core
            .upgrade()
            .ok_or_else(|| Error::illegal_state("framework is no longer active"))
    }

    fn owner(&self) -> Result<Arc<Module>> {
        self.module
            .upgrade()
            .ok_or_else(|| Error::illegal_state("owning module is gone"))
    }

    fn owner_id(&self) -> Result<ModuleId> {
        Ok(self.owner()?.id())
    }

    fn with_core<R: Default>(&self, f: impl FnOnce(&FrameworkState) -> R) -> R {
        match self.guard() {
            Ok(core) => f(&core),
            Err(_) => R::default(),
        }
    }
}

fn to_owned(interfaces: &[&str]) -> Vec<String> {
    interfaces.iter().map(|s| s.to_string()).collect()
}
