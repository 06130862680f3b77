//! Service registry: registrations, references, ranked lookup, and usage
//! tracking.
//!
//! The registry is a thread-safe directory of service registrations indexed
//! per interface name. Lookup results are ordered by `(ranking desc,
//! service.id asc)`: a higher `service.ranking` wins, ties go to the
//! earlier registration. Use counts are tracked per consuming module; a
//! [`ServiceFactory`] instance is asked for a consumer-specific object on
//! first acquisition and released again when the consumer's count drops to
//! zero.
//!
//! Lock order inside this module: the index lock may be taken before a
//! registration's state lock, never the other way around. Neither lock is
//! ever held across user code (factory callbacks run lock-free).

use std::any::Any;
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;
use usf_common::{AnyValue, Error, ModuleId, Properties, Result, ServiceId};

use crate::filter::Filter;
use crate::module::Module;
use crate::state::FrameworkState;

/// Framework-assigned registration id property (read-only).
pub const SERVICE_ID: &str = "service.id";
/// Integer priority used to order services sharing an interface.
pub const SERVICE_RANKING: &str = "service.ranking";
/// Framework-assigned interface list property (read-only).
pub const OBJECTCLASS: &str = "objectclass";

/// A type-erased, shared service object.
pub type ServiceObject = Arc<dyn Any + Send + Sync>;

/// Produces per-consumer service objects on demand.
///
/// Register a factory instead of a plain object to hand each consuming
/// module its own object. The framework caches the object per consumer and
/// calls [`ServiceFactory::unget_service`] when the consumer's use count
/// drops to zero or the registration is withdrawn.
pub trait ServiceFactory: Send + Sync {
    /// Called on a consumer's first acquisition.
    fn get_service(&self, module: &Arc<Module>, registration: &ServiceReference) -> ServiceObject;

    /// Called when a consumer's last use is released.
    fn unget_service(
        &self,
        module: &Arc<Module>,
        registration: &ServiceReference,
        object: ServiceObject,
    );
}

/// What was registered: a shared object or a per-consumer factory.
#[derive(Clone)]
pub(crate) enum ServiceInstance {
    Object(ServiceObject),
    Factory(Arc<dyn ServiceFactory>),
}

#[derive(Default)]
struct UseEntry {
    count: u32,
    cached: Option<ServiceObject>,
}

struct RegState {
    properties: Properties,
    ranking: i32,
    instance: Option<ServiceInstance>,
    withdrawn: bool,
    uses: HashMap<ModuleId, UseEntry>,
}

/// Shared record behind registrations and references.
pub(crate) struct RegistrationData {
    service_id: ServiceId,
    owner: ModuleId,
    interfaces: Vec<String>,
    state: Mutex<RegState>,
    /// Latch serializing unregistration; set before the UNREGISTERING
    /// fan-out, while consumers still have access.
    unregistering: AtomicBool,
    total_uses: AtomicUsize,
}

impl RegistrationData {
    pub(crate) fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub(crate) fn owner(&self) -> ModuleId {
        self.owner
    }

    pub(crate) fn properties(&self) -> Properties {
        self.state.lock().unwrap().properties.clone()
    }

    fn ranking(&self) -> i32 {
        self.state.lock().unwrap().ranking
    }
}

// =============================================================================
// ServiceReference
// =============================================================================

/// A lookup handle to a service registration.
///
/// References are weak: they never keep a withdrawn registration alive and
/// remain valid (but unresolvable) after unregistration. They are ordered
/// by `(ranking, service.id)` with the preferred reference comparing
/// greater: higher ranking wins, ties prefer the lower id.
#[derive(Clone)]
pub struct ServiceReference {
    data: Weak<RegistrationData>,
    service_id: ServiceId,
}

impl ServiceReference {
    pub(crate) fn new(data: &Arc<RegistrationData>) -> Self {
        Self {
            data: Arc::downgrade(data),
            service_id: data.service_id,
        }
    }

    pub(crate) fn registration(&self) -> Option<Arc<RegistrationData>> {
        self.data.upgrade()
    }

    /// The registration id this reference points at.
    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    /// Current `service.ranking`; 0 once the registration is gone.
    pub fn ranking(&self) -> i32 {
        self.registration().map_or(0, |d| d.ranking())
    }

    /// Whether the registration is still resolvable.
    pub fn is_available(&self) -> bool {
        self.registration()
            .map_or(false, |d| !d.state.lock().unwrap().withdrawn)
    }

    /// The interfaces the service was registered under.
    pub fn interfaces(&self) -> Vec<String> {
        self.registration()
            .map_or_else(Vec::new, |d| d.interfaces.clone())
    }

    /// A snapshot of the registration properties; empty once gone.
    pub fn properties(&self) -> Properties {
        self.registration().map_or_else(Properties::new, |d| d.properties())
    }

    /// One property value by key.
    pub fn property(&self, key: &str) -> Option<AnyValue> {
        self.registration()
            .and_then(|d| d.state.lock().unwrap().properties.get(key).cloned())
    }

    /// Id of the module that registered the service.
    pub fn owner_module(&self) -> Option<ModuleId> {
        self.registration().map(|d| d.owner)
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.service_id == other.service_id
    }
}

impl Eq for ServiceReference {}

impl std::hash::Hash for ServiceReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.service_id.hash(state);
    }
}

impl PartialOrd for ServiceReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceReference {
    fn cmp(&self, other: &Self) -> Ordering {
        let (own, theirs) = (self.ranking(), other.ranking());
        own.cmp(&theirs)
            .then_with(|| other.service_id.cmp(&self.service_id))
    }
}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServiceReference[service.id={}, available={}]",
            self.service_id,
            self.is_available()
        )
    }
}

// =============================================================================
// ServiceRegistration
// =============================================================================

/// The registering module's handle to a published service.
///
/// Dropping the handle does not unregister the service; call
/// [`ServiceRegistration::unregister`].
#[derive(Clone)]
pub struct ServiceRegistration {
    data: Arc<RegistrationData>,
    core: Weak<FrameworkState>,
}

impl ServiceRegistration {
    pub(crate) fn new(data: Arc<RegistrationData>, core: Weak<FrameworkState>) -> Self {
        Self { data, core }
    }

    /// The registration id.
    pub fn service_id(&self) -> ServiceId {
        self.data.service_id
    }

    /// A reference to this registration.
    pub fn reference(&self) -> ServiceReference {
        ServiceReference::new(&self.data)
    }

    /// Withdraws the service. `UNREGISTERING` is fully delivered to
    /// matching listeners before consumers lose access. Fails with
    /// `IllegalState` when already withdrawn.
    pub fn unregister(&self) -> Result<()> {
        let core = self.core()?;
        core.unregister_service(&self.data)
    }

    /// Replaces the registration's user properties. `service.id` and
    /// `objectclass` are preserved; a changed `service.ranking` takes
    /// effect for subsequent lookups. Listeners observe `MODIFIED` or
    /// `MODIFIED_ENDMATCH` according to their filters.
    pub fn modify_properties(&self, properties: Properties) -> Result<()> {
        let core = self.core()?;
        core.modify_service_properties(&self.data, properties)
    }

    fn core(&self) -> Result<Arc<FrameworkState>> {
        self.core
            .upgrade()
            .ok_or_else(|| Error::illegal_state("framework is no longer active"))
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceRegistration[service.id={}]", self.data.service_id)
    }
}

// =============================================================================
// Registry index
// =============================================================================

struct RegistryIndex {
    by_interface: HashMap<String, Vec<Arc<RegistrationData>>>,
    all: Vec<Arc<RegistrationData>>,
    next_service_id: i64,
}

/// The framework's service directory.
pub(crate) struct ServiceRegistry {
    inner: Mutex<RegistryIndex>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RegistryIndex {
                by_interface: HashMap::new(),
                all: Vec::new(),
                next_service_id: 1,
            }),
        }
    }
}

impl ServiceRegistry {
    /// Validates and inserts a new registration; the id assignment and the
    /// index insertion happen atomically under the index lock. Event
    /// fan-out is the caller's responsibility.
    pub fn insert(
        &self,
        owner: ModuleId,
        interfaces: &[String],
        instance: ServiceInstance,
        mut properties: Properties,
    ) -> Result<Arc<RegistrationData>> {
        if interfaces.is_empty() {
            return Err(Error::invalid_argument(
                "a service must be registered under at least one interface",
            ));
        }
        if interfaces.iter().any(|i| i.is_empty()) {
            return Err(Error::invalid_argument("empty interface name"));
        }
        let ranking = ranking_from(&properties)?;

        let mut index = self.inner.lock().unwrap();
        let service_id = ServiceId::new(index.next_service_id);
        index.next_service_id += 1;

        properties.insert(SERVICE_ID.to_string(), AnyValue::Int(service_id.get()));
        properties.insert(
            OBJECTCLASS.to_string(),
            AnyValue::List(interfaces.iter().map(|i| AnyValue::from(i.as_str())).collect()),
        );

        let data = Arc::new(RegistrationData {
            service_id,
            owner,
            interfaces: interfaces.to_vec(),
            state: Mutex::new(RegState {
                properties,
                ranking,
                instance: Some(instance),
                withdrawn: false,
                uses: HashMap::new(),
            }),
            unregistering: AtomicBool::new(false),
            total_uses: AtomicUsize::new(0),
        });

        for interface in interfaces {
            index
                .by_interface
                .entry(interface.clone())
                .or_default()
                .push(data.clone());
        }
        index.all.push(data.clone());
        debug!(
            "[Registry] registered service.id={} interfaces={:?} owner={}",
            service_id, interfaces, owner
        );
        Ok(data)
    }

    /// Removes a registration from the indexes. Must not be called while
    /// holding the registration's state lock.
    pub fn remove(&self, data: &Arc<RegistrationData>) {
        let mut index = self.inner.lock().unwrap();
        for interface in &data.interfaces {
            if let Some(list) = index.by_interface.get_mut(interface) {
                list.retain(|d| !Arc::ptr_eq(d, data));
                if list.is_empty() {
                    index.by_interface.remove(interface);
                }
            }
        }
        index.all.retain(|d| !Arc::ptr_eq(d, data));
        debug!("[Registry] removed service.id={}", data.service_id);
    }

    /// Collects references for `interface` (every interface when empty),
    /// filtered and sorted by `(ranking desc, service.id asc)`.
    pub fn collect(&self, interface: &str, filter: Option<&Filter>) -> Vec<ServiceReference> {
        let index = self.inner.lock().unwrap();
        let candidates: &[Arc<RegistrationData>] = if interface.is_empty() {
            &index.all
        } else {
            index
                .by_interface
                .get(interface)
                .map(Vec::as_slice)
                .unwrap_or(&[])
        };

        let mut matched: Vec<(i32, ServiceId, ServiceReference)> = Vec::new();
        for data in candidates {
            let st = data.state.lock().unwrap();
            if st.withdrawn {
                continue;
            }
            if filter.map_or(true, |f| f.matches(&st.properties)) {
                matched.push((st.ranking, data.service_id, ServiceReference::new(data)));
            }
        }
        matched.sort_by_key(|(ranking, id, _)| (Reverse(*ranking), *id));
        matched.into_iter().map(|(_, _, r)| r).collect()
    }

    /// Registrations owned by `owner` that are still indexed.
    pub fn registered_by(&self, owner: ModuleId) -> Vec<Arc<RegistrationData>> {
        let index = self.inner.lock().unwrap();
        index
            .all
            .iter()
            .filter(|d| d.owner == owner)
            .cloned()
            .collect()
    }

    /// References currently in use by `consumer`.
    pub fn used_by(&self, consumer: ModuleId) -> Vec<ServiceReference> {
        let index = self.inner.lock().unwrap();
        index
            .all
            .iter()
            .filter(|d| {
                let st = d.state.lock().unwrap();
                st.uses.get(&consumer).map_or(false, |u| u.count > 0)
            })
            .map(ServiceReference::new)
            .collect()
    }
}

// =============================================================================
// Use counting
// =============================================================================

/// Acquires the service behind `data` for `consumer`, bumping the use
/// counts. A factory is consulted (outside any lock) on the consumer's
/// first acquisition and the produced object cached for later ones.
pub(crate) fn acquire_service(
    data: &Arc<RegistrationData>,
    consumer: &Arc<Module>,
) -> Result<ServiceObject> {
    let factory = {
        let mut guard = data.state.lock().unwrap();
        let st = &mut *guard;
        if st.withdrawn {
            return Err(Error::service_withdrawn(data.service_id));
        }
        let entry = st.uses.entry(consumer.id()).or_default();
        entry.count += 1;
        data.total_uses.fetch_add(1, AtomicOrdering::SeqCst);
        if let Some(cached) = &entry.cached {
            return Ok(cached.clone());
        }
        match &st.instance {
            Some(ServiceInstance::Object(obj)) => return Ok(obj.clone()),
            Some(ServiceInstance::Factory(factory)) => factory.clone(),
            None => {
                entry.count -= 1;
                data.total_uses.fetch_sub(1, AtomicOrdering::SeqCst);
                return Err(Error::service_withdrawn(data.service_id));
            }
        }
    };

    let reference = ServiceReference::new(data);
    let produced = factory.get_service(consumer, &reference);

    let mut st = data.state.lock().unwrap();
    if st.withdrawn {
        drop(st);
        factory.unget_service(consumer, &reference, produced);
        return Err(Error::service_withdrawn(data.service_id));
    }
    let entry = st.uses.entry(consumer.id()).or_default();
    if let Some(existing) = &entry.cached {
        // another thread raced us through the first acquisition
        return Ok(existing.clone());
    }
    entry.cached = Some(produced.clone());
    Ok(produced)
}

/// Releases one use held by `consumer`. Returns whether the consumer had a
/// positive use count. On the last release of a factory-produced object
/// the factory's `unget_service` runs (outside any lock).
pub(crate) fn release_service(data: &Arc<RegistrationData>, consumer: &Arc<Module>) -> bool {
    let mut cleanup: Option<(Arc<dyn ServiceFactory>, ServiceObject)> = None;
    let had_use = {
        let mut guard = data.state.lock().unwrap();
        let st = &mut *guard;
        match st.uses.get_mut(&consumer.id()) {
            Some(entry) if entry.count > 0 => {
                entry.count -= 1;
                data.total_uses.fetch_sub(1, AtomicOrdering::SeqCst);
                let drained = entry.count == 0;
                if drained {
                    let entry = st.uses.remove(&consumer.id()).unwrap_or_default();
                    if let (Some(ServiceInstance::Factory(factory)), Some(obj)) =
                        (&st.instance, entry.cached)
                    {
                        cleanup = Some((factory.clone(), obj));
                    }
                }
                true
            }
            _ => false,
        }
    };
    if let Some((factory, obj)) = cleanup {
        factory.unget_service(consumer, &ServiceReference::new(data), obj);
    }
    had_use
}

/// Begins unregistration: flips the latch exactly once.
pub(crate) fn begin_unregister(data: &RegistrationData) -> Result<()> {
    if data.unregistering.swap(true, AtomicOrdering::SeqCst) {
        return Err(Error::illegal_state(format!(
            "service.id={} is already unregistered",
            data.service_id
        )));
    }
    Ok(())
}

/// Completes unregistration after the UNREGISTERING fan-out: marks the
/// registration withdrawn and drains remaining consumers. Returns the
/// factory cleanups to run (outside any lock).
pub(crate) fn finish_unregister(
    data: &Arc<RegistrationData>,
) -> Vec<(Arc<dyn ServiceFactory>, ModuleId, ServiceObject)> {
    let mut st = data.state.lock().unwrap();
    st.withdrawn = true;
    let instance = st.instance.take();
    let uses = std::mem::take(&mut st.uses);
    data.total_uses.store(0, AtomicOrdering::SeqCst);
    drop(st);

    let mut cleanups = Vec::new();
    if let Some(ServiceInstance::Factory(factory)) = instance {
        for (consumer, entry) in uses {
            if let Some(obj) = entry.cached {
                cleanups.push((factory.clone(), consumer, obj));
            }
        }
    }
    cleanups
}

/// Swaps in new user properties, preserving the framework-assigned keys.
/// Returns the previous property snapshot for listener re-matching.
pub(crate) fn replace_properties(
    data: &RegistrationData,
    mut properties: Properties,
) -> Result<Properties> {
    let ranking = ranking_from(&properties)?;
    let mut st = data.state.lock().unwrap();
    if st.withdrawn {
        return Err(Error::illegal_state(format!(
            "service.id={} has been withdrawn",
            data.service_id
        )));
    }
    for key in [SERVICE_ID, OBJECTCLASS] {
        if let Some(v) = st.properties.get(key) {
            properties.insert(key.to_string(), v.clone());
        } else {
            properties.remove(key);
        }
    }
    st.ranking = ranking;
    Ok(std::mem::replace(&mut st.properties, properties))
}

fn ranking_from(properties: &Properties) -> Result<i32> {
    match properties.get(SERVICE_RANKING) {
        None => Ok(0),
        Some(AnyValue::Int(i)) => i32::try_from(*i)
            .map_err(|_| Error::invalid_argument("service.ranking is out of range")),
        Some(other) => Err(Error::invalid_argument(format!(
            "service.ranking must be an integer, got {}",
            other.type_name()
        ))),
    }
}
