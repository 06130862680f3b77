//! Listener storage and callable identity.
//!
//! The framework accepts heterogeneous callables as listeners: plain
//! function pointers, member functions bound to a shared object, named
//! handler objects, partial applications of named functions, and opaque
//! closures. Add/remove-by-value requires a comparable identity; the rules
//! are:
//!
//! | callable                      | identity                        |
//! |-------------------------------|---------------------------------|
//! | `fn` pointer                  | function address                |
//! | member function + object      | (object address, fn address)    |
//! | handler object                | object address                  |
//! | bound named function          | the wrapped function's address  |
//! | closure                       | none; removable only by token   |
//!
//! Adding an identity-carrying callable twice returns the original token
//! and keeps a single entry. Identity-less callables always append and are
//! never merged. Every entry receives a token unique within its
//! compartment (module, service, framework), usable for precise removal.

use std::sync::{Arc, Mutex};

use tracing::trace;
use usf_common::ModuleId;

use crate::events::{FrameworkEvent, ModuleEvent, ServiceEvent};
use crate::filter::Filter;

/// A numeric receipt returned when adding a listener, unique within one
/// listener kind.
pub type ListenerToken = u64;

/// Comparable identity of a listener callable, used for removal by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallableIdentity {
    /// A free function, identified by its address.
    Function(usize),
    /// A member function bound to a shared object: (object, function).
    Member(usize, usize),
    /// A handler object, identified by its address.
    Handler(usize),
}

/// Implemented by named handler objects that receive events through a
/// method rather than a closure. Such handlers carry their object address
/// as identity.
pub trait EventHandler<E>: Send + Sync {
    fn handle_event(&self, event: &E);
}

/// A listener callable paired with its optional identity.
///
/// Use the constructors to pick the identity rule; see the module docs.
pub struct Listener<E: 'static> {
    callable: Arc<dyn Fn(&E) + Send + Sync>,
    identity: Option<CallableIdentity>,
}

/// Listener for module lifecycle events.
pub type ModuleListener = Listener<ModuleEvent>;
/// Listener for service registry events.
pub type ServiceListener = Listener<ServiceEvent>;
/// Listener for framework events.
pub type FrameworkListener = Listener<FrameworkEvent>;

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            callable: self.callable.clone(),
            identity: self.identity,
        }
    }
}

impl<E> Listener<E> {
    /// A free function listener. Identified by the function's address;
    /// adding the same function twice yields one entry.
    pub fn from_fn(f: fn(&E)) -> Self {
        Self {
            callable: Arc::new(move |e| f(e)),
            identity: Some(CallableIdentity::Function(f as usize)),
        }
    }

    /// A member function bound to a shared object. Identified by the
    /// (object, method) pair, so distinct methods on the same object are
    /// distinct listeners.
    pub fn from_member<T: Send + Sync + 'static>(obj: &Arc<T>, method: fn(&T, &E)) -> Self {
        let target = obj.clone();
        Self {
            callable: Arc::new(move |e| method(&target, e)),
            identity: Some(CallableIdentity::Member(
                Arc::as_ptr(obj) as usize,
                method as usize,
            )),
        }
    }

    /// A named handler object. Identified by its address.
    pub fn from_handler<H: EventHandler<E> + 'static>(handler: Arc<H>) -> Self {
        let identity = CallableIdentity::Handler(Arc::as_ptr(&handler) as usize);
        Self {
            callable: Arc::new(move |e| handler.handle_event(e)),
            identity: Some(identity),
        }
    }

    /// A partial application of a named function: the argument is captured,
    /// the identity forwards to the wrapped function's address.
    pub fn bound<A>(target: fn(A, &E), arg: A) -> Self
    where
        A: Clone + Send + Sync + 'static,
    {
        Self {
            callable: Arc::new(move |e| target(arg.clone(), e)),
            identity: Some(CallableIdentity::Function(target as usize)),
        }
    }

    /// An opaque closure. Carries no identity: adding twice creates two
    /// entries, and removal is possible only through the returned token.
    pub fn from_closure<F>(f: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        Self {
            callable: Arc::new(f),
            identity: None,
        }
    }

    /// The callable's identity, if it has one.
    pub fn identity(&self) -> Option<CallableIdentity> {
        self.identity
    }

    pub(crate) fn callable(&self) -> &Arc<dyn Fn(&E) + Send + Sync> {
        &self.callable
    }
}

// =============================================================================
// Compartments
// =============================================================================

/// A dispatch-ready copy of one listener entry, taken under the table lock
/// and invoked after it is released.
pub(crate) struct ListenerSnapshot<E: 'static> {
    pub callable: Arc<dyn Fn(&E) + Send + Sync>,
    pub owner: ModuleId,
    pub filter: Option<Filter>,
}

struct Entry<E: 'static> {
    token: ListenerToken,
    identity: Option<CallableIdentity>,
    callable: Arc<dyn Fn(&E) + Send + Sync>,
    owner: ModuleId,
    filter: Option<Filter>,
}

struct Compartment<E: 'static> {
    entries: Vec<Entry<E>>,
    next_token: ListenerToken,
}

impl<E> Default for Compartment<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_token: 1,
        }
    }
}

impl<E> Compartment<E> {
    fn add(&mut self, listener: &Listener<E>, owner: ModuleId, filter: Option<Filter>) -> ListenerToken {
        if let Some(identity) = listener.identity {
            if let Some(existing) = self.entries.iter().find(|e| e.identity == Some(identity)) {
                return existing.token;
            }
        }
        let token = self.next_token;
        self.next_token += 1;
        self.entries.push(Entry {
            token,
            identity: listener.identity,
            callable: listener.callable.clone(),
            owner,
            filter,
        });
        token
    }

    fn remove_by_value(&mut self, listener: &Listener<E>) -> bool {
        let Some(identity) = listener.identity else {
            return false;
        };
        let mut matches = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.identity == Some(identity));
        let first = matches.next().map(|(i, _)| i);
        let ambiguous = matches.next().is_some();
        match (first, ambiguous) {
            (Some(index), false) => {
                self.entries.remove(index);
                true
            }
            _ => false,
        }
    }

    fn remove_by_token(&mut self, token: ListenerToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.token != token);
        self.entries.len() != before
    }

    fn remove_owner(&mut self, owner: ModuleId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.owner != owner);
        before - self.entries.len()
    }

    fn snapshot(&self) -> Vec<ListenerSnapshot<E>> {
        self.entries
            .iter()
            .map(|e| ListenerSnapshot {
                callable: e.callable.clone(),
                owner: e.owner,
                filter: e.filter.clone(),
            })
            .collect()
    }
}

// =============================================================================
// Table
// =============================================================================

/// The framework's listener directory: one compartment per event kind,
/// each guarded by its own lock. The lock is never held across a listener
/// invocation; dispatch works from snapshots.
#[derive(Default)]
pub(crate) struct ListenerTable {
    modules: Mutex<Compartment<ModuleEvent>>,
    services: Mutex<Compartment<ServiceEvent>>,
    frameworks: Mutex<Compartment<FrameworkEvent>>,
}

impl ListenerTable {
    pub fn add_module_listener(&self, listener: &ModuleListener, owner: ModuleId) -> ListenerToken {
        let token = self.modules.lock().unwrap().add(listener, owner, None);
        trace!("[Listeners] module listener added, token {}", token);
        token
    }

    pub fn add_service_listener(
        &self,
        listener: &ServiceListener,
        owner: ModuleId,
        filter: Option<Filter>,
    ) -> ListenerToken {
        let token = self.services.lock().unwrap().add(listener, owner, filter);
        trace!("[Listeners] service listener added, token {}", token);
        token
    }

    pub fn add_framework_listener(
        &self,
        listener: &FrameworkListener,
        owner: ModuleId,
    ) -> ListenerToken {
        let token = self.frameworks.lock().unwrap().add(listener, owner, None);
        trace!("[Listeners] framework listener added, token {}", token);
        token
    }

    pub fn remove_module_listener(&self, listener: &ModuleListener) -> bool {
        self.modules.lock().unwrap().remove_by_value(listener)
    }

    pub fn remove_service_listener(&self, listener: &ServiceListener) -> bool {
        self.services.lock().unwrap().remove_by_value(listener)
    }

    pub fn remove_framework_listener(&self, listener: &FrameworkListener) -> bool {
        self.frameworks.lock().unwrap().remove_by_value(listener)
    }

    pub fn remove_module_listener_token(&self, token: ListenerToken) -> bool {
        self.modules.lock().unwrap().remove_by_token(token)
    }

    pub fn remove_service_listener_token(&self, token: ListenerToken) -> bool {
        self.services.lock().unwrap().remove_by_token(token)
    }

    pub fn remove_framework_listener_token(&self, token: ListenerToken) -> bool {
        self.frameworks.lock().unwrap().remove_by_token(token)
    }

    /// Removes every listener owned by `owner`; used at module uninit.
    pub fn remove_owner(&self, owner: ModuleId) -> usize {
        self.modules.lock().unwrap().remove_owner(owner)
            + self.services.lock().unwrap().remove_owner(owner)
            + self.frameworks.lock().unwrap().remove_owner(owner)
    }

    /// Releases all listeners; part of framework stop.
    pub fn clear(&self) {
        self.modules.lock().unwrap().entries.clear();
        self.services.lock().unwrap().entries.clear();
        self.frameworks.lock().unwrap().entries.clear();
    }

    pub fn snapshot_module(&self) -> Vec<ListenerSnapshot<ModuleEvent>> {
        self.modules.lock().unwrap().snapshot()
    }

    pub fn snapshot_service(&self) -> Vec<ListenerSnapshot<ServiceEvent>> {
        self.services.lock().unwrap().snapshot()
    }

    pub fn snapshot_framework(&self) -> Vec<ListenerSnapshot<FrameworkEvent>> {
        self.frameworks.lock().unwrap().snapshot()
    }
}
