//! Synchronous event fan-out.
//!
//! Delivery rules:
//!
//! 1. Matching listeners are snapshotted under the listener-table lock.
//! 2. The lock is released; no core lock is held across a callback.
//! 3. Listeners run in insertion order on the calling thread.
//! 4. A panicking module or service listener is caught and turned into a
//!    framework `ERROR` event carrying the panic message.
//! 5. A panicking framework listener is caught and logged to the sink;
//!    framework-event dispatch is never re-entered for it.
//!
//! A thread-local guard suppresses nested framework-`ERROR` dispatch on
//! the same thread, so an `ERROR` listener that itself fails cannot loop.

use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;
use usf_common::{Error, ModuleId};

use crate::events::{
    FrameworkEvent, FrameworkEventType, ModuleEvent, ServiceEvent, ServiceEventType,
};
use crate::registry::ServiceReference;
use crate::state::FrameworkState;

thread_local! {
    static IN_ERROR_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

impl FrameworkState {
    /// Delivers a module event to every module listener.
    pub(crate) fn dispatch_module_event(&self, event: ModuleEvent) {
        for entry in self.listeners().snapshot_module() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (entry.callable)(&event))) {
                self.report_listener_panic("module", entry.owner, payload);
            }
        }
    }

    /// Delivers a service event to every service listener whose filter
    /// matches the registration's properties at dispatch time.
    pub(crate) fn dispatch_service_event(&self, event: ServiceEvent) {
        let properties = event.reference().properties();
        for entry in self.listeners().snapshot_service() {
            let matches = entry
                .filter
                .as_ref()
                .map_or(true, |f| f.matches(&properties));
            if !matches {
                continue;
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (entry.callable)(&event))) {
                self.report_listener_panic("service", entry.owner, payload);
            }
        }
    }

    /// Property-change fan-out: listeners matching the new properties see
    /// `MODIFIED`; listeners that only matched the old ones see
    /// `MODIFIED_ENDMATCH`; everyone else sees nothing.
    pub(crate) fn dispatch_service_modified(
        &self,
        reference: &ServiceReference,
        old_properties: &usf_common::Properties,
    ) {
        let new_properties = reference.properties();
        for entry in self.listeners().snapshot_service() {
            let matched_old = entry
                .filter
                .as_ref()
                .map_or(true, |f| f.matches(old_properties));
            let matches_new = entry
                .filter
                .as_ref()
                .map_or(true, |f| f.matches(&new_properties));
            let event = if matches_new {
                ServiceEvent::new(ServiceEventType::Modified, reference.clone())
            } else if matched_old {
                ServiceEvent::new(ServiceEventType::ModifiedEndmatch, reference.clone())
            } else {
                continue;
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (entry.callable)(&event))) {
                self.report_listener_panic("service", entry.owner, payload);
            }
        }
    }

    /// Delivers a framework event. A panicking framework listener is
    /// logged, never redispatched; nested `ERROR` dispatch on the same
    /// thread is suppressed.
    pub(crate) fn dispatch_framework_event(&self, event: FrameworkEvent) {
        let is_error = event.event_type() == FrameworkEventType::Error;
        if is_error && IN_ERROR_DISPATCH.with(Cell::get) {
            self.log_line(&format!(
                "Suppressed recursive framework ERROR event: {}",
                event.message()
            ));
            return;
        }
        if is_error {
            IN_ERROR_DISPATCH.with(|c| c.set(true));
        }
        for entry in self.listeners().snapshot_framework() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (entry.callable)(&event))) {
                self.log_line(&format!(
                    "A Framework Listener threw an exception: {}",
                    panic_message(payload)
                ));
            }
        }
        if is_error {
            IN_ERROR_DISPATCH.with(|c| c.set(false));
        }
    }

    fn report_listener_panic(&self, kind: &str, owner: ModuleId, payload: Box<dyn Any + Send>) {
        let message = panic_message(payload);
        error!("[Dispatcher] {} listener failed: {}", kind, message);
        let event = FrameworkEvent::error(
            self.get_module(owner),
            format!("A {} listener failed during event delivery", kind),
            Error::callback_panic(message),
        );
        self.dispatch_framework_event(event);
    }
}

/// Renders a panic payload into the message carried by framework events.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unidentified panic payload".to_string()
    }
}
