//! Service registry behavior through the public context API: ranked
//! lookup, filters, use counting, factories, and property modification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use usf_framework::{
    AnyValue, Error, Framework, FrameworkConfig, Module, ModuleContext, Properties,
    ServiceEventType, ServiceFactory, ServiceListener, ServiceObject, ServiceReference,
    ServiceRegistration, OBJECTCLASS, SERVICE_ID, SERVICE_RANKING,
};

fn started() -> (Framework, Arc<ModuleContext>) {
    let framework = Framework::new(FrameworkConfig::new());
    framework.start().unwrap();
    let context = framework.context().unwrap();
    (framework, context)
}

fn props(entries: &[(&str, AnyValue)]) -> Properties {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn register_ranked(
    context: &Arc<ModuleContext>,
    interface: &str,
    ranking: Option<i32>,
) -> ServiceRegistration {
    let properties = match ranking {
        Some(r) => props(&[(SERVICE_RANKING, AnyValue::Int(r as i64))]),
        None => Properties::new(),
    };
    context
        .register_service(&[interface], Arc::new(0u8), properties)
        .unwrap()
}

#[test]
fn test_ranked_lookup_order() {
    let (_fw, context) = started();
    let a = register_ranked(&context, "test.I", None);
    let b = register_ranked(&context, "test.I", Some(10));
    let c = register_ranked(&context, "test.I", Some(10));

    let refs = context.get_service_references("test.I", None).unwrap();
    let ids: Vec<i64> = refs.iter().map(|r| r.service_id().get()).collect();
    // B and C share ranking 10; B registered first, so its lower id wins.
    assert_eq!(
        ids,
        vec![
            b.service_id().get(),
            c.service_id().get(),
            a.service_id().get()
        ]
    );

    let best = context.get_service_reference("test.I").unwrap().unwrap();
    assert_eq!(best.service_id(), b.service_id());
}

#[test]
fn test_filter_match_semantics() {
    let (_fw, context) = started();
    context
        .register_service(
            &["test.F"],
            Arc::new(0u8),
            props(&[("x", AnyValue::Int(5)), ("y", AnyValue::from("foo"))]),
        )
        .unwrap();

    let matching = context
        .get_service_references("test.F", Some("(&(x>=3)(y=foo))"))
        .unwrap();
    assert_eq!(matching.len(), 1);

    let none = context
        .get_service_references("test.F", Some("(x>=6)"))
        .unwrap();
    assert!(none.is_empty());

    let present = context
        .get_service_references("test.F", Some("(y=*)"))
        .unwrap();
    assert_eq!(present.len(), 1);
}

#[test]
fn test_invalid_filter_is_an_error() {
    let (_fw, context) = started();
    let err = context
        .get_service_references("test.I", Some("(x="))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidFilter { .. }));
}

#[test]
fn test_assigned_properties() {
    let (_fw, context) = started();
    let registration = context
        .register_service(&["test.A", "test.B"], Arc::new(0u8), Properties::new())
        .unwrap();

    let reference = registration.reference();
    assert_eq!(
        reference.property(SERVICE_ID),
        Some(AnyValue::Int(registration.service_id().get()))
    );
    assert_eq!(
        reference.property(OBJECTCLASS),
        Some(AnyValue::List(vec![
            AnyValue::from("test.A"),
            AnyValue::from("test.B")
        ]))
    );
    assert_eq!(reference.interfaces(), vec!["test.A", "test.B"]);

    // visible under both interfaces
    assert_eq!(context.get_service_references("test.A", None).unwrap().len(), 1);
    assert_eq!(context.get_service_references("test.B", None).unwrap().len(), 1);
}

#[test]
fn test_get_service_and_downcast() {
    let (_fw, context) = started();
    context
        .register_service(
            &["test.Message"],
            Arc::new("hello".to_string()),
            Properties::new(),
        )
        .unwrap();

    let reference = context.get_service_reference("test.Message").unwrap().unwrap();
    let object = context.get_service(&reference).unwrap();
    let message = object.downcast_ref::<String>().unwrap();
    assert_eq!(message, "hello");
    assert!(context.unget_service(&reference));
}

#[test]
fn test_get_service_after_unregister_fails() {
    let (_fw, context) = started();
    let registration = context
        .register_service(&["test.Gone"], Arc::new(0u8), Properties::new())
        .unwrap();
    let reference = registration.reference();

    assert!(context.get_service(&reference).is_ok());
    assert!(context.unget_service(&reference));

    registration.unregister().unwrap();
    let err = context.get_service(&reference).unwrap_err();
    assert!(matches!(err, Error::ServiceWithdrawn { .. }));
    assert!(!reference.is_available());

    // double unregistration is an error
    assert!(registration.unregister().is_err());
}

#[test]
fn test_register_unregister_round_trip() {
    let (_fw, context) = started();
    let before = context.get_service_references("test.RT", None).unwrap();
    assert!(before.is_empty());

    let registration = context
        .register_service(&["test.RT"], Arc::new(0u8), Properties::new())
        .unwrap();
    assert_eq!(context.get_service_references("test.RT", None).unwrap().len(), 1);

    registration.unregister().unwrap();
    assert!(context.get_service_references("test.RT", None).unwrap().is_empty());
}

#[test]
fn test_use_count_bookkeeping() {
    let (fw, context) = started();
    let registration = context
        .register_service(&["test.Counted"], Arc::new(0u8), Properties::new())
        .unwrap();
    let reference = registration.reference();

    context.get_service(&reference).unwrap();
    context.get_service(&reference).unwrap();

    let module0 = fw.module().unwrap();
    assert_eq!(module0.services_in_use().len(), 1);

    assert!(context.unget_service(&reference));
    assert!(context.unget_service(&reference));
    // no uses left
    assert!(!context.unget_service(&reference));
    assert!(module0.services_in_use().is_empty());
}

struct CountingFactory {
    gets: AtomicUsize,
    ungets: AtomicUsize,
}

impl ServiceFactory for CountingFactory {
    fn get_service(&self, module: &Arc<Module>, _registration: &ServiceReference) -> ServiceObject {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Arc::new(format!("for {}", module.name()))
    }

    fn unget_service(
        &self,
        _module: &Arc<Module>,
        _registration: &ServiceReference,
        _object: ServiceObject,
    ) {
        self.ungets.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_factory_caches_per_consumer() {
    let (_fw, context) = started();
    let factory = Arc::new(CountingFactory {
        gets: AtomicUsize::new(0),
        ungets: AtomicUsize::new(0),
    });
    context
        .register_service_factory(&["test.Made"], factory.clone(), Properties::new())
        .unwrap();

    let reference = context.get_service_reference("test.Made").unwrap().unwrap();
    let first = context.get_service(&reference).unwrap();
    let second = context.get_service(&reference).unwrap();

    // one factory call; the cached object is handed out again
    assert_eq!(factory.gets.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.downcast_ref::<String>().unwrap(), "for framework");

    assert!(context.unget_service(&reference));
    assert_eq!(factory.ungets.load(Ordering::SeqCst), 0);
    assert!(context.unget_service(&reference));
    // count hit zero: the factory object was released
    assert_eq!(factory.ungets.load(Ordering::SeqCst), 1);
}

#[test]
fn test_factory_released_on_unregister() {
    let (_fw, context) = started();
    let factory = Arc::new(CountingFactory {
        gets: AtomicUsize::new(0),
        ungets: AtomicUsize::new(0),
    });
    let registration = context
        .register_service_factory(&["test.Held"], factory.clone(), Properties::new())
        .unwrap();

    let reference = registration.reference();
    context.get_service(&reference).unwrap();

    registration.unregister().unwrap();
    assert_eq!(factory.ungets.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unregistering_delivered_before_withdrawal() {
    let (fw, context) = started();
    let registration = context
        .register_service(&["test.Leaving"], Arc::new(0u8), Properties::new())
        .unwrap();

    let observed = Arc::new(Mutex::new(Vec::<bool>::new()));
    {
        let observed = observed.clone();
        let context = fw.context().unwrap();
        context
            .add_service_listener(
                &ServiceListener::from_closure(move |event| {
                    if event.event_type() == ServiceEventType::Unregistering {
                        // consumers must still have access during this event
                        observed
                            .lock()
                            .unwrap()
                            .push(event.reference().is_available());
                    }
                }),
                None,
            )
            .unwrap();
    }

    registration.unregister().unwrap();
    assert_eq!(observed.lock().unwrap().as_slice(), [true]);
    assert!(!registration.reference().is_available());
}

#[test]
fn test_modify_properties_filter_membership() {
    let (_fw, context) = started();
    let events = Arc::new(Mutex::new(Vec::<ServiceEventType>::new()));
    {
        let events = events.clone();
        context
            .add_service_listener(
                &ServiceListener::from_closure(move |event| {
                    events.lock().unwrap().push(event.event_type());
                }),
                Some("(color=red)"),
            )
            .unwrap();
    }

    let registration = context
        .register_service(
            &["test.Paint"],
            Arc::new(0u8),
            props(&[("color", AnyValue::from("red"))]),
        )
        .unwrap();

    // still matching: MODIFIED
    registration
        .modify_properties(props(&[("color", AnyValue::from("red")), ("shade", AnyValue::from("dark"))]))
        .unwrap();
    // no longer matching: MODIFIED_ENDMATCH
    registration
        .modify_properties(props(&[("color", AnyValue::from("blue"))]))
        .unwrap();
    // matching again: MODIFIED
    registration
        .modify_properties(props(&[("color", AnyValue::from("red"))]))
        .unwrap();

    assert_eq!(
        events.lock().unwrap().as_slice(),
        [
            ServiceEventType::Registered,
            ServiceEventType::Modified,
            ServiceEventType::ModifiedEndmatch,
            ServiceEventType::Modified,
        ]
    );
}

#[test]
fn test_modify_round_trip_restores_membership() {
    let (_fw, context) = started();
    let registration = context
        .register_service(
            &["test.Flip"],
            Arc::new(0u8),
            props(&[("x", AnyValue::Int(1))]),
        )
        .unwrap();

    let matches = |ctx: &Arc<ModuleContext>| {
        ctx.get_service_references("test.Flip", Some("(x=1)"))
            .unwrap()
            .len()
    };
    assert_eq!(matches(&context), 1);

    registration
        .modify_properties(props(&[("x", AnyValue::Int(2))]))
        .unwrap();
    assert_eq!(matches(&context), 0);

    registration
        .modify_properties(props(&[("x", AnyValue::Int(1))]))
        .unwrap();
    assert_eq!(matches(&context), 1);
}

#[test]
fn test_ranking_change_reorders_lookup() {
    let (_fw, context) = started();
    let first = register_ranked(&context, "test.Rank", None);
    let second = register_ranked(&context, "test.Rank", None);

    let order = |ctx: &Arc<ModuleContext>| -> Vec<i64> {
        ctx.get_service_references("test.Rank", None)
            .unwrap()
            .iter()
            .map(|r| r.service_id().get())
            .collect()
    };
    // equal ranking: install order
    assert_eq!(
        order(&context),
        vec![first.service_id().get(), second.service_id().get()]
    );

    second
        .modify_properties(props(&[(SERVICE_RANKING, AnyValue::Int(100))]))
        .unwrap();
    assert_eq!(
        order(&context),
        vec![second.service_id().get(), first.service_id().get()]
    );
}

#[test]
fn test_concurrent_registration_and_lookup() {
    let (fw, _context) = started();
    let fw = Arc::new(fw);

    let mut workers = Vec::new();
    for _ in 0..8 {
        let fw = fw.clone();
        workers.push(std::thread::spawn(move || {
            let context = fw.context().unwrap();
            for _ in 0..25 {
                context
                    .register_service(&["test.Busy"], Arc::new(0u8), Properties::new())
                    .unwrap();
                // lookups interleave with registrations from other threads
                let _ = context.get_service_references("test.Busy", None).unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let refs = fw
        .context()
        .unwrap()
        .get_service_references("test.Busy", None)
        .unwrap();
    assert_eq!(refs.len(), 200);

    // ids are unique and the result is sorted ascending (equal ranking)
    let ids: Vec<i64> = refs.iter().map(|r| r.service_id().get()).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(ids, sorted);
    assert_eq!(sorted.len(), 200);
}

#[test]
fn test_reference_equality_and_ordering() {
    let (_fw, context) = started();
    let low = register_ranked(&context, "test.Cmp", None);
    let high = register_ranked(&context, "test.Cmp", Some(3));

    assert_eq!(low.reference(), low.reference());
    assert_ne!(low.reference(), high.reference());
    assert!(high.reference() > low.reference());
}
