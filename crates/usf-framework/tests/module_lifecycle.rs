//! Module install/start/stop/uninstall behavior, activator failure
//! handling, and autoload error reporting.

use std::sync::{Arc, Mutex};

use usf_framework::{
    AnyValue, BoxedActivator, Error, Framework, FrameworkConfig, FrameworkEvent,
    FrameworkEventType, FrameworkListener, Module, ModuleActivator, ModuleContext, ModuleEventType,
    ModuleInfo, ModuleListener, ModuleState, Properties, Result, SymbolTable,
};

type CallLog = Arc<Mutex<Vec<String>>>;

struct RecordingActivator {
    log: CallLog,
    fail_load: bool,
    fail_unload: bool,
}

impl ModuleActivator for RecordingActivator {
    fn load(&mut self, context: &Arc<ModuleContext>) -> Result<()> {
        let name = context.module()?.name().to_string();
        self.log.lock().unwrap().push(format!("load {}", name));
        if self.fail_load {
            return Err(Error::invalid_argument("load refused"));
        }
        Ok(())
    }

    fn unload(&mut self, context: &Arc<ModuleContext>) -> Result<()> {
        let name = context.module()?.name().to_string();
        self.log.lock().unwrap().push(format!("unload {}", name));
        if self.fail_unload {
            return Err(Error::invalid_argument("unload refused"));
        }
        Ok(())
    }
}

fn activator_table(name: &str, log: &CallLog, fail_load: bool, fail_unload: bool) -> Arc<SymbolTable> {
    let table = SymbolTable::new();
    let log = log.clone();
    table.provide_activator(name, move || {
        Box::new(RecordingActivator {
            log: log.clone(),
            fail_load,
            fail_unload,
        }) as BoxedActivator
    });
    Arc::new(table)
}

fn started_framework() -> Framework {
    let framework = Framework::new(FrameworkConfig::new());
    framework.start().unwrap();
    framework
}

fn module_event_log(framework: &Framework) -> Arc<Mutex<Vec<(ModuleEventType, String)>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    framework
        .context()
        .unwrap()
        .add_module_listener(&ModuleListener::from_closure(move |e| {
            sink.lock()
                .unwrap()
                .push((e.event_type(), e.module().name().to_string()));
        }))
        .unwrap();
    events
}

#[test]
fn test_install_assigns_monotone_ids() {
    let framework = started_framework();
    let log = Arc::new(Mutex::new(Vec::new()));

    let a = framework
        .install_module(activator_table("a", &log, false, false), ModuleInfo::new("a", "/m/a"))
        .unwrap();
    let b = framework
        .install_module(activator_table("b", &log, false, false), ModuleInfo::new("b", "/m/b"))
        .unwrap();

    assert_eq!(a.id().get(), 1);
    assert_eq!(b.id().get(), 2);
    assert!(a.id() < b.id());
}

#[test]
fn test_install_validation() {
    let framework = started_framework();
    let resolver = Arc::new(SymbolTable::new());

    let err = framework
        .install_module(resolver.clone(), ModuleInfo::new("", "/m/x"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));

    framework
        .install_module(resolver.clone(), ModuleInfo::new("dup", "/m/dup"))
        .unwrap();
    let err = framework
        .install_module(resolver.clone(), ModuleInfo::new("dup", "/m/dup2"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
}

#[test]
fn test_activator_lifecycle_and_events() {
    let framework = started_framework();
    let events = module_event_log(&framework);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));

    let module = framework
        .install_module(
            activator_table("leaky", &log, false, false),
            ModuleInfo::new("leaky", "/m/leaky"),
        )
        .unwrap();
    assert_eq!(module.state(), ModuleState::Installed);

    module.start().unwrap();
    assert_eq!(module.state(), ModuleState::Active);
    assert!(module.context().is_some());
    assert_eq!(log.lock().unwrap().as_slice(), ["load leaky"]);

    // starting again is a warned no-op
    module.start().unwrap();
    assert_eq!(log.lock().unwrap().len(), 1);

    module.stop().unwrap();
    assert_eq!(module.state(), ModuleState::Installed);
    assert!(module.context().is_none());
    assert_eq!(log.lock().unwrap().as_slice(), ["load leaky", "unload leaky"]);

    let seen: Vec<(ModuleEventType, String)> = events.lock().unwrap().clone();
    let leaky: Vec<ModuleEventType> = seen
        .iter()
        .filter(|(_, name)| name == "leaky")
        .map(|(t, _)| *t)
        .collect();
    assert_eq!(
        leaky,
        [
            ModuleEventType::Installed,
            ModuleEventType::Loading,
            ModuleEventType::Loaded,
            ModuleEventType::Unloading,
            ModuleEventType::Unloaded,
        ]
    );
}

#[test]
fn test_activator_less_module() {
    let framework = started_framework();
    let module = framework
        .install_module(
            Arc::new(SymbolTable::new()),
            ModuleInfo::new("plain", "/m/plain"),
        )
        .unwrap();

    module.start().unwrap();
    assert_eq!(module.state(), ModuleState::Active);
    module.stop().unwrap();
    assert_eq!(module.state(), ModuleState::Installed);
}

#[test]
fn test_load_failure_rolls_back() {
    struct PartialActivator;
    impl ModuleActivator for PartialActivator {
        fn load(&mut self, context: &Arc<ModuleContext>) -> Result<()> {
            // a partial registration that must be rolled back
            context.register_service(
                &["test.Partial"],
                Arc::new(1u8),
                Properties::new(),
            )?;
            Err(Error::invalid_argument("load refused"))
        }
        fn unload(&mut self, _context: &Arc<ModuleContext>) -> Result<()> {
            Ok(())
        }
    }

    let framework = started_framework();
    let errors = Arc::new(Mutex::new(Vec::<FrameworkEvent>::new()));
    {
        let errors = errors.clone();
        framework
            .context()
            .unwrap()
            .add_framework_listener(&FrameworkListener::from_closure(move |e| {
                if e.event_type() == FrameworkEventType::Error {
                    errors.lock().unwrap().push(e.clone());
                }
            }))
            .unwrap();
    }

    let table = SymbolTable::new();
    table.provide_activator("partial", || Box::new(PartialActivator) as BoxedActivator);
    let module = framework
        .install_module(Arc::new(table), ModuleInfo::new("partial", "/m/partial"))
        .unwrap();

    let err = module.start().unwrap_err();
    assert!(matches!(err, Error::ActivatorFailure { .. }));
    assert_eq!(module.state(), ModuleState::Installed);
    assert!(module.context().is_none());

    // the partial registration is gone
    let refs = framework
        .context()
        .unwrap()
        .get_service_references("test.Partial", None)
        .unwrap();
    assert!(refs.is_empty());

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].module().unwrap().name(), "partial");
}

#[test]
fn test_load_panic_is_captured() {
    let framework = started_framework();
    let table = SymbolTable::new();
    struct PanickyActivator;
    impl ModuleActivator for PanickyActivator {
        fn load(&mut self, _context: &Arc<ModuleContext>) -> Result<()> {
            panic!("activator blew up");
        }
        fn unload(&mut self, _context: &Arc<ModuleContext>) -> Result<()> {
            Ok(())
        }
    }
    table.provide_activator("panicky", || Box::new(PanickyActivator) as BoxedActivator);

    let module = framework
        .install_module(Arc::new(table), ModuleInfo::new("panicky", "/m/panicky"))
        .unwrap();
    let err = module.start().unwrap_err();
    assert!(err.to_string().contains("activator blew up"));
    assert_eq!(module.state(), ModuleState::Installed);
}

#[test]
fn test_unload_failure_still_uninits() {
    let framework = started_framework();
    let events = module_event_log(&framework);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));

    let module = framework
        .install_module(
            activator_table("grumpy", &log, false, true),
            ModuleInfo::new("grumpy", "/m/grumpy"),
        )
        .unwrap();
    module.start().unwrap();

    let err = module.stop().unwrap_err();
    assert!(matches!(err, Error::ActivatorFailure { .. }));
    // uninit ran regardless
    assert_eq!(module.state(), ModuleState::Installed);
    assert!(module.context().is_none());
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|(t, name)| *t == ModuleEventType::Unloaded && name == "grumpy"));
}

#[test]
fn test_uninstall_is_terminal() {
    let framework = started_framework();
    let events = module_event_log(&framework);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));

    let module = framework
        .install_module(
            activator_table("gone", &log, false, false),
            ModuleInfo::new("gone", "/m/gone"),
        )
        .unwrap();
    module.start().unwrap();

    framework.uninstall_module(&module).unwrap();
    assert_eq!(module.state(), ModuleState::Uninstalled);
    assert_eq!(log.lock().unwrap().as_slice(), ["load gone", "unload gone"]);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|(t, name)| *t == ModuleEventType::Uninstalled && name == "gone"));
    assert!(module.start().is_err());

    // the name is free again
    framework
        .install_module(Arc::new(SymbolTable::new()), ModuleInfo::new("gone", "/m/gone2"))
        .unwrap();
}

#[test]
fn test_install_requires_live_framework() {
    let framework = started_framework();
    framework.stop().unwrap();
    let err = framework
        .install_module(Arc::new(SymbolTable::new()), ModuleInfo::new("late", "/m/late"))
        .unwrap_err();
    assert!(matches!(err, Error::IllegalState { .. }));
}

#[test]
fn test_registered_services_accessor() {
    struct Registering;
    impl ModuleActivator for Registering {
        fn load(&mut self, context: &Arc<ModuleContext>) -> Result<()> {
            context.register_service(&["test.Svc"], Arc::new(7u32), Properties::new())?;
            Ok(())
        }
        fn unload(&mut self, _context: &Arc<ModuleContext>) -> Result<()> {
            Ok(())
        }
    }

    let framework = started_framework();
    let table = SymbolTable::new();
    table.provide_activator("publisher", || Box::new(Registering) as BoxedActivator);
    let module = framework
        .install_module(Arc::new(table), ModuleInfo::new("publisher", "/m/publisher"))
        .unwrap();

    module.start().unwrap();
    assert_eq!(module.registered_services().len(), 1);

    module.stop().unwrap();
    assert!(module.registered_services().is_empty());
}

#[test]
fn test_autoload_failures_surface_as_error_events() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("aa");
    std::fs::create_dir(&nested).unwrap();
    // not real shared objects: loading them must fail, and the failures
    // must surface as ERROR events without aborting the starter
    std::fs::write(nested.join("libinner.so"), b"not a library").unwrap();
    std::fs::write(dir.path().join("libouter.so"), b"not a library").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

    let framework = Framework::new(FrameworkConfig::new().with_autoload(true));
    framework.start().unwrap();

    let errors = Arc::new(Mutex::new(Vec::<FrameworkEvent>::new()));
    {
        let errors = errors.clone();
        framework
            .context()
            .unwrap()
            .add_framework_listener(&FrameworkListener::from_closure(move |e| {
                if e.event_type() == FrameworkEventType::Error {
                    errors.lock().unwrap().push(e.clone());
                }
            }))
            .unwrap();
    }

    let mut info = ModuleInfo::new("loader", "/m/loader");
    info.autoload_dir = Some(dir.path().to_path_buf());
    let module = framework
        .install_module(Arc::new(SymbolTable::new()), info)
        .unwrap();

    // autoload failures do not abort the start
    module.start().unwrap();
    assert_eq!(module.state(), ModuleState::Active);

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 2);
    for event in errors.iter() {
        assert!(matches!(
            event.error_detail().unwrap().as_ref(),
            Error::AutoloadFailure { .. }
        ));
    }
    // depth-first, lexicographic: aa/libinner.so before libouter.so
    assert!(errors[0].message().contains("libinner.so"));
    assert!(errors[1].message().contains("libouter.so"));
}

#[test]
fn test_autoload_dir_from_manifest_key() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("libbad.so"), b"nope").unwrap();

    let framework = Framework::new(FrameworkConfig::new().with_autoload(true));
    framework.start().unwrap();

    let errors = Arc::new(Mutex::new(0usize));
    {
        let errors = errors.clone();
        framework
            .context()
            .unwrap()
            .add_framework_listener(&FrameworkListener::from_closure(move |e| {
                if e.event_type() == FrameworkEventType::Error {
                    *errors.lock().unwrap() += 1;
                }
            }))
            .unwrap();
    }

    let mut info = ModuleInfo::new("manifested", "/m/manifested");
    info.manifest.insert(
        Module::PROP_AUTOLOAD_DIR.to_string(),
        AnyValue::from(dir.path().to_string_lossy().as_ref()),
    );
    framework
        .install_module(Arc::new(SymbolTable::new()), info)
        .unwrap()
        .start()
        .unwrap();

    assert_eq!(*errors.lock().unwrap(), 1);
}
