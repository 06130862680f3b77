//! Activator discovery through native symbol resolution.
//!
//! A module's activator entry point is a C-linkage, zero-argument function
//! named `_us_module_activator_instance_<module_name>` returning an owned
//! activator. Discovery is isolated behind [`SymbolResolver`] so that the
//! lifecycle code never touches the OS loader directly and test builds can
//! substitute an in-memory [`SymbolTable`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use usf_common::Result;

use crate::context::ModuleContext;

/// Per-module activation hooks.
///
/// `load` runs while the module transitions to active; this is where the
/// module registers its services and listeners through the supplied
/// context. `unload` releases whatever `load` set up. Both may fail; the
/// lifecycle rules for failure are on [`Module::start`](crate::Module::start)
/// and [`Module::stop`](crate::Module::stop).
pub trait ModuleActivator: Send {
    fn load(&mut self, context: &Arc<ModuleContext>) -> Result<()>;
    fn unload(&mut self, context: &Arc<ModuleContext>) -> Result<()>;
}

/// An owned, type-erased activator.
pub type BoxedActivator = Box<dyn ModuleActivator>;

/// A one-shot constructor for a module's activator, produced by symbol
/// resolution.
pub type ActivatorFactory = Box<dyn FnOnce() -> BoxedActivator + Send>;

/// Symbol name prefix for activator entry points.
pub const ACTIVATOR_SYMBOL_PREFIX: &str = "_us_module_activator_instance_";

/// The canonical activator symbol name for a module.
pub fn activator_symbol(module_name: &str) -> String {
    format!("{}{}", ACTIVATOR_SYMBOL_PREFIX, module_name)
}

/// Resolves activator entry points for one module image.
pub trait SymbolResolver: Send + Sync {
    /// Looks up `symbol`. Absence is not an error: an activator-less
    /// module fires only lifecycle events. A failure of the resolution
    /// facility itself is `SymbolResolutionFailure`.
    fn activator_instance(&self, symbol: &str) -> Result<Option<ActivatorFactory>>;
}

// =============================================================================
// In-memory symbol table
// =============================================================================

/// An in-memory symbol table, the test-build substitute for the OS loader.
///
/// Factories are reusable: every resolution hands out a fresh activator.
#[derive(Default)]
pub struct SymbolTable {
    entries: RwLock<HashMap<String, Arc<dyn Fn() -> BoxedActivator + Send + Sync>>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under an explicit symbol name.
    pub fn provide<F>(&self, symbol: impl Into<String>, factory: F)
    where
        F: Fn() -> BoxedActivator + Send + Sync + 'static,
    {
        self.entries
            .write()
            .unwrap()
            .insert(symbol.into(), Arc::new(factory));
    }

    /// Registers a factory under the canonical symbol for `module_name`.
    pub fn provide_activator<F>(&self, module_name: &str, factory: F)
    where
        F: Fn() -> BoxedActivator + Send + Sync + 'static,
    {
        self.provide(activator_symbol(module_name), factory);
    }
}

impl SymbolResolver for SymbolTable {
    fn activator_instance(&self, symbol: &str) -> Result<Option<ActivatorFactory>> {
        let factory = self.entries.read().unwrap().get(symbol).cloned();
        Ok(factory.map(|f| Box::new(move || f()) as ActivatorFactory))
    }
}

// =============================================================================
// Dynamic library resolution (dlopen)
// =============================================================================

#[cfg(unix)]
pub use self::unix::DynamicLibrary;

/// Raw signature of an exported activator entry point.
pub type ActivatorInstanceFn = unsafe extern "C" fn() -> *mut BoxedActivator;

/// Exports an activator entry point from a module crate.
///
/// The symbol name must be spelled out in full so the linker sees it:
///
/// ```rust,ignore
/// use usf_framework::module_activator;
///
/// #[derive(Default)]
/// struct Activator;
/// impl usf_framework::ModuleActivator for Activator { /* ... */ }
///
/// module_activator!(_us_module_activator_instance_mymodule, Activator);
/// ```
#[macro_export]
macro_rules! module_activator {
    ($symbol:ident, $activator:ty) => {
        #[no_mangle]
        pub extern "C" fn $symbol() -> *mut $crate::BoxedActivator {
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(
                ::std::boxed::Box::new(<$activator as ::std::default::Default>::default())
                    as $crate::BoxedActivator,
            ))
        }
    };
}

#[cfg(unix)]
mod unix {
    use std::ffi::{CStr, CString};
    use std::path::{Path, PathBuf};

    use usf_common::{Error, Result};

    use super::{ActivatorFactory, ActivatorInstanceFn, SymbolResolver};

    /// A shared-library module image opened with `dlopen`.
    ///
    /// The handle stays open for the lifetime of the value; it is closed
    /// on drop, which must not happen while activator code from the image
    /// can still run. The owning `Module` guarantees that ordering.
    pub struct DynamicLibrary {
        handle: *mut libc::c_void,
        path: PathBuf,
    }

    // dlopen handles are process-global and the libc calls used here are
    // thread-safe.
    unsafe impl Send for DynamicLibrary {}
    unsafe impl Sync for DynamicLibrary {}

    impl DynamicLibrary {
        /// Opens a shared library with `RTLD_NOW | RTLD_LOCAL`.
        pub fn open(path: &Path) -> Result<Self> {
            let c_path = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| {
                Error::invalid_argument(format!("library path contains NUL: {}", path.display()))
            })?;
            let handle =
                unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
            if handle.is_null() {
                return Err(Error::symbol_resolution_failure(
                    path.display().to_string(),
                    last_dl_error(),
                ));
            }
            Ok(Self {
                handle,
                path: path.to_path_buf(),
            })
        }

        /// The path the library was opened from.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl SymbolResolver for DynamicLibrary {
        fn activator_instance(&self, symbol: &str) -> Result<Option<ActivatorFactory>> {
            let c_symbol = CString::new(symbol).map_err(|_| {
                Error::symbol_resolution_failure(symbol, "symbol name contains NUL")
            })?;
            unsafe { libc::dlerror() }; // clear any stale error
            let sym = unsafe { libc::dlsym(self.handle, c_symbol.as_ptr()) };
            if sym.is_null() {
                // absent symbol: activator-less module
                return Ok(None);
            }
            let hook: ActivatorInstanceFn = unsafe { std::mem::transmute(sym) };
            Ok(Some(Box::new(move || unsafe {
                *Box::from_raw(hook())
            })))
        }
    }

    impl Drop for DynamicLibrary {
        fn drop(&mut self) {
            let rc = unsafe { libc::dlclose(self.handle) };
            if rc != 0 {
                tracing::warn!(
                    "[Symbols] dlclose failed for {}: {}",
                    self.path.display(),
                    last_dl_error()
                );
            }
        }
    }

    fn last_dl_error() -> String {
        let err = unsafe { libc::dlerror() };
        if err.is_null() {
            "unknown loader error".to_string()
        } else {
            unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
        }
    }
}
