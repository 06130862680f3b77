//! Error types for the USF framework.
//!
//! All fallible framework operations return [`Result`]. Errors that cross
//! the host boundary carry enough context (module name, symbol, filter
//! text) to be actionable without a backtrace.

use thiserror::Error;

use crate::types::ServiceId;

/// Result type alias for framework operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for framework operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid input to a framework operation.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A syntactically malformed service filter expression.
    #[error("Invalid filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    /// A module was not found.
    #[error("Module not found: {module}")]
    ModuleNotFound { module: String },

    /// The service registration behind a reference has been withdrawn.
    #[error("Service withdrawn: service.id={service_id}")]
    ServiceWithdrawn { service_id: ServiceId },

    /// A module activator failed during load or unload.
    #[error("Activator failure in module '{module}': {message}")]
    ActivatorFailure { module: String, message: String },

    /// The dynamic symbol lookup facility reported a failure.
    #[error("Symbol resolution failed for '{symbol}': {message}")]
    SymbolResolutionFailure { symbol: String, message: String },

    /// A module could not be installed from an autoload directory.
    #[error("Autoload failure for '{path}': {message}")]
    AutoloadFailure { path: String, message: String },

    /// Operation invoked in a state that does not permit it.
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// A listener or activator callback panicked; the payload message is
    /// preserved for framework error events.
    #[error("{message}")]
    CallbackPanic { message: String },

    /// I/O error (wraps std::io::Error).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates an InvalidArgument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an InvalidFilter error.
    pub fn invalid_filter(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFilter {
            filter: filter.into(),
            message: message.into(),
        }
    }

    /// Creates a ModuleNotFound error.
    pub fn module_not_found(module: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module: module.into(),
        }
    }

    /// Creates a ServiceWithdrawn error.
    pub fn service_withdrawn(service_id: ServiceId) -> Self {
        Self::ServiceWithdrawn { service_id }
    }

    /// Creates an ActivatorFailure error.
    pub fn activator_failure(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ActivatorFailure {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Creates a SymbolResolutionFailure error.
    pub fn symbol_resolution_failure(
        symbol: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::SymbolResolutionFailure {
            symbol: symbol.into(),
            message: message.into(),
        }
    }

    /// Creates an AutoloadFailure error.
    pub fn autoload_failure(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AutoloadFailure {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an IllegalState error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Creates a CallbackPanic error from a captured panic message.
    pub fn callback_panic(message: impl Into<String>) -> Self {
        Self::CallbackPanic {
            message: message.into(),
        }
    }
}
