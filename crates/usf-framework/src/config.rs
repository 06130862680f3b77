//! Framework configuration.
//!
//! Configuration is supplied once, at [`Framework::new`](crate::Framework::new)
//! time, and is read-only afterwards. Framework properties are an open
//! `AnyValue` map; the keys the framework itself recognizes are exported
//! as constants.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

use usf_common::{AnyValue, Properties};

/// Framework property enabling the diagnostic log sink.
pub const FRAMEWORK_LOG: &str = "org.cppmicroservices.framework.log";

/// A thread-shared diagnostic sink receiving free-form log lines.
///
/// The framework serializes its own writes; sharing the sink with other
/// writers is the owner's responsibility.
pub type LogSink = Arc<Mutex<dyn Write + Send>>;

/// Immutable framework configuration.
#[derive(Clone, Default)]
pub struct FrameworkConfig {
    autoload: bool,
    properties: Properties,
    log_sink: Option<LogSink>,
}

impl FrameworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables scanning of module autoload directories at start.
    pub fn with_autoload(mut self, enabled: bool) -> Self {
        self.autoload = enabled;
        self
    }

    /// Sets a framework property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<AnyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Installs the diagnostic log sink and flags [`FRAMEWORK_LOG`].
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self.properties
            .insert(FRAMEWORK_LOG.to_string(), AnyValue::Bool(true));
        self
    }

    pub fn autoload_enabled(&self) -> bool {
        self.autoload
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub(crate) fn log_sink(&self) -> Option<&LogSink> {
        self.log_sink.as_ref()
    }
}

// The sink is not Debug; render the rest.
impl fmt::Debug for FrameworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameworkConfig")
            .field("autoload", &self.autoload)
            .field("properties", &self.properties)
            .field("log_sink", &self.log_sink.is_some())
            .finish()
    }
}
