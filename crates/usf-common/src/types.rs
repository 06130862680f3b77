//! Identifier newtypes used throughout the framework.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Module identifier - a 64-bit id assigned at install time, strictly
/// monotone over install order. The framework itself is module 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ModuleId(i64);

impl ModuleId {
    /// The framework's own module id.
    pub const FRAMEWORK: ModuleId = ModuleId(0);

    /// Creates a ModuleId from a raw value.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Service identifier - a 64-bit id assigned at registration time,
/// strictly monotone within a process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ServiceId(i64);

impl ServiceId {
    /// Creates a ServiceId from a raw value.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_id_ordering() {
        assert!(ModuleId::new(1) < ModuleId::new(2));
        assert_eq!(ModuleId::FRAMEWORK.get(), 0);
    }

    #[test]
    fn test_service_id_display() {
        assert_eq!(ServiceId::new(42).to_string(), "42");
    }
}
