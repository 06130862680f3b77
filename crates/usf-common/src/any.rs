//! Dynamically-typed property values.
//!
//! Manifests and service properties carry values of mixed type. [`AnyValue`]
//! is the framework's tagged value type: equality is by type tag plus value,
//! and the numeric variants coerce to `f64` for relational filter
//! comparisons.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A property map with case-sensitive string keys.
pub type Properties = HashMap<String, AnyValue>;

/// A dynamically-typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnyValue {
    /// Boolean value.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    List(Vec<AnyValue>),
}

impl AnyValue {
    /// Returns the type tag name, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            AnyValue::Bool(_) => "bool",
            AnyValue::Int(_) => "int",
            AnyValue::Float(_) => "float",
            AnyValue::String(_) => "string",
            AnyValue::List(_) => "list",
        }
    }

    /// Numeric coercion for relational comparisons. `Int` and `Float`
    /// coerce; everything else is non-numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AnyValue::Int(i) => Some(*i as f64),
            AnyValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the string slice for `String` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AnyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer for `Int` values.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AnyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean for `Bool` values.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AnyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyValue::Bool(b) => write!(f, "{}", b),
            AnyValue::Int(i) => write!(f, "{}", i),
            AnyValue::Float(v) => write!(f, "{}", v),
            AnyValue::String(s) => write!(f, "{}", s),
            AnyValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for AnyValue {
    fn from(v: bool) -> Self {
        AnyValue::Bool(v)
    }
}

impl From<i32> for AnyValue {
    fn from(v: i32) -> Self {
        AnyValue::Int(v as i64)
    }
}

impl From<i64> for AnyValue {
    fn from(v: i64) -> Self {
        AnyValue::Int(v)
    }
}

impl From<f64> for AnyValue {
    fn from(v: f64) -> Self {
        AnyValue::Float(v)
    }
}

impl From<&str> for AnyValue {
    fn from(v: &str) -> Self {
        AnyValue::String(v.to_string())
    }
}

impl From<String> for AnyValue {
    fn from(v: String) -> Self {
        AnyValue::String(v)
    }
}

impl From<Vec<AnyValue>> for AnyValue {
    fn from(v: Vec<AnyValue>) -> Self {
        AnyValue::List(v)
    }
}
