//! Module version numbers.
//!
//! Versions follow the `major.minor.micro[.qualifier]` scheme; the
//! qualifier is a lexicographic tie-break. A default-constructed version
//! is "undefined" and renders as an empty string; it compares below every
//! defined version.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// A dotted module version: `major.minor.micro[.qualifier]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleVersion {
    major: u32,
    minor: u32,
    micro: u32,
    qualifier: String,
    defined: bool,
}

impl ModuleVersion {
    /// Creates a defined version without a qualifier.
    pub fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor,
            micro,
            qualifier: String::new(),
            defined: true,
        }
    }

    /// Creates a defined version with a qualifier.
    pub fn with_qualifier(major: u32, minor: u32, micro: u32, qualifier: impl Into<String>) -> Self {
        Self {
            major,
            minor,
            micro,
            qualifier: qualifier.into(),
            defined: true,
        }
    }

    /// Whether this version was parsed or constructed (as opposed to the
    /// undefined default).
    pub fn is_defined(&self) -> bool {
        self.defined
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn micro(&self) -> u32 {
        self.micro
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }
}

impl FromStr for ModuleVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(ModuleVersion::default());
        }
        let mut parts = s.splitn(4, '.');
        let parse_num = |part: Option<&str>, what: &str| -> Result<u32, Error> {
            match part {
                None => Ok(0),
                Some(p) => p.parse::<u32>().map_err(|_| {
                    Error::invalid_argument(format!("invalid {} version component in '{}'", what, s))
                }),
            }
        };
        let major = parse_num(parts.next(), "major")?;
        let minor = parse_num(parts.next(), "minor")?;
        let micro = parse_num(parts.next(), "micro")?;
        let qualifier = parts.next().unwrap_or("").to_string();
        Ok(Self {
            major,
            minor,
            micro,
            qualifier,
            defined: true,
        })
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.defined {
            return Ok(());
        }
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)?;
        if !self.qualifier.is_empty() {
            write!(f, ".{}", self.qualifier)?;
        }
        Ok(())
    }
}

impl PartialOrd for ModuleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModuleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // Undefined sorts below everything; the qualifier is the final,
        // lexicographic tie-break (an empty qualifier sorts first).
        (self.defined, self.major, self.minor, self.micro, &self.qualifier).cmp(&(
            other.defined,
            other.major,
            other.minor,
            other.micro,
            &other.qualifier,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let v: ModuleVersion = "1.2.3.beta".parse().unwrap();
        assert_eq!(v.major(), 1);
        assert_eq!(v.minor(), 2);
        assert_eq!(v.micro(), 3);
        assert_eq!(v.qualifier(), "beta");
        assert_eq!(v.to_string(), "1.2.3.beta");
    }

    #[test]
    fn test_parse_partial() {
        let v: ModuleVersion = "2.1".parse().unwrap();
        assert_eq!(v, ModuleVersion::new(2, 1, 0));
    }

    #[test]
    fn test_parse_invalid() {
        assert!("1.x.3".parse::<ModuleVersion>().is_err());
    }

    #[test]
    fn test_undefined() {
        let v: ModuleVersion = "".parse().unwrap();
        assert!(!v.is_defined());
        assert_eq!(v.to_string(), "");
        assert!(v < ModuleVersion::new(0, 0, 0));
    }

    #[test]
    fn test_ordering() {
        let a = ModuleVersion::with_qualifier(1, 0, 0, "alpha");
        let b = ModuleVersion::with_qualifier(1, 0, 0, "beta");
        assert!(a < b);
        assert!(ModuleVersion::new(1, 0, 0) < a);
        assert!(ModuleVersion::new(1, 0, 1) > b);
    }
}
