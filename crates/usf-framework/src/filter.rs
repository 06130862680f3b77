//! LDAP-style service property filters.
//!
//! Grammar (RFC 1960 shaped):
//!
//! ```text
//! filter     = '(' filtercomp ')'
//! filtercomp = '&' filterlist | '|' filterlist | '!' filter | item
//! filterlist = filter+
//! item       = attr '=' '*'                  ; presence
//!            | attr '=' value                ; equality / substring (with '*')
//!            | attr '>=' value | attr '<=' value
//!            | attr '~=' value               ; approximate
//! ```
//!
//! Matching is a pure function over `(filter, properties)`. Equality
//! compares by value type tag, relational operators coerce numerically,
//! and `~=` is a case-insensitive substring match. Attribute keys are
//! case-sensitive. Whitespace is ignored only between terms.

use usf_common::{AnyValue, Error, Properties, Result};

/// A parsed, immutable service filter.
#[derive(Debug, Clone)]
pub struct Filter {
    raw: String,
    node: Node,
}

#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Present(String),
    Equals(String, String),
    Substring(String, Vec<String>),
    GreaterEq(String, String),
    LessEq(String, String),
    Approx(String, String),
}

impl Filter {
    /// Parses a filter expression. Malformed input fails with
    /// `InvalidFilter`; no framework events are generated.
    pub fn new(expr: &str) -> Result<Filter> {
        let mut parser = Parser {
            bytes: expr.as_bytes(),
            pos: 0,
            raw: expr,
        };
        parser.skip_ws();
        let node = parser.parse_filter()?;
        parser.skip_ws();
        if parser.pos != parser.bytes.len() {
            return Err(parser.error("trailing characters after filter"));
        }
        Ok(Filter {
            raw: expr.to_string(),
            node,
        })
    }

    /// The original filter text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Evaluates the filter against a property map.
    pub fn matches(&self, props: &Properties) -> bool {
        self.node.matches(props)
    }
}

impl Node {
    fn matches(&self, props: &Properties) -> bool {
        match self {
            Node::And(children) => children.iter().all(|c| c.matches(props)),
            Node::Or(children) => children.iter().any(|c| c.matches(props)),
            Node::Not(child) => !child.matches(props),
            Node::Present(attr) => props.contains_key(attr),
            Node::Equals(attr, literal) => props
                .get(attr)
                .map_or(false, |v| value_matches_eq(v, literal)),
            Node::Substring(attr, parts) => props
                .get(attr)
                .map_or(false, |v| value_matches_substring(v, parts)),
            Node::GreaterEq(attr, literal) => compare_numeric(props.get(attr), literal, |o| o >= 0.0),
            Node::LessEq(attr, literal) => compare_numeric(props.get(attr), literal, |o| o <= 0.0),
            Node::Approx(attr, literal) => props
                .get(attr)
                .map_or(false, |v| value_matches_approx(v, literal)),
        }
    }
}

/// Equality by type tag: the literal is interpreted in the property's own
/// type. A list matches if any element matches.
fn value_matches_eq(value: &AnyValue, literal: &str) -> bool {
    match value {
        AnyValue::Bool(b) => literal.parse::<bool>().map_or(false, |l| l == *b),
        AnyValue::Int(i) => literal.parse::<i64>().map_or(false, |l| l == *i),
        AnyValue::Float(f) => literal.parse::<f64>().map_or(false, |l| l == *f),
        AnyValue::String(s) => s == literal,
        AnyValue::List(items) => items.iter().any(|v| value_matches_eq(v, literal)),
    }
}

/// `a*b*c` wildcard match over string values.
fn value_matches_substring(value: &AnyValue, parts: &[String]) -> bool {
    match value {
        AnyValue::String(s) => substring_match(s, parts),
        AnyValue::List(items) => items.iter().any(|v| value_matches_substring(v, parts)),
        _ => false,
    }
}

fn substring_match(s: &str, parts: &[String]) -> bool {
    // parts are the literal fragments between '*'s; empty fragments at the
    // ends anchor nothing.
    let mut rest = s;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            // anchored prefix
            match rest.strip_prefix(part.as_str()) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            // anchored suffix
            return rest.ends_with(part.as_str());
        } else {
            match rest.find(part.as_str()) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    // a non-empty trailing fragment returns inside the loop; reaching here
    // means the pattern ends in '*' and any remainder is fine
    true
}

fn compare_numeric(value: Option<&AnyValue>, literal: &str, accept: fn(f64) -> bool) -> bool {
    let (Some(v), Ok(l)) = (value.and_then(AnyValue::as_f64), literal.parse::<f64>()) else {
        return false;
    };
    accept(v - l)
}

fn value_matches_approx(value: &AnyValue, literal: &str) -> bool {
    match value {
        AnyValue::String(s) => s.to_lowercase().contains(&literal.to_lowercase()),
        AnyValue::List(items) => items.iter().any(|v| value_matches_approx(v, literal)),
        // fall back to tag equality for non-strings
        _ => value_matches_eq(value, literal),
    }
}

// =============================================================================
// Parser
// =============================================================================

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    raw: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> Error {
        Error::invalid_filter(self.raw, format!("{} at offset {}", message.into(), self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, b: u8) -> Result<()> {
        match self.peek() {
            Some(c) if c == b => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error(format!("expected '{}'", b as char))),
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn parse_filter(&mut self) -> Result<Node> {
        self.expect(b'(')?;
        let node = self.parse_filtercomp()?;
        self.expect(b')')?;
        Ok(node)
    }

    fn parse_filtercomp(&mut self) -> Result<Node> {
        match self.peek() {
            Some(b'&') => {
                self.bump();
                Ok(Node::And(self.parse_filterlist()?))
            }
            Some(b'|') => {
                self.bump();
                Ok(Node::Or(self.parse_filterlist()?))
            }
            Some(b'!') => {
                self.bump();
                self.skip_ws();
                Ok(Node::Not(Box::new(self.parse_filter()?)))
            }
            Some(_) => self.parse_item(),
            None => Err(self.error("unexpected end of filter")),
        }
    }

    fn parse_filterlist(&mut self) -> Result<Vec<Node>> {
        let mut children = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'(') => children.push(self.parse_filter()?),
                _ => break,
            }
        }
        if children.is_empty() {
            return Err(self.error("empty operand list"));
        }
        Ok(children)
    }

    fn parse_item(&mut self) -> Result<Node> {
        let attr = self.parse_attr()?;
        match self.bump() {
            Some(b'=') => {
                let value = self.parse_value()?;
                if value == "*" {
                    Ok(Node::Present(attr))
                } else if value.contains('*') {
                    let parts = value.split('*').map(str::to_string).collect();
                    Ok(Node::Substring(attr, parts))
                } else {
                    Ok(Node::Equals(attr, value))
                }
            }
            Some(b'>') => {
                self.expect(b'=')?;
                Ok(Node::GreaterEq(attr, self.parse_value()?))
            }
            Some(b'<') => {
                self.expect(b'=')?;
                Ok(Node::LessEq(attr, self.parse_value()?))
            }
            Some(b'~') => {
                self.expect(b'=')?;
                Ok(Node::Approx(attr, self.parse_value()?))
            }
            _ => Err(self.error("expected comparison operator")),
        }
    }

    fn parse_attr(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'=' | b'>' | b'<' | b'~' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let attr = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.error("attribute is not valid UTF-8"))?
            .trim()
            .to_string();
        if attr.is_empty() {
            return Err(self.error("empty attribute name"));
        }
        Ok(attr)
    }

    fn parse_value(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b')' {
                break;
            }
            if b == b'(' {
                return Err(self.error("'(' not allowed in value"));
            }
            self.pos += 1;
        }
        let value = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.error("value is not valid UTF-8"))?
            .to_string();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usf_common::AnyValue;

    fn props() -> Properties {
        let mut p = Properties::new();
        p.insert("x".into(), AnyValue::Int(5));
        p.insert("y".into(), AnyValue::from("foo"));
        p
    }

    #[test]
    fn test_equality_and_relational() {
        let p = props();
        assert!(Filter::new("(&(x>=3)(y=foo))").unwrap().matches(&p));
        assert!(!Filter::new("(x>=6)").unwrap().matches(&p));
        assert!(Filter::new("(y=*)").unwrap().matches(&p));
    }

    #[test]
    fn test_type_tag_equality() {
        let p = props();
        // x is an Int; "5" parses, "foo" does not
        assert!(Filter::new("(x=5)").unwrap().matches(&p));
        assert!(!Filter::new("(x=foo)").unwrap().matches(&p));
        // y is a String; equality is exact and case-sensitive
        assert!(!Filter::new("(y=FOO)").unwrap().matches(&p));
    }

    #[test]
    fn test_boolean_composition() {
        let p = props();
        assert!(Filter::new("(|(x=1)(y=foo))").unwrap().matches(&p));
        assert!(Filter::new("(!(x=1))").unwrap().matches(&p));
        assert!(Filter::new("(&(x>=1)(x<=9)(!(y=bar)))").unwrap().matches(&p));
        assert!(!Filter::new("(&(x>=1)(y=bar))").unwrap().matches(&p));
    }

    #[test]
    fn test_substring() {
        let mut p = Properties::new();
        p.insert("name".into(), AnyValue::from("service-registry"));
        assert!(Filter::new("(name=service*)").unwrap().matches(&p));
        assert!(Filter::new("(name=*registry)").unwrap().matches(&p));
        assert!(Filter::new("(name=ser*reg*)").unwrap().matches(&p));
        assert!(!Filter::new("(name=registry*)").unwrap().matches(&p));
    }

    #[test]
    fn test_approx_case_insensitive_substring() {
        let p = props();
        assert!(Filter::new("(y~=FO)").unwrap().matches(&p));
        assert!(!Filter::new("(y~=bar)").unwrap().matches(&p));
    }

    #[test]
    fn test_list_membership() {
        let mut p = Properties::new();
        p.insert(
            "objectclass".into(),
            AnyValue::List(vec![AnyValue::from("a.A"), AnyValue::from("b.B")]),
        );
        assert!(Filter::new("(objectclass=b.B)").unwrap().matches(&p));
        assert!(!Filter::new("(objectclass=c.C)").unwrap().matches(&p));
    }

    #[test]
    fn test_whitespace_between_terms() {
        let p = props();
        assert!(Filter::new("(&  (x=5)  (y=foo) )").unwrap().matches(&p));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let p = props();
        assert!(!Filter::new("(z=1)").unwrap().matches(&p));
        assert!(!Filter::new("(z>=1)").unwrap().matches(&p));
        // but negation of a missing attribute does
        assert!(Filter::new("(!(z=1))").unwrap().matches(&p));
    }

    #[test]
    fn test_malformed() {
        for expr in ["", "(", "(x=1", "x=1", "(&)", "((x=1))", "(x=1)(y=2)", "(x>1)"] {
            let err = Filter::new(expr).unwrap_err();
            assert!(
                matches!(err, Error::InvalidFilter { .. }),
                "expected InvalidFilter for {:?}",
                expr
            );
        }
    }
}
