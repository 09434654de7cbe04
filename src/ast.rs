//! Immutable predicate AST.
//!
//! Nodes are constructed once and never mutated; equality is structural and
//! `Hash` is derived so compiled filter strings can be cached by AST value.
//! The Compiler (`crate::compiler`) is the only consumer that interprets
//! these nodes; everything else treats them as opaque, comparable values.

use std::fmt;

/// A field reference, optionally qualified through a join/association.
///
/// String form is `"$<assoc>.<name>"` when joined, else just `"<name>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub name: String,
    pub assoc: Option<String>,
}

impl FieldRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), assoc: None }
    }

    pub fn joined(assoc: impl Into<String>, name: impl Into<String>) -> Self {
        Self { name: name.into(), assoc: Some(assoc.into()) }
    }

    pub fn is_joined(&self) -> bool {
        self.assoc.is_some()
    }

    /// Parses `"$assoc.field"` or a plain `"field"`. Does not validate the
    /// identifier shape — callers validate separately via `is_valid_ident`.
    pub fn parse(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix('$') {
            if let Some((assoc, name)) = rest.split_once('.') {
                return FieldRef::joined(assoc, name);
            }
        }
        FieldRef::new(s)
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.assoc {
            Some(a) => write!(f, "${}.{}", a, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Identifiers must match `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A scalar or list value used on the right-hand side of a predicate.
///
/// Lists of mixed primitive scalars are allowed (membership tests); nested
/// lists are rejected at construction (`Value::list`).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
}

impl Value {
    /// Builds a `List` value, rejecting nested lists.
    pub fn list(items: Vec<Value>) -> Result<Self, crate::error::Error> {
        if items.iter().any(|v| matches!(v, Value::List(_))) {
            return Err(crate::error::Error::InvalidType(
                "nested lists are not supported in membership values".into(),
            ));
        }
        Ok(Value::List(items))
    }

    pub fn is_empty_list(&self) -> bool {
        matches!(self, Value::List(items) if items.is_empty())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

// f64 has no total order; PartialEq on Value is still useful for AST
// structural equality in tests, where NaN never appears.
impl Eq for Value {}
impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) => {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Value::List(items) => {
                5u8.hash(state);
                items.hash(state);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// A pattern used by `Matches`/`Prefix`. Preserved verbatim by the AST even
/// when the compiler's target grammar cannot render it: the compiler raises
/// `UnsupportedNode` rather than silently degrading.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern(pub String);

/// The predicate AST. Immutable, structurally comparable sum type; the
/// Compiler is a single exhaustive match over this enum: a closed sum type
/// in place of dynamic dispatch on AST nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PredicateNode {
    Compare(CompareOp, FieldRef, Value),
    In(FieldRef, Vec<Value>),
    NotIn(FieldRef, Vec<Value>),
    Matches(FieldRef, Pattern),
    Prefix(FieldRef, String),
    And(Vec<PredicateNode>),
    Or(Vec<PredicateNode>),
    Group(Box<PredicateNode>),
    Raw(String),
}

impl PredicateNode {
    pub fn eq_(field: FieldRef, value: impl Into<Value>) -> Self {
        PredicateNode::Compare(CompareOp::Eq, field, value.into())
    }
    pub fn not_eq(field: FieldRef, value: impl Into<Value>) -> Self {
        PredicateNode::Compare(CompareOp::NotEq, field, value.into())
    }
    pub fn gt(field: FieldRef, value: impl Into<Value>) -> Self {
        PredicateNode::Compare(CompareOp::Gt, field, value.into())
    }
    pub fn gte(field: FieldRef, value: impl Into<Value>) -> Self {
        PredicateNode::Compare(CompareOp::Gte, field, value.into())
    }
    pub fn lt(field: FieldRef, value: impl Into<Value>) -> Self {
        PredicateNode::Compare(CompareOp::Lt, field, value.into())
    }
    pub fn lte(field: FieldRef, value: impl Into<Value>) -> Self {
        PredicateNode::Compare(CompareOp::Lte, field, value.into())
    }

    /// `In`/`NotIn` reject an empty list at construction: `in_([])` is
    /// rejected.
    pub fn in_(field: FieldRef, values: Vec<Value>) -> Result<Self, crate::error::Error> {
        if values.is_empty() {
            return Err(crate::error::Error::InvalidParams(
                "in_() requires a non-empty list".into(),
            ));
        }
        Ok(PredicateNode::In(field, values))
    }
    pub fn not_in(field: FieldRef, values: Vec<Value>) -> Result<Self, crate::error::Error> {
        if values.is_empty() {
            return Err(crate::error::Error::InvalidParams(
                "not_in() requires a non-empty list".into(),
            ));
        }
        Ok(PredicateNode::NotIn(field, values))
    }

    /// Precedence used by the Compiler's parenthesization rule: comparison
    /// and membership nodes bind tightest (30), `And` is 20, `Or` is 10.
    /// `Group`/`Raw` are treated as atoms (highest precedence — never need
    /// wrapping by their parent, though `Group` always renders its own
    /// explicit parens).
    pub fn precedence(&self) -> u8 {
        match self {
            PredicateNode::And(_) => 20,
            PredicateNode::Or(_) => 10,
            _ => 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_ref_parse_joined() {
        let f = FieldRef::parse("$authors.last_name");
        assert_eq!(f.assoc.as_deref(), Some("authors"));
        assert_eq!(f.name, "last_name");
        assert!(f.is_joined());
    }

    #[test]
    fn field_ref_parse_plain() {
        let f = FieldRef::parse("brand_id");
        assert_eq!(f.assoc, None);
        assert_eq!(f.name, "brand_id");
    }

    #[test]
    fn field_ref_display_round_trips() {
        assert_eq!(FieldRef::joined("authors", "age").to_string(), "$authors.age");
        assert_eq!(FieldRef::new("brand_id").to_string(), "brand_id");
    }

    #[test]
    fn ident_validation() {
        assert!(is_valid_ident("brand_id"));
        assert!(is_valid_ident("_private"));
        assert!(!is_valid_ident("1bad"));
        assert!(!is_valid_ident("bad-name"));
        assert!(!is_valid_ident(""));
    }

    #[test]
    fn nested_list_rejected() {
        let inner = Value::List(vec![Value::Int(1)]);
        assert!(Value::list(vec![inner]).is_err());
    }

    #[test]
    fn in_rejects_empty() {
        assert!(PredicateNode::in_(FieldRef::new("x"), vec![]).is_err());
        assert!(PredicateNode::not_in(FieldRef::new("x"), vec![]).is_err());
    }

    #[test]
    fn structural_equality() {
        let a = PredicateNode::eq_(FieldRef::new("active"), true);
        let b = PredicateNode::eq_(FieldRef::new("active"), true);
        assert_eq!(a, b);
    }
}
