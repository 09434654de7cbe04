//! Pure AST → filter string compiler.
//!
//! `compile()` is the single public entry point: it takes the relation's
//! accumulated predicate list (an implicit top-level conjunction) and
//! renders the backend's filter grammar, including join folding. The
//! function is O(N) in node count and allocates only the output string plus
//! small per-level scratch vectors — no recursion beyond the AST's own
//! nesting depth.

use crate::ast::{CompareOp, FieldRef, PredicateNode, Value};
use crate::error::Error;
use crate::sanitizer::{quote, quote_list};

const PREC_OR: u8 = 10;
const PREC_AND: u8 = 20;
const PREC_ATOM: u8 = 30;

/// Compiles a relation's accumulated predicate list. An empty list compiles
/// to an empty string (callers omit `filter_by` entirely in that case).
pub fn compile(nodes: &[PredicateNode]) -> Result<String, Error> {
    compile_conjunction(nodes)
}

fn op_str(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => ":=",
        CompareOp::NotEq => ":!=",
        CompareOp::Gt => ":>",
        CompareOp::Gte => ":>=",
        CompareOp::Lt => ":<",
        CompareOp::Lte => ":<=",
    }
}

/// Renders `field OP value` with a *plain* (non-prefixed) field name — used
/// both for non-joined predicates and for the inner expression of a
/// `$assoc(...)` token.
fn render_compare(field: &str, op: CompareOp, value: &Value) -> Result<String, Error> {
    Ok(format!("{}{}{}", field, op_str(op), quote(value)?))
}

fn render_in(field: &str, op_neg: bool, values: &[Value]) -> Result<String, Error> {
    let op = if op_neg { ":!=" } else { ":=" };
    Ok(format!("{}{}{}", field, op, quote_list(values)?))
}

/// If `node` is a binary/membership predicate on a joined field, returns
/// `(assoc, inner_rendering)` using the plain (non-prefixed) field name, as
/// required inside a `$assoc(...)` token. Returns `Ok(None)` for anything
/// else (including non-joined predicates and pattern/boolean/raw nodes).
fn joined_predicate_inner(node: &PredicateNode) -> Result<Option<(String, String)>, Error> {
    match node {
        PredicateNode::Compare(op, field, value) if field.is_joined() => {
            let inner = render_compare(&field.name, *op, value)?;
            Ok(Some((field.assoc.clone().unwrap(), inner)))
        }
        PredicateNode::In(field, values) if field.is_joined() => {
            let inner = render_in(&field.name, false, values)?;
            Ok(Some((field.assoc.clone().unwrap(), inner)))
        }
        PredicateNode::NotIn(field, values) if field.is_joined() => {
            let inner = render_in(&field.name, true, values)?;
            Ok(Some((field.assoc.clone().unwrap(), inner)))
        }
        _ => Ok(None),
    }
}

enum Slot {
    Plain(String),
    Join(String, Vec<String>),
    Consumed,
}

/// Renders an implicit-AND list of sibling nodes, folding same-association
/// joined predicates into a single `$assoc(p1 && p2 …)` token emitted at the
/// first position that association appeared at; other children keep their
/// relative position.
fn compile_conjunction(children: &[PredicateNode]) -> Result<String, Error> {
    use std::collections::HashMap;

    let mut assoc_first: HashMap<String, usize> = HashMap::new();
    let mut slots: Vec<Slot> = Vec::with_capacity(children.len());
    for _ in children {
        slots.push(Slot::Consumed);
    }

    for (i, child) in children.iter().enumerate() {
        if let Some((assoc, inner)) = joined_predicate_inner(child)? {
            let first = *assoc_first.entry(assoc.clone()).or_insert(i);
            if first == i {
                slots[i] = Slot::Join(assoc, vec![inner]);
            } else if let Slot::Join(_, parts) = &mut slots[first] {
                parts.push(inner);
            }
        } else {
            slots[i] = Slot::Plain(compile_child(child, PREC_AND)?);
        }
    }

    let mut out = Vec::with_capacity(slots.len());
    for slot in slots {
        match slot {
            Slot::Plain(s) => out.push(s),
            Slot::Join(assoc, parts) => out.push(format!("${}({})", assoc, parts.join(" && "))),
            Slot::Consumed => {}
        }
    }
    Ok(out.join(" && "))
}

/// Renders an n-ary OR. When a child is an AND, it is always wrapped for
/// clarity — applied to every non-leading child so the rule is
/// well-defined for n-ary lists.
fn compile_disjunction(children: &[PredicateNode]) -> Result<String, Error> {
    let mut parts = Vec::with_capacity(children.len());
    for (i, child) in children.iter().enumerate() {
        let force_wrap = i > 0 && matches!(child, PredicateNode::And(_));
        if force_wrap {
            parts.push(format!("({})", compile_child(child, 0)?));
        } else {
            parts.push(compile_child(child, PREC_OR)?);
        }
    }
    Ok(parts.join(" || "))
}

/// Renders `node` as a child of a parent with precedence `parent_prec`,
/// wrapping in parens iff `node.precedence() < parent_prec`.
fn compile_child(node: &PredicateNode, parent_prec: u8) -> Result<String, Error> {
    let rendered = compile_node(node)?;
    if node.precedence() < parent_prec {
        Ok(format!("({})", rendered))
    } else {
        Ok(rendered)
    }
}

fn compile_node(node: &PredicateNode) -> Result<String, Error> {
    match node {
        PredicateNode::Compare(op, field, value) => {
            if field.is_joined() {
                let inner = render_compare(&field.name, *op, value)?;
                Ok(format!("${}({})", field.assoc.as_ref().unwrap(), inner))
            } else {
                render_compare(&field.name, *op, value)
            }
        }
        PredicateNode::In(field, values) => {
            if field.is_joined() {
                let inner = render_in(&field.name, false, values)?;
                Ok(format!("${}({})", field.assoc.as_ref().unwrap(), inner))
            } else {
                render_in(&field.name, false, values)
            }
        }
        PredicateNode::NotIn(field, values) => {
            if field.is_joined() {
                let inner = render_in(&field.name, true, values)?;
                Ok(format!("${}({})", field.assoc.as_ref().unwrap(), inner))
            } else {
                render_in(&field.name, true, values)
            }
        }
        PredicateNode::Matches(field, _) => Err(Error::UnsupportedNode(format!(
            "Matches({}) is not supported by the target filter grammar",
            field
        ))),
        PredicateNode::Prefix(field, _) => Err(Error::UnsupportedNode(format!(
            "Prefix({}) is not supported by the target filter grammar",
            field
        ))),
        PredicateNode::And(children) => compile_conjunction(children),
        PredicateNode::Or(children) => compile_disjunction(children),
        PredicateNode::Group(inner) => Ok(format!("({})", compile_node(inner)?)),
        PredicateNode::Raw(s) => Ok(s.clone()),
    }
}
