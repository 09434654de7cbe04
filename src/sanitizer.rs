//! Filter literal quoting/escaping and placeholder templating.
//!
//! Kept deliberately small and pure: every function here is a leaf the
//! Compiler calls into, never the other way around.

use crate::ast::Value;
use crate::error::Error;

/// Quotes a scalar for embedding in a filter expression. Booleans/integers/
/// floats are emitted unquoted; strings are backtick-quoted with embedded
/// backticks escaped; `Null` is rejected (the backend grammar has no literal
/// for it).
pub fn quote(value: &Value) -> Result<String, Error> {
    match value {
        Value::Null => Err(Error::InvalidType("null is not a valid filter literal".into())),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(format_float(*f)),
        Value::String(s) => Ok(quote_string(s)),
        Value::List(_) => Err(Error::InvalidType(
            "quote() does not accept lists; use quote_list()".into(),
        )),
    }
}

/// Quotes a non-empty list as `[v1,v2,...]`.
pub fn quote_list(values: &[Value]) -> Result<String, Error> {
    if values.is_empty() {
        return Err(Error::InvalidParams("membership list must not be empty".into()));
    }
    let mut parts = Vec::with_capacity(values.len());
    for v in values {
        parts.push(quote(v)?);
    }
    Ok(format!("[{}]", parts.join(",")))
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('`');
    for c in s.chars() {
        if c == '`' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('`');
    out
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() {
        format!("{:.1}", f)
    } else {
        f.to_string()
    }
}

/// Replaces `?` placeholders left-to-right with quoted args. `\?` escapes to
/// a literal `?`. Errors when the number of unescaped `?` does not match the
/// number of supplied args: an arity mismatch raises.
pub fn apply_placeholders(template: &str, args: &[Value]) -> Result<String, Error> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut arg_idx = 0usize;
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'?') {
            chars.next();
            out.push('?');
            continue;
        }
        if c == '?' {
            let arg = args.get(arg_idx).ok_or_else(|| {
                Error::InvalidParams(format!(
                    "placeholder arity mismatch: template has more `?` than the {} supplied arg(s)",
                    args.len()
                ))
            })?;
            out.push_str(&quote(arg)?);
            arg_idx += 1;
            continue;
        }
        out.push(c);
    }
    if arg_idx != args.len() {
        return Err(Error::InvalidParams(format!(
            "placeholder arity mismatch: template used {} `?` but {} arg(s) were supplied",
            arg_idx,
            args.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_scalars() {
        assert_eq!(quote(&Value::Bool(true)).unwrap(), "true");
        assert_eq!(quote(&Value::Int(3)).unwrap(), "3");
        assert_eq!(quote(&Value::String("Rowling".into())).unwrap(), "`Rowling`");
    }

    #[test]
    fn quote_null_rejected() {
        assert!(quote(&Value::Null).is_err());
    }

    #[test]
    fn quote_string_escapes_backticks() {
        assert_eq!(quote(&Value::String("a`b".into())).unwrap(), "`a\\`b`");
    }

    #[test]
    fn quote_list_basic() {
        let list = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
        assert_eq!(quote_list(&list).unwrap(), "[1,2,3]");
    }

    #[test]
    fn quote_list_rejects_empty() {
        assert!(quote_list(&[]).is_err());
    }

    #[test]
    fn placeholders_basic() {
        let out = apply_placeholders("a = ?", &[Value::Int(1)]).unwrap();
        assert_eq!(out, "a = 1");
    }

    #[test]
    fn placeholders_escaped_literal() {
        let out = apply_placeholders("a \\? b = ?", &[Value::Int(1)]).unwrap();
        assert_eq!(out, "a ? b = 1");
    }

    #[test]
    fn placeholders_arity_mismatch() {
        assert!(apply_placeholders("a = ?", &[Value::Int(1), Value::Int(2)]).is_err());
        assert!(apply_placeholders("a = ? and b = ?", &[Value::Int(1)]).is_err());
    }

    #[test]
    fn no_unescaped_question_mark_in_output() {
        let out = apply_placeholders("a = \\?", &[]).unwrap();
        assert!(!out.contains('?') || out == "a = ?");
        assert_eq!(out, "a = ?");
    }
}
