//! Typed error taxonomy for the query/indexing engine.
//!
//! Every fallible boundary in this crate returns [`Error`]. The variants are
//! the taxonomy kinds named by the design: no stringly-typed error codes,
//! one closed enum. `kind()` gives callers a coarse category without
//! matching every variant; `http_status()` and `is_retryable()` mirror the
//! propagation policy (local recovery on 404, indexer-only retries).

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse category, used by callers that want to branch on "is this a user
/// mistake, a backend outage, or a bug" without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Validation,
    Backend,
    Unsupported,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timed out talking to the backend")]
    Timeout,

    #[error("connection to the backend failed: {0}")]
    Connection(String),

    #[error("backend returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("invalid field `{field}`{suggestion}")]
    InvalidField { field: String, suggestion: String },

    #[error("unknown field `{field}`{suggestion}")]
    UnknownField { field: String, suggestion: String },

    #[error("unknown join `{join}`{suggestion}")]
    UnknownJoin { join: String, suggestion: String },

    #[error("invalid join `{0}`")]
    InvalidJoin(String),

    #[error("join `{0}` was declared but never applied to a predicate")]
    JoinNotApplied(String),

    #[error("unknown field `{field}` on join `{join}`{suggestion}")]
    UnknownJoinField {
        join: String,
        field: String,
        suggestion: String,
    },

    #[error("conflicting selection: {0}")]
    ConflictingSelection(String),

    #[error("invalid operator `{0}`")]
    InvalidOperator(String),

    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("invalid group: {0}")]
    InvalidGroup(String),

    #[error("field `{0}` does not support grouping/joins")]
    UnsupportedGroupField(String),

    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("invalid curated id `{0}`")]
    InvalidCuratedId(String),

    #[error("curation limit exceeded: {have} > {limit}")]
    CurationLimitExceeded { have: usize, limit: usize },

    #[error("invalid override tag `{0}`")]
    InvalidOverrideTag(String),

    #[error("node `{0}` is not supported by the target filter grammar")]
    UnsupportedNode(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout | Error::Connection(_) => ErrorKind::Transport,
            Error::Api { .. } => ErrorKind::Backend,
            Error::UnsupportedNode(_) => ErrorKind::Unsupported,
            _ => ErrorKind::Validation,
        }
    }

    /// HTTP status this error would be reported as, if it originated from
    /// (or is analogous to) a backend response. `None` for purely local
    /// validation errors that never reach an HTTP boundary.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Timeout => Some(504),
            Error::Connection(_) => Some(502),
            Error::Api { status, .. } => Some(*status),
            Error::InvalidParams(_)
            | Error::InvalidField { .. }
            | Error::InvalidOperator(_)
            | Error::InvalidType(_)
            | Error::InvalidGroup(_)
            | Error::InvalidSelection(_)
            | Error::InvalidCuratedId(_)
            | Error::InvalidOverrideTag(_)
            | Error::ConflictingSelection(_)
            | Error::InvalidJoin(_) => Some(400),
            Error::UnknownField { .. }
            | Error::UnknownJoin { .. }
            | Error::UnknownJoinField { .. }
            | Error::MissingField(_) => Some(404),
            Error::JoinNotApplied(_) | Error::UnsupportedGroupField(_) | Error::UnsupportedNode(_) => {
                Some(422)
            }
            Error::CurationLimitExceeded { .. } => Some(413),
        }
    }

    /// Whether the Indexer's retry policy should retry this error:
    /// `Timeout|Connection|429|5xx`. All other errors propagate immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout | Error::Connection(_) => true,
            Error::Api { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }

    /// Whether this is a 413 (payload too large) from the backend, which the
    /// Indexer handles by bisecting the batch rather than retrying verbatim.
    pub fn is_payload_too_large(&self) -> bool {
        matches!(self, Error::Api { status: 413, .. })
    }

    pub fn unknown_field(field: impl Into<String>, known: &[String]) -> Self {
        let field = field.into();
        let suggestion = did_you_mean(&field, known);
        Error::UnknownField { field, suggestion }
    }

    pub fn unknown_join(join: impl Into<String>, known: &[String]) -> Self {
        let join = join.into();
        let suggestion = did_you_mean(&join, known);
        Error::UnknownJoin { join, suggestion }
    }

    pub fn unknown_join_field(join: impl Into<String>, field: impl Into<String>, known: &[String]) -> Self {
        let join = join.into();
        let field = field.into();
        let suggestion = did_you_mean(&field, known);
        Error::UnknownJoinField { join, field, suggestion }
    }
}

/// Produces a short `" (did you mean `x`?)"` suffix, or an empty string when
/// nothing in `known` is close enough to be a plausible typo fix.
pub(crate) fn did_you_mean(given: &str, known: &[String]) -> String {
    const MAX_DISTANCE: usize = 2;
    let mut best: Option<(&str, usize)> = None;
    for candidate in known {
        let d = levenshtein(given, candidate);
        if d <= MAX_DISTANCE && best.map(|(_, bd)| d < bd).unwrap_or(true) {
            best = Some((candidate.as_str(), d));
        }
    }
    match best {
        Some((name, _)) => format!(" (did you mean `{}`?)", name),
        None => String::new(),
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    let mut prev: Vec<usize> = (0..=m).collect();
    let mut cur = vec![0usize; m + 1];
    for i in 1..=n {
        cur[0] = i;
        for j in 1..=m {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[m]
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Validation => "validation",
            ErrorKind::Backend => "backend",
            ErrorKind::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(Error::Timeout.http_status(), Some(504));
        assert_eq!(Error::Api { status: 404, body: "x".into() }.http_status(), Some(404));
        assert_eq!(Error::InvalidParams("bad".into()).http_status(), Some(400));
    }

    #[test]
    fn retryable_kinds() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Connection("down".into()).is_retryable());
        assert!(Error::Api { status: 429, body: String::new() }.is_retryable());
        assert!(Error::Api { status: 503, body: String::new() }.is_retryable());
        assert!(!Error::Api { status: 404, body: String::new() }.is_retryable());
        assert!(!Error::InvalidParams("x".into()).is_retryable());
    }

    #[test]
    fn payload_too_large() {
        assert!(Error::Api { status: 413, body: String::new() }.is_payload_too_large());
        assert!(!Error::Api { status: 400, body: String::new() }.is_payload_too_large());
    }

    #[test]
    fn did_you_mean_suggests_close_typo() {
        let known = vec!["brand_id".to_string(), "active".to_string()];
        let e = Error::unknown_field("brand_di", &known);
        match e {
            Error::UnknownField { suggestion, .. } => assert!(suggestion.contains("brand_id")),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn did_you_mean_silent_when_nothing_close() {
        let known = vec!["brand_id".to_string()];
        let e = Error::unknown_field("completely_different", &known);
        match e {
            Error::UnknownField { suggestion, .. } => assert!(suggestion.is_empty()),
            _ => panic!("wrong variant"),
        }
    }
}
