//! Failure types for compiling and running skill scripts.
//!
//! Three layers of errors exist:
//!
//! - [`SyntaxError`]: the program text could not be compiled. Nothing ran.
//! - [`Exception`]: a failure raised while the program was running, either by
//!   the program itself, by a builtin, or by a mediation primitive.
//! - [`ClassifiedFailure`]: the normalized, serializable shape handed back to
//!   callers. Every failure crossing the sandbox boundary ends up here.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known failure kinds.
pub mod kind {
    /// Program text could not be compiled.
    pub const SYNTAX_ERROR: &str = "SyntaxError";
    /// A mediation primitive rejected an operation.
    pub const PERMISSION_ERROR: &str = "PermissionError";
    /// The program finished without producing a result.
    pub const NO_RESPONSE_ERROR: &str = "NoResponseError";
    /// Bad operand or argument type.
    pub const TYPE_ERROR: &str = "TypeError";
    /// Right type, wrong value.
    pub const VALUE_ERROR: &str = "ValueError";
    /// Mapping key missing.
    pub const KEY_ERROR: &str = "KeyError";
    /// Call depth exceeded [`MAX_CALL_DEPTH`](crate::MAX_CALL_DEPTH).
    pub const RECURSION_ERROR: &str = "RecursionError";
    /// Catch-all runtime failure.
    pub const RUNTIME_ERROR: &str = "RuntimeError";
}

/// A position in program text. Lines and columns are 1-based.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

impl Location {
    /// Create a location.
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// The program text is malformed. Raised before anything executes.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message} ({location})")]
pub struct SyntaxError {
    /// Human-readable reason.
    pub message: String,
    /// Where the compiler gave up.
    pub location: Location,
}

impl SyntaxError {
    /// Create a syntax error at the given location.
    pub fn new(message: impl Into<String>, location: Location) -> Self {
        Self {
            message: message.into(),
            location,
        }
    }
}

/// A failure raised while a program runs.
///
/// `kind` is the class name the program would see (`ValueError`,
/// `PermissionError`, or a class the program defined itself). Fatal
/// exceptions come from mediation primitives and cannot be caught by the
/// program's own `try`/`except`.
///
/// Runtime failures only know their line; the column is reported as 0.
#[derive(Clone, Debug)]
pub struct Exception {
    kind: String,
    message: String,
    location: Option<Location>,
    fatal: bool,
}

impl Exception {
    /// Create an exception of the given kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            location: None,
            fatal: false,
        }
    }

    /// A mediation rejection. Always fatal.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::new(kind::PERMISSION_ERROR, message)
        }
    }

    /// `TypeError`
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(kind::TYPE_ERROR, message)
    }

    /// `ValueError`
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(kind::VALUE_ERROR, message)
    }

    /// `KeyError`
    pub fn key_error(message: impl Into<String>) -> Self {
        Self::new(kind::KEY_ERROR, message)
    }

    /// Mark as fatal.
    pub(crate) fn into_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    /// Record where the exception surfaced, unless a location is already set.
    pub fn at(mut self, location: Location) -> Self {
        if self.location.is_none() {
            self.location = Some(location);
        }
        self
    }

    /// The class name of this exception.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Where the exception surfaced, if known.
    pub fn location(&self) -> Option<Location> {
        self.location
    }

    /// Whether the program is forbidden from catching this exception.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for Exception {}

/// Errors returned by [`Policy::exec`](crate::Policy::exec).
#[derive(Debug, Error)]
pub enum ExecError {
    /// The program could not be compiled; nothing ran.
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),
    /// The program raised while running.
    #[error("{0}")]
    Raised(#[from] Exception),
}

impl ExecError {
    /// The class name a caller would report for this failure.
    pub fn kind(&self) -> &str {
        match self {
            ExecError::Syntax(_) => kind::SYNTAX_ERROR,
            ExecError::Raised(e) => e.kind(),
        }
    }
}

/// Sentinel for an unknown line or column.
pub const UNKNOWN_POSITION: i64 = -1;

/// The normalized failure envelope returned to callers.
///
/// The field names match the wire format editors use to highlight the
/// offending line of a submitted program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedFailure {
    /// Failure classification (`SyntaxError`, `PermissionError`, ...).
    #[serde(rename = "errorId")]
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// First line of the failing span, 1-based, or -1.
    pub line_start: i64,
    /// Last line of the failing span, 1-based, or -1.
    pub line_end: i64,
    /// First column of the failing span, or -1.
    pub span_start: i64,
    /// One past the last column of the failing span, or -1.
    pub span_end: i64,
}

impl ClassifiedFailure {
    /// Build a failure pointing at a single line/offset.
    pub fn new(kind: impl Into<String>, description: impl Into<String>, line: i64, offset: i64) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            line_start: line,
            line_end: line,
            span_start: offset,
            span_end: if offset < 0 { offset } else { offset + 1 },
        }
    }

    /// The program completed without calling its result callback.
    pub fn no_response(callback: &str) -> Self {
        Self::new(
            kind::NO_RESPONSE_ERROR,
            format!("You must call `{callback}(<output>)` at least once with your output."),
            0,
            0,
        )
    }
}

impl fmt::Display for ClassifiedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at line {}, character {}",
            self.description, self.line_start, self.span_start
        )
    }
}

impl std::error::Error for ClassifiedFailure {}

impl From<&SyntaxError> for ClassifiedFailure {
    fn from(e: &SyntaxError) -> Self {
        Self::new(
            kind::SYNTAX_ERROR,
            format!("{}: {}", kind::SYNTAX_ERROR, e.message),
            i64::from(e.location.line),
            i64::from(e.location.column),
        )
    }
}

impl From<&Exception> for ClassifiedFailure {
    fn from(e: &Exception) -> Self {
        let (line, column) = match e.location() {
            Some(loc) => (i64::from(loc.line), i64::from(loc.column)),
            None => (UNKNOWN_POSITION, UNKNOWN_POSITION),
        };
        Self::new(e.kind(), e.message(), line, column)
    }
}

impl From<&ExecError> for ClassifiedFailure {
    fn from(e: &ExecError) -> Self {
        match e {
            ExecError::Syntax(s) => s.into(),
            ExecError::Raised(r) => r.into(),
        }
    }
}

impl From<ExecError> for ClassifiedFailure {
    fn from(e: ExecError) -> Self {
        (&e).into()
    }
}
