//! Mediation primitives.
//!
//! Mediated programs are rewritten before they run so that every primitive
//! operation (attribute get/set/delete/has, item access, iteration, sequence
//! unpacking, import, print, and the write guard in front of every store)
//! calls a guard function instead of touching the object directly. The guards
//! enforce a [`Guards`] rule set; a rejection is a fatal `PermissionError`
//! the program cannot catch.
//!
//! Unmediated programs only get an [`OutputSink`] for what they print.
//! Host code is never mediated.

mod access;
mod guards;
mod output;
pub(crate) mod primitives;

pub use access::{ImportDecision, ModuleAccessList};
pub use guards::{DEFAULT_ESCAPE_HATCH, Guards, INSPECT_ATTRIBUTES};
pub use output::OutputSink;

/// Names that always resolve to the mediation primitives in mediated code.
///
/// The mediated compiler rejects any attempt to rebind them, and caller
/// bindings using these names are shadowed for the run.
pub const PRIMITIVE_NAMES: &[&str] = &["getattr", "setattr", "delattr", "hasattr", "print"];

/// Builtins mediated programs may not call at all.
pub const DENIED_BUILTINS: &[&str] = &[
    "eval", "exec", "compile", "open", "globals", "locals", "vars", "breakpoint", "input",
];

/// Guard functions the rewritten program calls. Programs cannot rebind them
/// either.
pub(crate) const GUARD_NAMES: &[&str] = &[
    "_getattr_",
    "_write_",
    "_getitem_",
    "_getiter_",
    "_slice_",
    "_unpack_sequence_",
    "_iter_unpack_sequence_",
    "_import_",
    "_import_from_",
    "_format_",
    "_mul_",
    "_mod_",
    "_inplace_",
    "_inplace_item_",
    "_inplace_attr_",
    "_check_fatal_",
    "__import__",
];

/// Largest width or precision a format spec may request, and the largest
/// sequence repetition or padding a mediated program may build.
pub const MAX_FORMAT_SIZE: u64 = 1 << 28;
