//! Rules for untrusted code.

use super::access::{ImportDecision, ModuleAccessList};
use crate::error::Exception;

/// Text appended to an import denial telling the operator how to get the
/// module anyway.
pub const DEFAULT_ESCAPE_HATCH: &str =
    "Use a self-hosted runner if you need this module.";

/// Interpreter internals reachable without a leading underscore. Frames,
/// code objects and tracebacks lead back to unguarded builtins.
pub const INSPECT_ATTRIBUTES: &[&str] = &[
    "tb_frame", "tb_next", "co_code", "f_back", "f_builtins", "f_code", "f_globals", "f_locals",
    "f_trace", "gi_frame", "gi_code", "gi_yieldfrom", "cr_await", "cr_frame", "cr_code",
    "cr_origin", "ag_code", "ag_frame",
];

/// Mediation for untrusted programs.
///
/// - Imports are checked against a [`ModuleAccessList`]. Denied paths fail,
///   allowed paths load silently, anything else loads with a warning.
/// - Names starting with `_` cannot be read, written or deleted, and
///   `hasattr` reports them absent. Module paths with such a segment are
///   denied. Both can be switched off.
/// - [`INSPECT_ATTRIBUTES`] are never reachable.
/// - Output is discarded.
///
/// Every rejection is a fatal `PermissionError`.
#[derive(Clone, Debug)]
pub struct Guards {
    modules: ModuleAccessList,
    deny_underscore: bool,
    escape_hatch: String,
}

impl Guards {
    /// Guards with the given module rules and the private-name rule on.
    pub fn new(modules: ModuleAccessList) -> Self {
        Self {
            modules,
            deny_underscore: true,
            escape_hatch: DEFAULT_ESCAPE_HATCH.to_string(),
        }
    }

    /// Switch the private-name rule.
    pub fn with_underscore_rule(mut self, enabled: bool) -> Self {
        self.deny_underscore = enabled;
        self
    }

    /// Replace the escape-hatch text of import denials.
    pub fn with_escape_hatch(mut self, text: impl Into<String>) -> Self {
        self.escape_hatch = text.into();
        self
    }

    /// Whether names starting with `_` are off limits.
    pub fn denies_private_names(&self) -> bool {
        self.deny_underscore
    }

    /// Classify an import of `path`.
    pub fn decide(&self, path: &str) -> ImportDecision {
        if self.deny_underscore && path.split('.').any(|segment| segment.starts_with('_')) {
            return ImportDecision::Denied;
        }
        self.modules.decide(path)
    }

    /// Gate an import of `path`: a fatal error when denied, one warning when
    /// unlisted.
    pub fn check_import(&self, path: &str) -> Result<ImportDecision, Exception> {
        let decision = self.decide(path);
        match decision {
            ImportDecision::Denied => {
                tracing::debug!(module = path, "import denied");
                return Err(self.import_denied(path));
            }
            ImportDecision::Unlisted => {
                tracing::warn!(imported_module = path, "skill code is importing module '{path}'");
            }
            ImportDecision::Allowed => {}
        }
        Ok(decision)
    }

    /// Gate reaching module `path` without importing it by that name: as an
    /// attribute of another module, or as a name in a `from` import. Only
    /// denials count and nothing is logged.
    pub fn check_module_reference(&self, path: &str) -> Result<(), Exception> {
        if self.modules.denies(path) {
            tracing::debug!(module = path, "module reference denied");
            return Err(self.import_denied(path));
        }
        Ok(())
    }

    fn import_denied(&self, path: &str) -> Exception {
        Exception::permission_denied(format!(
            "Module '{path}' is not allowed in skill code. {}",
            self.escape_hatch
        ))
    }

    /// Gate a read, write or delete of attribute `name`.
    pub fn check_attribute(&self, name: &str) -> Result<(), Exception> {
        if self.deny_underscore && name.starts_with('_') {
            tracing::debug!(attribute = name, "private attribute access rejected");
            return Err(Exception::permission_denied(format!(
                "Cannot access \"{name}\" because it starts with \"_\""
            )));
        }
        if INSPECT_ATTRIBUTES.contains(&name) {
            tracing::debug!(attribute = name, "interpreter attribute access rejected");
            return Err(Exception::permission_denied(format!(
                "Cannot access \"{name}\" because it is a restricted name"
            )));
        }
        Ok(())
    }

    /// Whether `hasattr` must report `name` absent.
    pub fn hides_attribute(&self, name: &str) -> bool {
        self.check_attribute(name).is_err()
    }
}
