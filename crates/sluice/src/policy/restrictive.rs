//! Runs untrusted code behind the mediation guards.

use crate::bindings::Bindings;
use crate::environment::RestrictedEnvironment;
use crate::error::ExecError;
use crate::mediation::{DEFAULT_ESCAPE_HATCH, Guards, ModuleAccessList};
use crate::value::Namespace;

const NAME: &str = "Restrictive";

/// Runs programs in a [`RestrictedEnvironment`].
///
/// Module rules are additive: allowing or denying a path never removes an
/// earlier rule, and a denial always wins over an allowance. A fresh
/// environment is built for every [`exec`](Self::exec).
#[derive(Clone, Debug)]
pub struct RestrictivePolicy {
    modules: ModuleAccessList,
    deny_underscore_attributes: bool,
    escape_hatch: String,
    host_modules: Vec<Namespace>,
    span: tracing::Span,
}

impl Default for RestrictivePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RestrictivePolicy {
    /// A policy with empty module lists: every import is unlisted.
    pub fn new() -> Self {
        Self {
            modules: ModuleAccessList::new(),
            deny_underscore_attributes: true,
            escape_hatch: DEFAULT_ESCAPE_HATCH.to_string(),
            host_modules: Vec::new(),
            span: tracing::info_span!("policy", policy = NAME),
        }
    }

    /// Allow `path` and everything below it.
    pub fn allow_module(&mut self, path: impl Into<String>) {
        self.modules.allow(path);
    }

    /// Allow each of `paths`.
    pub fn allow_modules<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in paths {
            self.modules.allow(path);
        }
    }

    /// Deny `path` and everything below it.
    pub fn deny_module(&mut self, path: impl Into<String>) {
        self.modules.deny(path);
    }

    /// Deny each of `paths`.
    pub fn deny_modules<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for path in paths {
            self.modules.deny(path);
        }
    }

    /// Switch the rule rejecting names that start with `_`. On by default.
    pub fn set_deny_underscore_attributes(&mut self, enabled: bool) {
        self.deny_underscore_attributes = enabled;
    }

    /// Replace the text appended to import denials.
    pub fn with_escape_hatch(mut self, text: impl Into<String>) -> Self {
        self.escape_hatch = text.into();
        self
    }

    /// Make a host module importable under its namespace name.
    ///
    /// Imports of it still go through the module rules.
    pub fn with_module(mut self, module: Namespace) -> Self {
        self.host_modules.push(module);
        self
    }

    /// Record events inside a child span of `parent`.
    pub fn in_span(mut self, parent: &tracing::Span) -> Self {
        self.span = tracing::info_span!(parent: parent, "policy", policy = NAME);
        self
    }

    /// The module rules.
    pub fn modules(&self) -> &ModuleAccessList {
        &self.modules
    }

    /// `"Restrictive"`
    pub fn name(&self) -> &str {
        NAME
    }

    /// Compile and run `code` in a fresh restricted environment.
    pub fn exec(&self, code: &str, bindings: &mut Bindings) -> Result<(), ExecError> {
        let _entered = self.span.enter();
        let guards = Guards::new(self.modules.clone())
            .with_underscore_rule(self.deny_underscore_attributes)
            .with_escape_hatch(self.escape_hatch.clone());
        RestrictedEnvironment::new(guards)
            .with_modules(self.host_modules.iter().cloned())
            .exec(code, bindings)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_deny_wins_over_allow() {
        let mut policy = RestrictivePolicy::new();
        policy.allow_modules(["json", "os"]);
        policy.deny_module("os");
        let mut bindings = Bindings::new();
        let err = policy.exec("import os.path\n", &mut bindings).unwrap_err();
        assert_eq!(err.kind(), "PermissionError");
        assert!(err.to_string().contains("Module 'os.path' is not allowed"));
        policy.exec("import json\n", &mut bindings).unwrap();
    }

    #[test]
    fn test_custom_escape_hatch() {
        let mut policy = RestrictivePolicy::new().with_escape_hatch("Ask an admin.");
        policy.deny_modules(["socket"]);
        let err = policy.exec("import socket\n", &mut Bindings::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "PermissionError: Module 'socket' is not allowed in skill code. Ask an admin."
        );
    }

    #[test]
    fn test_underscore_rule_can_be_disabled() {
        let obj = Namespace::new("client").with("_token", "t");
        let mut bindings = Bindings::new();
        bindings.insert("client", obj);

        let mut policy = RestrictivePolicy::new();
        let err = policy.exec("t = client._token\n", &mut bindings).unwrap_err();
        assert_eq!(err.kind(), "PermissionError");

        policy.set_deny_underscore_attributes(false);
        policy.exec("t = client._token\n", &mut bindings).unwrap();
        assert_eq!(bindings.get("t").unwrap().as_str(), Some("t"));
    }

    #[test]
    fn test_host_modules_follow_the_module_rules() {
        let module = Namespace::new("greeting").with("text", "hi");
        let mut policy = RestrictivePolicy::new().with_module(module);
        policy.allow_module("greeting");
        let mut bindings = Bindings::new();
        policy.exec("from greeting import text\n", &mut bindings).unwrap();
        assert_eq!(bindings.get("text").unwrap().as_str(), Some("hi"));

        policy.deny_module("greeting");
        let err = policy.exec("import greeting\n", &mut bindings).unwrap_err();
        assert_eq!(err.kind(), "PermissionError");
    }

    #[test]
    fn test_environment_is_empty() {
        let mut policy = RestrictivePolicy::new();
        policy.allow_module("os");
        let mut bindings = Bindings::new();
        policy
            .exec("import os\nn = len(os.environ)\nhome = os.getenv('HOME')\n", &mut bindings)
            .unwrap();
        assert_eq!(bindings.get("n").unwrap().as_int(), Some(0));
        assert!(matches!(bindings.get("home"), Some(Value::None)));
    }
}
