//! Runs trusted code without mediation.

use crate::bindings::Bindings;
use crate::error::ExecError;
use crate::interpreter::Sandbox;
use crate::mediation::OutputSink;
use crate::scoped_env::EnvScope;
use crate::value::Namespace;

const NAME: &str = "Unrestricted";

/// Runs programs with no attribute or import mediation.
///
/// Output goes to the configured [`OutputSink`], host stdout unless changed.
/// The only restriction is which environment variables the program sees: a
/// snapshot is taken under the configured [`EnvScope`] at the start of every
/// invocation.
#[derive(Clone, Debug)]
pub struct UnrestrictedPolicy {
    env_scope: EnvScope,
    output: OutputSink,
    modules: Vec<Namespace>,
    span: tracing::Span,
}

impl Default for UnrestrictedPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl UnrestrictedPolicy {
    /// A policy exposing the whole process environment.
    pub fn new() -> Self {
        Self {
            env_scope: EnvScope::Full,
            output: OutputSink::Stdout,
            modules: Vec::new(),
            span: tracing::info_span!("policy", policy = NAME),
        }
    }

    /// A policy exposing only the default environment allow-list.
    pub fn scoped() -> Self {
        Self::new().with_env_scope(EnvScope::allow_list(std::iter::empty::<String>()))
    }

    /// Replace the environment scope.
    pub fn with_env_scope(mut self, scope: EnvScope) -> Self {
        self.env_scope = scope;
        self
    }

    /// Make `key` visible to programs.
    ///
    /// Has no effect when the whole environment is already visible.
    pub fn allow_env_var(&mut self, key: impl Into<String>) {
        let key = key.into();
        match &mut self.env_scope {
            EnvScope::Full => {}
            EnvScope::AllowList(keys) => {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            EnvScope::Empty => self.env_scope = EnvScope::AllowList(vec![key]),
        }
    }

    /// Send program output to `output`.
    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    /// Make a host module importable under its namespace name.
    pub fn with_module(mut self, module: Namespace) -> Self {
        self.modules.push(module);
        self
    }

    /// Record events inside a child span of `parent`.
    pub fn in_span(mut self, parent: &tracing::Span) -> Self {
        self.span = tracing::info_span!(parent: parent, "policy", policy = NAME);
        self
    }

    /// The environment scope.
    pub fn env_scope(&self) -> &EnvScope {
        &self.env_scope
    }

    /// `"Unrestricted"`
    pub fn name(&self) -> &str {
        NAME
    }

    /// Compile and run `code`. Raised failures propagate unchanged.
    pub fn exec(&self, code: &str, bindings: &mut Bindings) -> Result<(), ExecError> {
        let _entered = self.span.enter();
        Sandbox::plain(self.output.clone(), self.env_scope.capture())
            .with_modules(self.modules.iter().cloned())
            .run(code, bindings)
    }
}
