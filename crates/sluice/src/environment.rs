//! The restricted execution environment.

use crate::bindings::Bindings;
use crate::error::ExecError;
use crate::interpreter::Sandbox;
use crate::mediation::Guards;
use crate::scoped_env::EnvSnapshot;
use crate::value::Namespace;

/// Compiles untrusted text in mediated mode and runs it behind [`Guards`].
///
/// Built fresh for every invocation by the restrictive policy. The program
/// sees an empty environment snapshot, its output is discarded, and the
/// primitive names (`getattr`, `setattr`, `delattr`, `hasattr`, `print`)
/// always resolve to the guarded versions, whatever the bindings say.
#[derive(Debug)]
pub struct RestrictedEnvironment {
    guards: Guards,
    modules: Vec<Namespace>,
}

impl RestrictedEnvironment {
    /// An environment enforcing `guards`.
    pub fn new(guards: Guards) -> Self {
        Self {
            guards,
            modules: Vec::new(),
        }
    }

    /// Make host modules importable. Their imports still pass the guards.
    pub fn with_modules(mut self, modules: impl IntoIterator<Item = Namespace>) -> Self {
        self.modules.extend(modules);
        self
    }

    /// Compile and run `code` with `bindings` as its globals.
    pub fn exec(&self, code: &str, bindings: &mut Bindings) -> Result<(), ExecError> {
        Sandbox::mediated(self.guards.clone(), EnvSnapshot::empty())
            .with_modules(self.modules.iter().cloned())
            .run(code, bindings)
    }
}
