//! Sluice: capability-mediated sandbox for skill scripts
//!
//! Sluice runs short programs ("skills") submitted by untrusted users inside a
//! shared host. Every primitive operation a program performs (attribute
//! access, indexing, iteration, unpacking, imports, output) passes through a
//! policy-controlled gate, and every failure comes back as a serializable
//! [`ClassifiedFailure`].
//!
//! Programs are Python, run by an embedded RustPython interpreter. Values
//! cross the boundary as [`Value`]s.
//!
//! ```no_run
//! use sluice::{Bindings, get_policy};
//!
//! let policy = get_policy(Some("restrictive"), &tracing::Span::current());
//! let mut bindings = Bindings::new();
//! policy.exec("total = sum([1, 2, 3])\n", &mut bindings)?;
//! assert_eq!(bindings.get("total").and_then(|v| v.as_int()), Some(6));
//! # Ok::<(), sluice::ExecError>(())
//! ```

mod bindings;
mod config;
mod environment;
mod error;
mod interpreter;
mod policy;
mod runner;
mod scoped_env;
mod value;

pub mod mediation;

pub use bindings::Bindings;
pub use config::{ConfigError, POLICY_ENV_VAR, SANDBOXED_ENV_VAR, SandboxConfig};
pub use environment::RestrictedEnvironment;
pub use interpreter::MAX_CALL_DEPTH;
pub use error::{
    ClassifiedFailure, Exception, ExecError, Location, SyntaxError, UNKNOWN_POSITION, kind,
};
pub use policy::{DEFAULT_ALLOWED_MODULES, Policy, RestrictivePolicy, UnrestrictedPolicy, get_policy};
pub use runner::{REPLY_CALLBACK, Reply, ReplySink, SkillRunResponse, SkillRunner};
pub use scoped_env::{DEFAULT_ENV_ALLOWLIST, EnvScope, EnvSnapshot};
pub use value::{HostFn, HostFunction, Namespace, Opaque, Value};
