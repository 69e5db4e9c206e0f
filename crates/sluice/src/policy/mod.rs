//! Execution policies and the registry that selects them by name.

mod restrictive;
mod unrestricted;

pub use restrictive::RestrictivePolicy;
pub use unrestricted::UnrestrictedPolicy;

use crate::bindings::Bindings;
use crate::error::ExecError;
use crate::mediation::OutputSink;

/// Modules a restrictive policy from [`get_policy`] allows without a warning.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    // Standard library
    "abc",
    "argparse",
    "array",
    "ast",
    "asyncio",
    "base64",
    "binascii",
    "binhex",
    "bisect",
    "calendar",
    "cmath",
    "collections",
    "colorsys",
    "contextlib",
    "copy",
    "copyreg",
    "csv",
    "dataclasses",
    "datetime",
    "decimal",
    "difflib",
    "email",
    "enum",
    "errno",
    "fractions",
    "functools",
    "getopt",
    "gettext",
    "glob",
    "graphlib",
    "hashlib",
    "heapq",
    "hmac",
    "html",
    "http",
    "io",
    "ipaddress",
    "itertools",
    "json",
    "keyword",
    "locale",
    "math",
    "mimetypes",
    "netrc",
    "numbers",
    "pathlib",
    "plistlib",
    "pprint",
    "queue",
    "quopri",
    "random",
    "re",
    "reprlib",
    "secrets",
    "statistics",
    "string",
    "stringprep",
    "textwrap",
    "time",
    "timeit",
    "types",
    "typing",
    "unicodedata",
    "urllib",
    "uuid",
    "xml",
    "zoneinfo",
    // Third party
    "azure",
    "boto3",
    "bs4",
    "cryptography",
    "dns",
    "ecdsa",
    "google",
    "grpc",
    "isodate",
    "jmespath",
    "jsonpickle",
    "kubernetes",
    "msal",
    "mysql",
    "mysqlx",
    "nltk",
    "nludb",
    "numpy",
    "octokit",
    "octokit_routes",
    "pandas",
    "pandas_gbq",
    "pyarrow",
    "PyYAML",
    "regex",
    "requests",
    "requests_oauthlib",
    "rsa",
    "soupsieve",
    "sqlalchemy",
    "toml",
    "twilio",
    "websocket",
];

/// A way of running program text.
///
/// Both variants share one contract: compile `code`, run it with `bindings`
/// as globals, and write the resulting globals back into `bindings`. Policies
/// are `Send + Sync` and can be shared between invocations once configured.
#[derive(Clone, Debug)]
pub enum Policy {
    /// No mediation. See [`UnrestrictedPolicy`].
    Unrestricted(UnrestrictedPolicy),
    /// Full mediation. See [`RestrictivePolicy`].
    Restrictive(RestrictivePolicy),
}

impl Policy {
    /// Display name, as logged by the skill runner.
    pub fn name(&self) -> &str {
        match self {
            Policy::Unrestricted(p) => p.name(),
            Policy::Restrictive(p) => p.name(),
        }
    }

    /// Send what unrestricted programs print to `output`. Restrictive
    /// programs print nowhere whatever the sink.
    pub fn with_output(self, output: OutputSink) -> Self {
        match self {
            Policy::Unrestricted(p) => p.with_output(output).into(),
            restrictive @ Policy::Restrictive(_) => restrictive,
        }
    }

    /// Run `code` with `bindings` as its globals.
    ///
    /// The program runs to completion on a dedicated interpreter thread with
    /// its own stack, so callers need no particular stack size; call depth is
    /// bounded by [`MAX_CALL_DEPTH`](crate::MAX_CALL_DEPTH).
    pub fn exec(&self, code: &str, bindings: &mut Bindings) -> Result<(), ExecError> {
        match self {
            Policy::Unrestricted(p) => p.exec(code, bindings),
            Policy::Restrictive(p) => p.exec(code, bindings),
        }
    }
}

impl From<UnrestrictedPolicy> for Policy {
    fn from(policy: UnrestrictedPolicy) -> Self {
        Policy::Unrestricted(policy)
    }
}

impl From<RestrictivePolicy> for Policy {
    fn from(policy: RestrictivePolicy) -> Self {
        Policy::Restrictive(policy)
    }
}

/// Select a policy by name. Never fails.
///
/// Names are matched ignoring ASCII case:
///
/// - `none`, `unrestricted`: [`UnrestrictedPolicy`] seeing the whole process
///   environment.
/// - `permissive`: [`UnrestrictedPolicy`] seeing only the default environment
///   allow-list.
/// - anything else, including no name: [`RestrictivePolicy`] allowing
///   [`DEFAULT_ALLOWED_MODULES`].
///
/// The policy records its events inside a child span of `parent`.
pub fn get_policy(name: Option<&str>, parent: &tracing::Span) -> Policy {
    let requested = name.unwrap_or_default().to_ascii_lowercase();
    let policy: Policy = match requested.as_str() {
        "none" | "unrestricted" => UnrestrictedPolicy::new().in_span(parent).into(),
        "permissive" => UnrestrictedPolicy::scoped().in_span(parent).into(),
        _ => {
            let mut policy = RestrictivePolicy::new().in_span(parent);
            policy.allow_modules(DEFAULT_ALLOWED_MODULES.iter().copied());
            policy.into()
        }
    };
    tracing::debug!(requested = %requested, selected = policy.name(), "selected policy");
    policy
}
