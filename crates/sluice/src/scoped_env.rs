//! Per-invocation view of the process environment.
//!
//! Programs never read the process environment table directly. Each
//! invocation captures an [`EnvSnapshot`] up front and the interpreter's
//! `os.environ` is replaced by a plain dict built from it; `os.putenv` and
//! `os.unsetenv` edit that dict. The process table itself is never written,
//! so concurrent invocations cannot observe each other and nothing needs to
//! be restored when a program fails.

use std::collections::BTreeMap;

/// Keys a scoped snapshot keeps unless the caller extends the list.
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "HOME", "LANG", "LANGUAGE", "LC_ALL", "LC_CTYPE", "PATH", "TEMP", "TMP", "TMPDIR", "TZ",
];

/// How much of the process environment a program sees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvScope {
    /// The whole process environment.
    Full,
    /// Only the listed keys.
    AllowList(Vec<String>),
    /// Nothing.
    Empty,
}

impl EnvScope {
    /// The default allow-list, extended with `extra` keys.
    pub fn allow_list<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = DEFAULT_ENV_ALLOWLIST.iter().map(|k| (*k).to_string()).collect();
        for key in extra {
            let key = key.into();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        EnvScope::AllowList(keys)
    }

    /// Capture the process environment under this scope.
    ///
    /// Variables whose name or value is not valid UTF-8 are left out.
    pub fn capture(&self) -> EnvSnapshot {
        match self {
            EnvScope::Full => {
                let mut skipped = 0usize;
                let snapshot = EnvSnapshot::from_pairs(std::env::vars_os().filter_map(|(k, v)| {
                    match (k.into_string(), v.into_string()) {
                        (Ok(k), Ok(v)) => Some((k, v)),
                        _ => {
                            skipped += 1;
                            None
                        }
                    }
                }));
                if skipped > 0 {
                    tracing::debug!(skipped, "left non-UTF-8 variables out of the environment");
                }
                snapshot
            }
            EnvScope::AllowList(keys) => {
                let snapshot = EnvSnapshot::from_pairs(
                    keys.iter()
                        .filter_map(|k| std::env::var(k).ok().map(|v| (k.clone(), v))),
                );
                tracing::debug!(
                    visible = snapshot.len(),
                    allowed = keys.len(),
                    "captured scoped environment"
                );
                snapshot
            }
            EnvScope::Empty => EnvSnapshot::empty(),
        }
    }
}

/// An immutable copy of environment variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// A snapshot with no variables.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A snapshot of exactly these pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Look a variable up.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// All variables, sorted by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
